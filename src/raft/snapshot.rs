// Snapshot file store: one file per snapshot, named by term and index
// Writes are atomic (temp file + rename); loads prefer the newest valid file

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crc32c::crc32c;
use prost::Message;
use raft::eraftpb::Snapshot;
use tracing::{info, warn};

use crate::error::Error;
use crate::raft::wal::ensure_dir;

/// Durable store of raft snapshots under `<datadir>/snap/`. A snapshot file
/// is `crc32c(payload) | payload` where the payload is the wire-encoded
/// snapshot. Partial or corrupt files are never returned from a load; they
/// are renamed aside and the next-newest file wins.
#[derive(Debug)]
pub struct SnapStore {
    dir: PathBuf,
}

impl SnapStore {
    pub fn new(dir: &Path) -> Result<Self, Error> {
        ensure_dir(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    /// Persists a snapshot atomically.
    pub fn save(&self, snapshot: &Snapshot) -> Result<(), Error> {
        let meta = snapshot.get_metadata();
        let name = format!("{:016x}-{:016x}.snap", meta.term, meta.index);
        let tmp_path = self.dir.join(format!("{name}.tmp"));
        let final_path = self.dir.join(&name);

        let payload = snapshot.encode_to_vec();
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        file.write_all(&crc32c(&payload).to_le_bytes())?;
        file.write_all(&payload)?;
        file.sync_all()?;
        fs::rename(&tmp_path, &final_path)?;
        File::open(&self.dir)?.sync_all()?;

        info!(index = meta.index, term = meta.term, "saved snapshot");
        Ok(())
    }

    /// Loads the newest valid snapshot, or `None` when the store is empty.
    pub fn load(&self) -> Result<Option<Snapshot>, Error> {
        let mut names: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.extension().map_or(false, |ext| ext == "snap"))
            .collect();
        names.sort();
        for path in names.into_iter().rev() {
            match read_snapshot(&path) {
                Ok(snapshot) => {
                    info!(
                        index = snapshot.get_metadata().index,
                        file = %path.display(),
                        "loaded snapshot"
                    );
                    return Ok(Some(snapshot));
                }
                Err(err) => {
                    warn!(file = %path.display(), %err, "skipping unreadable snapshot");
                    let broken = path.with_extension("snap.broken");
                    if let Err(err) = fs::rename(&path, &broken) {
                        warn!(file = %path.display(), %err, "could not move broken snapshot aside");
                    }
                }
            }
        }
        Ok(None)
    }
}

fn read_snapshot(path: &Path) -> Result<Snapshot, Error> {
    let bytes = fs::read(path)?;
    if bytes.len() < 4 {
        return Err(Error::SnapshotCorrupt("file shorter than checksum".to_string()));
    }
    let expected = u32::from_le_bytes(bytes[..4].try_into().unwrap());
    let payload = &bytes[4..];
    let actual = crc32c(payload);
    if actual != expected {
        return Err(Error::SnapshotCorrupt(format!(
            "checksum mismatch: {expected:#010x} != {actual:#010x}"
        )));
    }
    Ok(Snapshot::decode(payload)?)
}
