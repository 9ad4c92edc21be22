// Append-only segmented write-ahead log for raft hard state and entries
// Frames are crc32c-checksummed; save is a durability barrier (fsync)

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};

use crc32c::crc32c;
use prost::Message;
use raft::eraftpb::{Entry, HardState};
use tracing::{debug, info, warn};

use crate::error::Error;

const FRAME_MAGIC: u32 = 0x4150_5731; // "APW1"
const FRAME_HEADER_LEN: usize = 13;

/// Record kinds carried by WAL frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RecordKind {
    /// ASCII decimal node id; first record of every segment.
    Metadata = 1,
    /// A raft log entry.
    Entry = 2,
    /// The raft hard state at the time of the save.
    HardState = 3,
    /// Marks that a snapshot at (index, term) was persisted.
    Snapshot = 4,
}

impl RecordKind {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(RecordKind::Metadata),
            2 => Some(RecordKind::Entry),
            3 => Some(RecordKind::HardState),
            4 => Some(RecordKind::Snapshot),
            _ => None,
        }
    }
}

/// Segmented write-ahead log. Segments are named `<seq>-<firstindex>.wal`
/// and begin with a metadata record holding the owning node id, so opening a
/// WAL written by a different node fails loudly instead of replaying it.
#[derive(Debug)]
pub struct Wal {
    dir: PathBuf,
    file: File,
    path: PathBuf,
    seq: u64,
    node_id: u64,
    last_index: u64,
}

impl Wal {
    /// Whether `dir` already contains WAL segments.
    pub fn exists(dir: &Path) -> bool {
        fs::read_dir(dir)
            .map(|entries| {
                entries
                    .flatten()
                    .any(|e| e.path().extension().map_or(false, |ext| ext == "wal"))
            })
            .unwrap_or(false)
    }

    /// Creates a fresh WAL for `node_id` with a single empty segment.
    pub fn create(dir: &Path, node_id: u64) -> Result<Self, Error> {
        ensure_dir(dir)?;
        let (file, path) = create_segment(dir, 0, 0, node_id)?;
        info!(node = node_id, dir = %dir.display(), "created write-ahead log");
        Ok(Self {
            dir: dir.to_path_buf(),
            file,
            path,
            seq: 0,
            node_id,
            last_index: 0,
        })
    }

    /// Opens an existing WAL and replays every record, dropping entries at or
    /// below `snap_index`. Returns the log (positioned on a fresh segment for
    /// new appends), the node id recorded in the metadata, the newest hard
    /// state, and the surviving entries in index order.
    ///
    /// A torn frame at the tail of the final segment is tolerated (a crash
    /// mid-save); corruption anywhere else fails the open.
    pub fn open(dir: &Path, snap_index: u64) -> Result<(Self, u64, Option<HardState>, Vec<Entry>), Error> {
        let mut segments: Vec<PathBuf> = fs::read_dir(dir)?
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.extension().map_or(false, |ext| ext == "wal"))
            .collect();
        segments.sort();
        if segments.is_empty() {
            return Err(Error::WalCorrupt("no segments found".to_string()));
        }

        let mut node_id: Option<u64> = None;
        let mut hard_state: Option<HardState> = None;
        let mut entries: Vec<Entry> = Vec::new();
        for (i, path) in segments.iter().enumerate() {
            let last_segment = i + 1 == segments.len();
            let mut reader = BufReader::new(File::open(path)?);
            loop {
                let (kind, body) = match read_frame(&mut reader) {
                    Ok(Some(frame)) => frame,
                    Ok(None) => break,
                    Err(reason) if last_segment => {
                        warn!(segment = %path.display(), %reason, "torn tail frame, truncating replay");
                        break;
                    }
                    Err(reason) => {
                        return Err(Error::WalCorrupt(format!(
                            "segment {}: {reason}",
                            path.display()
                        )));
                    }
                };
                match kind {
                    RecordKind::Metadata => {
                        let id = parse_metadata(&body)?;
                        match node_id {
                            None => node_id = Some(id),
                            Some(prev) if prev != id => {
                                return Err(Error::WalCorrupt(format!(
                                    "segments disagree on node id: {prev} vs {id}"
                                )));
                            }
                            Some(_) => {}
                        }
                    }
                    RecordKind::Entry => {
                        let entry = Entry::decode(&body[..])?;
                        replay_entry(&mut entries, entry);
                    }
                    RecordKind::HardState => {
                        hard_state = Some(HardState::decode(&body[..])?);
                    }
                    RecordKind::Snapshot => {
                        let (index, term) = parse_snapshot_mark(&body)?;
                        debug!(index, term, "replayed snapshot mark");
                    }
                }
            }
        }

        let node_id =
            node_id.ok_or_else(|| Error::WalCorrupt("missing metadata record".to_string()))?;
        entries.retain(|e| e.index > snap_index);
        let last_index = entries.last().map(|e| e.index).unwrap_or(snap_index);

        let seq = segments.len() as u64;
        let (file, path) = create_segment(dir, seq, last_index + 1, node_id)?;
        info!(
            node = node_id,
            entries = entries.len(),
            last_index,
            "opened write-ahead log"
        );
        Ok((
            Self {
                dir: dir.to_path_buf(),
                file,
                path,
                seq,
                node_id,
                last_index,
            },
            node_id,
            hard_state,
            entries,
        ))
    }

    /// Appends entries and the hard state, then fsyncs. On return the records
    /// are durable.
    pub fn save(&mut self, hard_state: Option<&HardState>, entries: &[Entry]) -> Result<(), Error> {
        if hard_state.is_none() && entries.is_empty() {
            return Ok(());
        }
        let mut buf = Vec::new();
        for entry in entries {
            write_frame(&mut buf, RecordKind::Entry, &entry.encode_to_vec());
        }
        if let Some(hs) = hard_state {
            write_frame(&mut buf, RecordKind::HardState, &hs.encode_to_vec());
        }
        self.file.write_all(&buf)?;
        self.file.sync_all()?;
        if let Some(last) = entries.last() {
            self.last_index = last.index;
        }
        Ok(())
    }

    /// Records that a snapshot at (index, term) is durable in the snapshot
    /// store; replay uses the mark for diagnostics only.
    pub fn save_snapshot_mark(&mut self, index: u64, term: u64) -> Result<(), Error> {
        let mut body = Vec::with_capacity(16);
        body.extend_from_slice(&index.to_le_bytes());
        body.extend_from_slice(&term.to_le_bytes());
        let mut buf = Vec::new();
        write_frame(&mut buf, RecordKind::Snapshot, &body);
        self.file.write_all(&buf)?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Rotates to a new segment so the previous one becomes compactable.
    pub fn cut(&mut self) -> Result<(), Error> {
        let seq = self.seq + 1;
        let (file, path) = create_segment(&self.dir, seq, self.last_index + 1, self.node_id)?;
        self.file = file;
        self.path = path;
        self.seq = seq;
        info!(segment = %self.path.display(), "rotated write-ahead log segment");
        Ok(())
    }

    pub fn close(self) -> Result<(), Error> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// Later writes of the same index supersede earlier ones (a leader change
/// may rewrite an uncommitted suffix).
fn replay_entry(entries: &mut Vec<Entry>, entry: Entry) {
    if let Some(first) = entries.first().map(|f| f.index) {
        if entry.index >= first {
            entries.truncate((entry.index - first) as usize);
        } else {
            entries.clear();
        }
    }
    entries.push(entry);
}

fn parse_metadata(body: &[u8]) -> Result<u64, Error> {
    std::str::from_utf8(body)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .ok_or_else(|| Error::WalCorrupt("metadata record is not a decimal node id".to_string()))
}

fn parse_snapshot_mark(body: &[u8]) -> Result<(u64, u64), Error> {
    if body.len() != 16 {
        return Err(Error::WalCorrupt("snapshot mark has wrong length".to_string()));
    }
    let index = u64::from_le_bytes(body[..8].try_into().unwrap());
    let term = u64::from_le_bytes(body[8..].try_into().unwrap());
    Ok((index, term))
}

fn write_frame(buf: &mut Vec<u8>, kind: RecordKind, body: &[u8]) {
    buf.extend_from_slice(&FRAME_MAGIC.to_le_bytes());
    buf.push(kind as u8);
    buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
    buf.extend_from_slice(&crc32c(body).to_le_bytes());
    buf.extend_from_slice(body);
}

/// Reads the next frame. `Ok(None)` is a clean end of segment; the error
/// string describes a torn or corrupt frame and leaves the verdict to the
/// caller, which knows whether it is reading the final segment.
fn read_frame<R: Read>(reader: &mut R) -> Result<Option<(RecordKind, Vec<u8>)>, String> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    let mut read = 0usize;
    while read < header.len() {
        let n = reader
            .read(&mut header[read..])
            .map_err(|err| format!("read frame header: {err}"))?;
        if n == 0 {
            if read == 0 {
                return Ok(None);
            }
            return Err("truncated frame header".to_string());
        }
        read += n;
    }

    let magic = u32::from_le_bytes(header[..4].try_into().unwrap());
    if magic != FRAME_MAGIC {
        return Err(format!("bad frame magic {magic:#010x}"));
    }
    let kind = RecordKind::from_u8(header[4]).ok_or_else(|| format!("bad record kind {}", header[4]))?;
    let len = u32::from_le_bytes(header[5..9].try_into().unwrap()) as usize;
    let expected_crc = u32::from_le_bytes(header[9..13].try_into().unwrap());

    let mut body = vec![0u8; len];
    let mut read = 0usize;
    while read < len {
        let n = reader
            .read(&mut body[read..])
            .map_err(|err| format!("read frame body: {err}"))?;
        if n == 0 {
            return Err("truncated frame body".to_string());
        }
        read += n;
    }
    let actual_crc = crc32c(&body);
    if actual_crc != expected_crc {
        return Err(format!("frame crc mismatch: {expected_crc:#010x} != {actual_crc:#010x}"));
    }
    Ok(Some((kind, body)))
}

fn segment_name(seq: u64, first_index: u64) -> String {
    format!("{seq:016x}-{first_index:016x}.wal")
}

/// Creates a segment atomically: write the metadata record to a temp file,
/// fsync, rename into place, fsync the directory, then reopen for append.
fn create_segment(dir: &Path, seq: u64, first_index: u64, node_id: u64) -> Result<(File, PathBuf), Error> {
    let name = segment_name(seq, first_index);
    let tmp_path = dir.join(format!("{name}.tmp"));
    let final_path = dir.join(&name);

    // A crash between create and rename may leave a stale temp file behind.
    let _ = fs::remove_file(&tmp_path);
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&tmp_path)?;
    let mut buf = Vec::new();
    write_frame(&mut buf, RecordKind::Metadata, node_id.to_string().as_bytes());
    file.write_all(&buf)?;
    file.sync_all()?;
    fs::rename(&tmp_path, &final_path)?;
    fsync_dir(dir)?;

    let file = OpenOptions::new().append(true).open(&final_path)?;
    Ok((file, final_path))
}

fn fsync_dir(dir: &Path) -> Result<(), Error> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

pub(crate) fn ensure_dir(dir: &Path) -> Result<(), Error> {
    fs::create_dir_all(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(index: u64, term: u64, payload: &[u8]) -> Entry {
        let mut e = Entry::default();
        e.index = index;
        e.term = term;
        e.data = payload.to_vec().into();
        e
    }

    fn hard_state(term: u64, commit: u64) -> HardState {
        let mut hs = HardState::default();
        hs.term = term;
        hs.vote = 1;
        hs.commit = commit;
        hs
    }

    #[test]
    fn test_create_then_open_roundtrip() {
        let dir = TempDir::new().unwrap();
        let mut wal = Wal::create(dir.path(), 7).unwrap();
        wal.save(
            Some(&hard_state(1, 2)),
            &[entry(1, 1, b"one"), entry(2, 1, b"two")],
        )
        .unwrap();
        wal.close().unwrap();

        let (_wal, node_id, hs, entries) = Wal::open(dir.path(), 0).unwrap();
        assert_eq!(node_id, 7);
        assert_eq!(hs.unwrap().commit, 2);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].index, 2);
        assert_eq!(&entries[0].data[..], b"one");
    }

    #[test]
    fn test_open_drops_entries_covered_by_snapshot() {
        let dir = TempDir::new().unwrap();
        let mut wal = Wal::create(dir.path(), 1).unwrap();
        let ents: Vec<Entry> = (1..=5).map(|i| entry(i, 1, b"x")).collect();
        wal.save(Some(&hard_state(1, 5)), &ents).unwrap();
        wal.close().unwrap();

        let (_wal, _, _, entries) = Wal::open(dir.path(), 3).unwrap();
        assert_eq!(entries.iter().map(|e| e.index).collect::<Vec<_>>(), vec![4, 5]);
    }

    #[test]
    fn test_later_save_overwrites_suffix() {
        let dir = TempDir::new().unwrap();
        let mut wal = Wal::create(dir.path(), 1).unwrap();
        wal.save(None, &[entry(1, 1, b"a"), entry(2, 1, b"b"), entry(3, 1, b"c")])
            .unwrap();
        // A new leader rewrites indexes 2..3 at a higher term.
        wal.save(Some(&hard_state(2, 3)), &[entry(2, 2, b"b2"), entry(3, 2, b"c2")])
            .unwrap();
        wal.close().unwrap();

        let (_wal, _, _, entries) = Wal::open(dir.path(), 0).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1].term, 2);
        assert_eq!(&entries[1].data[..], b"b2");
        assert_eq!(&entries[2].data[..], b"c2");
    }

    #[test]
    fn test_cut_spreads_records_across_segments() {
        let dir = TempDir::new().unwrap();
        let mut wal = Wal::create(dir.path(), 1).unwrap();
        wal.save(None, &[entry(1, 1, b"a")]).unwrap();
        wal.cut().unwrap();
        wal.save(Some(&hard_state(1, 2)), &[entry(2, 1, b"b")]).unwrap();
        wal.close().unwrap();

        let segments = fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .filter(|e| e.path().extension().map_or(false, |x| x == "wal"))
            .count();
        assert_eq!(segments, 2);

        let (_wal, _, hs, entries) = Wal::open(dir.path(), 0).unwrap();
        assert_eq!(hs.unwrap().commit, 2);
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn test_torn_tail_is_tolerated() {
        let dir = TempDir::new().unwrap();
        let mut wal = Wal::create(dir.path(), 1).unwrap();
        wal.save(None, &[entry(1, 1, b"a")]).unwrap();
        let path = wal.path.clone();
        wal.close().unwrap();

        // Simulate a crash mid-append: half a frame header at the tail.
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&FRAME_MAGIC.to_le_bytes()).unwrap();
        file.write_all(&[2u8, 9]).unwrap();
        file.sync_all().unwrap();

        let (_wal, _, _, entries) = Wal::open(dir.path(), 0).unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_corrupt_body_in_old_segment_fails() {
        let dir = TempDir::new().unwrap();
        let mut wal = Wal::create(dir.path(), 1).unwrap();
        wal.save(None, &[entry(1, 1, b"payload-to-corrupt")]).unwrap();
        let first_segment = wal.path.clone();
        wal.cut().unwrap();
        wal.save(None, &[entry(2, 1, b"b")]).unwrap();
        wal.close().unwrap();

        // Flip one payload byte in the non-final segment.
        let mut bytes = fs::read(&first_segment).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        fs::write(&first_segment, &bytes).unwrap();

        let err = Wal::open(dir.path(), 0).unwrap_err();
        assert!(matches!(err, Error::WalCorrupt(_)));
    }

    #[test]
    fn test_open_reports_recorded_node_id() {
        let dir = TempDir::new().unwrap();
        Wal::create(dir.path(), 42).unwrap().close().unwrap();
        let (_wal, node_id, _, _) = Wal::open(dir.path(), 0).unwrap();
        assert_eq!(node_id, 42);
    }
}
