// Durable storage owned by the node driver: the WAL paired with the
// snapshot store, behind the save / save-snapshot / cut / close surface

use raft::eraftpb::{Entry, HardState, Snapshot};

use crate::error::Error;
use crate::raft::snapshot::SnapStore;
use crate::raft::wal::Wal;

/// Crash-consistent storage for one replica. `save` is the durability
/// barrier for hard state and entries; `save_snapshot` marks the WAL and
/// writes the snapshot file atomically; `cut` rotates the WAL so older
/// segments become compactable.
#[derive(Debug)]
pub struct DiskStorage {
    wal: Wal,
    snaps: SnapStore,
}

impl DiskStorage {
    pub fn new(wal: Wal, snaps: SnapStore) -> Self {
        Self { wal, snaps }
    }

    pub fn save(&mut self, hard_state: Option<&HardState>, entries: &[Entry]) -> Result<(), Error> {
        self.wal.save(hard_state, entries)
    }

    pub fn save_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), Error> {
        let meta = snapshot.get_metadata();
        self.wal.save_snapshot_mark(meta.index, meta.term)?;
        self.snaps.save(snapshot)
    }

    pub fn cut(&mut self) -> Result<(), Error> {
        self.wal.cut()
    }

    pub fn close(self) -> Result<(), Error> {
        self.wal.close()
    }
}
