// In-memory raft storage: the log cache the engine reads from
// The driver appends durable entries here and compacts it when snapshotting

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use prost::Message;
use raft::eraftpb::{ConfState, Entry, HardState, Snapshot};
use raft::storage::{GetEntriesContext, RaftState, Storage};
use raft::{Error as RaftError, StorageError};

/// In-memory implementation of the engine's `Storage` trait.
///
/// The entry vector always holds a dummy entry at position zero carrying the
/// index and term of the latest snapshot point, so `first_index` is
/// `dummy.index + 1` and compaction is a drain up to the new dummy.
#[derive(Clone, Debug, Default)]
pub struct MemStorage {
    core: Arc<RwLock<MemStorageCore>>,
}

#[derive(Debug)]
pub struct MemStorageCore {
    hard_state: HardState,
    snapshot: Snapshot,
    entries: Vec<Entry>,
}

impl Default for MemStorageCore {
    fn default() -> Self {
        Self {
            hard_state: HardState::default(),
            snapshot: Snapshot::default(),
            entries: vec![Entry::default()],
        }
    }
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write access to the core. Held only by the driver thread.
    pub fn wl(&self) -> RwLockWriteGuard<'_, MemStorageCore> {
        self.core.write().unwrap()
    }

    pub fn rl(&self) -> RwLockReadGuard<'_, MemStorageCore> {
        self.core.read().unwrap()
    }
}

impl MemStorageCore {
    fn offset(&self) -> u64 {
        self.entries[0].index
    }

    pub fn first_index(&self) -> u64 {
        self.offset() + 1
    }

    pub fn last_index(&self) -> u64 {
        self.offset() + self.entries.len() as u64 - 1
    }

    pub fn snapshot_index(&self) -> u64 {
        self.snapshot.get_metadata().index
    }

    pub fn conf_state(&self) -> ConfState {
        self.snapshot.get_metadata().get_conf_state().clone()
    }

    pub fn hard_state(&self) -> &HardState {
        &self.hard_state
    }

    pub fn set_hard_state(&mut self, hs: HardState) {
        self.hard_state = hs;
    }

    pub fn set_commit(&mut self, commit: u64) {
        self.hard_state.commit = commit;
    }

    /// Appends stable entries. A suffix overlapping the existing log replaces
    /// it; a gap after the current last index is a broken invariant.
    pub fn append(&mut self, entries: &[Entry]) -> raft::Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let first = self.first_index();
        let last_new = entries[0].index + entries.len() as u64 - 1;
        if last_new < first {
            // Entirely behind the snapshot point.
            return Ok(());
        }
        let entries = if entries[0].index < first {
            &entries[(first - entries[0].index) as usize..]
        } else {
            entries
        };

        let offset = entries[0].index - self.offset();
        if (self.entries.len() as u64) < offset {
            return Err(RaftError::Store(StorageError::Other(
                format!(
                    "append gap: last index {}, incoming first index {}",
                    self.last_index(),
                    entries[0].index
                )
                .into(),
            )));
        }
        self.entries.truncate(offset as usize);
        self.entries.extend_from_slice(entries);
        Ok(())
    }

    /// Installs a snapshot received from a peer, discarding the cached log.
    pub fn apply_snapshot(&mut self, snapshot: Snapshot) -> raft::Result<()> {
        let meta = snapshot.get_metadata();
        if meta.index <= self.snapshot_index() && self.snapshot_index() != 0 {
            return Err(RaftError::Store(StorageError::SnapshotOutOfDate));
        }
        let mut dummy = Entry::default();
        dummy.index = meta.index;
        dummy.term = meta.term;
        self.entries = vec![dummy];
        self.hard_state.commit = meta.index;
        if meta.term > self.hard_state.term {
            self.hard_state.term = meta.term;
        }
        self.snapshot = snapshot;
        Ok(())
    }

    /// Builds a snapshot at `index` carrying `data`, installs it, and
    /// truncates the log through `index`. Returns the snapshot handle for
    /// persisting. Reports `Compacted` when a newer compaction already
    /// covered `index` (the caller aborts silently).
    pub fn compact_to(
        &mut self,
        index: u64,
        conf_state: ConfState,
        data: Vec<u8>,
    ) -> raft::Result<Snapshot> {
        if index <= self.snapshot_index() {
            return Err(RaftError::Store(StorageError::Compacted));
        }
        if index > self.last_index() {
            return Err(RaftError::Store(StorageError::Unavailable));
        }
        let term = self.entries[(index - self.offset()) as usize].term;

        let mut snapshot = Snapshot::default();
        snapshot.mut_metadata().index = index;
        snapshot.mut_metadata().term = term;
        snapshot.mut_metadata().set_conf_state(conf_state);
        snapshot.data = data.into();
        self.snapshot = snapshot.clone();

        let keep_from = (index - self.offset()) as usize;
        self.entries.drain(..keep_from);
        let mut dummy = Entry::default();
        dummy.index = index;
        dummy.term = term;
        self.entries[0] = dummy;
        Ok(snapshot)
    }
}

impl Storage for MemStorage {
    fn initial_state(&self) -> raft::Result<RaftState> {
        let core = self.rl();
        Ok(RaftState::new(
            core.hard_state.clone(),
            core.snapshot.get_metadata().get_conf_state().clone(),
        ))
    }

    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
        _context: GetEntriesContext,
    ) -> raft::Result<Vec<Entry>> {
        let core = self.rl();
        if low <= core.offset() {
            return Err(RaftError::Store(StorageError::Compacted));
        }
        if high > core.last_index() + 1 {
            return Err(RaftError::Store(StorageError::Unavailable));
        }
        let offset = core.offset();
        let lo = (low - offset) as usize;
        let hi = (high - offset) as usize;
        let mut entries = core.entries[lo..hi].to_vec();
        if let Some(max_size) = max_size.into() {
            limit_size(&mut entries, max_size);
        }
        Ok(entries)
    }

    fn term(&self, idx: u64) -> raft::Result<u64> {
        let core = self.rl();
        let offset = core.offset();
        if idx < offset {
            return Err(RaftError::Store(StorageError::Compacted));
        }
        if idx > core.last_index() {
            return Err(RaftError::Store(StorageError::Unavailable));
        }
        Ok(core.entries[(idx - offset) as usize].term)
    }

    fn first_index(&self) -> raft::Result<u64> {
        Ok(self.rl().first_index())
    }

    fn last_index(&self) -> raft::Result<u64> {
        Ok(self.rl().last_index())
    }

    fn snapshot(&self, request_index: u64, _to: u64) -> raft::Result<Snapshot> {
        let core = self.rl();
        if core.snapshot_index() < request_index {
            return Err(RaftError::Store(StorageError::SnapshotTemporarilyUnavailable));
        }
        Ok(core.snapshot.clone())
    }
}

/// Truncates `entries` so their encoded size stays within `max`, always
/// keeping at least the first entry.
fn limit_size(entries: &mut Vec<Entry>, max: u64) {
    if entries.len() <= 1 {
        return;
    }
    let mut size = 0u64;
    let mut keep = 0usize;
    for (i, entry) in entries.iter().enumerate() {
        size += entry.encoded_len() as u64;
        if size > max && i > 0 {
            break;
        }
        keep = i + 1;
    }
    entries.truncate(keep);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(index: u64, term: u64) -> Entry {
        let mut e = Entry::default();
        e.index = index;
        e.term = term;
        e
    }

    fn storage_with(entries: &[Entry]) -> MemStorage {
        let storage = MemStorage::new();
        storage.wl().append(entries).unwrap();
        storage
    }

    #[test]
    fn test_first_last_index() {
        let storage = storage_with(&[entry(1, 1), entry(2, 1), entry(3, 2)]);
        assert_eq!(storage.first_index().unwrap(), 1);
        assert_eq!(storage.last_index().unwrap(), 3);
        assert_eq!(storage.term(3).unwrap(), 2);
    }

    #[test]
    fn test_append_overwrites_overlap() {
        let storage = storage_with(&[entry(1, 1), entry(2, 1), entry(3, 1)]);
        storage.wl().append(&[entry(2, 2), entry(3, 2)]).unwrap();
        assert_eq!(storage.term(2).unwrap(), 2);
        assert_eq!(storage.last_index().unwrap(), 3);
    }

    #[test]
    fn test_append_gap_is_error() {
        let storage = storage_with(&[entry(1, 1)]);
        assert!(storage.wl().append(&[entry(5, 1)]).is_err());
    }

    #[test]
    fn test_compact_to_truncates_and_reports() {
        let storage = storage_with(&[entry(1, 1), entry(2, 1), entry(3, 2), entry(4, 2)]);
        let snap = storage
            .wl()
            .compact_to(3, ConfState::default(), b"state".to_vec())
            .unwrap();
        assert_eq!(snap.get_metadata().index, 3);
        assert_eq!(snap.get_metadata().term, 2);
        assert_eq!(storage.first_index().unwrap(), 4);
        assert_eq!(storage.last_index().unwrap(), 4);

        // Entries behind the snapshot point are gone.
        assert!(matches!(
            storage.entries(1, 2, None, GetEntriesContext::empty(false)),
            Err(RaftError::Store(StorageError::Compacted))
        ));
    }

    #[test]
    fn test_compact_to_raced_by_newer_snapshot() {
        let storage = storage_with(&[entry(1, 1), entry(2, 1), entry(3, 1)]);
        storage
            .wl()
            .compact_to(3, ConfState::default(), Vec::new())
            .unwrap();
        assert!(matches!(
            storage.wl().compact_to(2, ConfState::default(), Vec::new()),
            Err(RaftError::Store(StorageError::Compacted))
        ));
    }

    #[test]
    fn test_apply_snapshot_resets_log() {
        let storage = storage_with(&[entry(1, 1), entry(2, 1)]);
        let mut snap = Snapshot::default();
        snap.mut_metadata().index = 9;
        snap.mut_metadata().term = 3;
        storage.wl().apply_snapshot(snap).unwrap();
        assert_eq!(storage.first_index().unwrap(), 10);
        assert_eq!(storage.last_index().unwrap(), 9);
        assert_eq!(storage.rl().hard_state().commit, 9);
    }

    #[test]
    fn test_snapshot_request_index() {
        let storage = storage_with(&[entry(1, 1), entry(2, 1), entry(3, 1)]);
        storage
            .wl()
            .compact_to(2, ConfState::default(), b"d".to_vec())
            .unwrap();
        assert_eq!(storage.snapshot(2, 0).unwrap().get_metadata().index, 2);
        assert!(storage.snapshot(3, 0).is_err());
    }

    #[test]
    fn test_entries_window() {
        let storage = storage_with(&[entry(1, 1), entry(2, 1), entry(3, 1)]);
        let got = storage
            .entries(2, 4, None, GetEntriesContext::empty(false))
            .unwrap();
        assert_eq!(got.iter().map(|e| e.index).collect::<Vec<_>>(), vec![2, 3]);
    }
}
