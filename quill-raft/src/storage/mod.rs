//! Durable and volatile storage for the ordering core.
//!
//! Three durable stores live under the data directory: the segmented
//! write-ahead log (`raft-wal/`), the snapshot directory (`raft-snap/`) and
//! the applied-index store (`quorum-raft-state/`). [`ReplicaStore`] is the
//! volatile in-memory store the Raft node reads from.

mod applied;
mod snapshot;
mod wal;

pub use applied::AppliedIndexStore;
pub use snapshot::{SnapshotPayload, SnapshotStore};
pub use wal::{RaftWal, WalReplay};

use std::sync::Arc;

use parking_lot::RwLock;
use raft::eraftpb::{ConfState, Entry, HardState, Snapshot};
use raft::storage::{MemStorage, Storage};
use raft::{GetEntriesContext, RaftState};

use crate::error::RaftResult;

/// The volatile Raft storage.
///
/// Wraps the library's `MemStorage` and overlays the most recent snapshot
/// payload on outgoing snapshots: `MemStorage` fabricates snapshots with
/// empty data, but a lagging follower needs the address book and tombstones
/// to reconnect, so the payload saved with our latest snapshot rides along.
#[derive(Clone)]
pub struct ReplicaStore {
    mem: MemStorage,
    outgoing_payload: Arc<RwLock<Vec<u8>>>,
}

impl ReplicaStore {
    /// An empty store, for restarts (state comes from the snapshot and WAL)
    /// and for joining nodes (state comes over the wire).
    pub fn new() -> Self {
        ReplicaStore {
            mem: MemStorage::new(),
            outgoing_payload: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// A store seeded with the bootstrap voter set.
    pub fn bootstrap(voters: Vec<u64>) -> Self {
        ReplicaStore {
            mem: MemStorage::new_with_conf_state(ConfState::from((voters, vec![]))),
            outgoing_payload: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Append entries to the log window.
    pub fn append(&self, entries: &[Entry]) -> RaftResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.mem.wl().append(entries)?;
        Ok(())
    }

    /// Record the latest hard state.
    pub fn set_hard_state(&self, hs: HardState) {
        self.mem.wl().set_hardstate(hs);
    }

    /// Raise the recorded commit index.
    pub fn set_commit(&self, commit: u64) {
        self.mem.wl().mut_hard_state().commit = commit;
    }

    /// Install a snapshot received from the leader.
    pub fn apply_snapshot(&self, snapshot: Snapshot) -> RaftResult<()> {
        let payload = snapshot.data.to_vec();
        self.mem.wl().apply_snapshot(snapshot)?;
        *self.outgoing_payload.write() = payload;
        Ok(())
    }

    /// Discard log entries at or below `index`; they are covered by a
    /// snapshot now. Already-compacted indexes are fine.
    pub fn compact(&self, index: u64) -> RaftResult<()> {
        match self.mem.wl().compact(index) {
            Ok(()) => Ok(()),
            Err(raft::Error::Store(raft::StorageError::Compacted)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Record the payload to serve with future outgoing snapshots.
    pub fn set_outgoing_payload(&self, payload: Vec<u8>) {
        *self.outgoing_payload.write() = payload;
    }

    /// Mirror an applied conf change, so snapshots built from this store
    /// carry the current membership.
    pub fn set_conf_state(&self, conf_state: ConfState) {
        self.mem.wl().set_conf_state(conf_state);
    }

    /// Term of the entry at `index`.
    pub fn term_of(&self, index: u64) -> RaftResult<u64> {
        Ok(self.mem.term(index)?)
    }
}

impl Default for ReplicaStore {
    fn default() -> Self {
        ReplicaStore::new()
    }
}

impl Storage for ReplicaStore {
    fn initial_state(&self) -> raft::Result<RaftState> {
        self.mem.initial_state()
    }

    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
        context: GetEntriesContext,
    ) -> raft::Result<Vec<Entry>> {
        self.mem.entries(low, high, max_size, context)
    }

    fn term(&self, idx: u64) -> raft::Result<u64> {
        self.mem.term(idx)
    }

    fn first_index(&self) -> raft::Result<u64> {
        self.mem.first_index()
    }

    fn last_index(&self) -> raft::Result<u64> {
        self.mem.last_index()
    }

    fn snapshot(&self, request_index: u64, to: u64) -> raft::Result<Snapshot> {
        let mut snapshot = self.mem.snapshot(request_index, to)?;
        if snapshot.data.is_empty() {
            let payload = self.outgoing_payload.read();
            if !payload.is_empty() {
                snapshot.data = payload.clone().into();
            }
        }
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use raft::eraftpb::EntryType;

    fn entry(index: u64, term: u64) -> Entry {
        let mut e = Entry::default();
        e.set_entry_type(EntryType::EntryNormal);
        e.index = index;
        e.term = term;
        e
    }

    // Conf-state bootstrapping plants a placeholder snapshot at index 1,
    // so appended entries start at 2.

    #[test]
    fn append_and_read_back() {
        let store = ReplicaStore::bootstrap(vec![1, 2, 3]);
        store.append(&[entry(2, 1), entry(3, 1)]).unwrap();

        assert_eq!(store.last_index().unwrap(), 3);
        let got = store
            .entries(2, 4, None, GetEntriesContext::empty(false))
            .unwrap();
        assert_eq!(got.len(), 2);
    }

    #[test]
    fn compact_tolerates_already_compacted() {
        let store = ReplicaStore::bootstrap(vec![1]);
        store
            .append(&[entry(2, 1), entry(3, 1), entry(4, 1)])
            .unwrap();
        store.set_commit(4);

        store.compact(3).unwrap();
        // An index that is already behind first_index is a no-op.
        store.compact(2).unwrap();
    }

    #[test]
    fn outgoing_snapshot_carries_payload() {
        let store = ReplicaStore::bootstrap(vec![1]);
        store.append(&[entry(2, 1)]).unwrap();
        store.set_commit(2);

        store.set_outgoing_payload(b"membership".to_vec());

        let snapshot = Storage::snapshot(&store, 2, 2).unwrap();
        assert_eq!(&snapshot.data[..], b"membership");
        assert_eq!(snapshot.get_metadata().index, 2);
    }
}
