//! The Raft driver.
//!
//! A single task owns the `RawNode` and is the only writer of the WAL, the
//! applied-index store, the in-memory Raft storage and the peer registry.
//! It selects over the tick timer, the two proposal channels, inbound
//! messages and transport feedback, and after every wakeup drains the
//! node's Ready batches.
//!
//! Within one batch the steps run strictly in order: persist (snapshot
//! file before anything else, then WAL), update volatile storage, ship
//! messages, apply committed entries (forced snapshot *before* the durable
//! applied index moves past a membership change), run the periodic
//! snapshot policy, advance. If an applied entry removed this node, the
//! loop finishes the batch and exits with [`LoopExit::SelfEvicted`]; the
//! embedder decides what the process does next.

use std::sync::Arc;
use std::time::Duration;

use prost::Message as _;
use quill_chain::Block;
use raft::eraftpb::{ConfChange, ConfChangeType, ConfState, Entry, EntryType, Message, Snapshot};
use raft::{RawNode, StateRole};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::address::{Address, RaftId};
use crate::applier::ChainApplier;
use crate::error::{RaftError, RaftResult};
use crate::manager::Role;
use crate::registry::{PeerBook, Registry};
use crate::storage::{AppliedIndexStore, RaftWal, ReplicaStore, SnapshotPayload, SnapshotStore};
use crate::transport::{RaftTransport, TransportEvent};

/// How the driver loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoopExit {
    /// The quit channel was signalled.
    Stopped,
    /// An applied ConfChange removed this node from the cluster.
    SelfEvicted,
}

/// A membership-change proposal paired with the caller's reply channel.
/// The driver answers with the propose outcome, so the caller learns
/// whether Raft accepted the change or there was no leader to take it.
pub(crate) struct ConfChangeRequest {
    pub(crate) cc: ConfChange,
    pub(crate) respond_to: oneshot::Sender<RaftResult<()>>,
}

pub(crate) struct Driver {
    pub(crate) raft_id: RaftId,
    pub(crate) node: RawNode<ReplicaStore>,
    pub(crate) store: ReplicaStore,
    pub(crate) wal: RaftWal,
    pub(crate) applied_store: AppliedIndexStore,
    pub(crate) snapshots: SnapshotStore,
    pub(crate) transport: RaftTransport,
    pub(crate) peer_book: PeerBook,
    pub(crate) registry: Arc<Registry>,
    pub(crate) applier: ChainApplier,
    pub(crate) role_tx: watch::Sender<Role>,

    pub(crate) tick_interval: Duration,
    pub(crate) snapshot_threshold: u64,

    pub(crate) applied: u64,
    pub(crate) snapshot_index: u64,
    pub(crate) conf_state: ConfState,
    pub(crate) conf_change_count: u64,
    pub(crate) exit_after_applying: bool,

    pub(crate) block_rx: mpsc::Receiver<Block>,
    pub(crate) conf_rx: mpsc::Receiver<ConfChangeRequest>,
    pub(crate) msg_rx: mpsc::Receiver<Message>,
    pub(crate) event_rx: mpsc::UnboundedReceiver<TransportEvent>,
    pub(crate) quit_rx: watch::Receiver<bool>,
}

impl Driver {
    /// Run until quit or self-eviction. An `Err` return means a durable
    /// store failed or consensus contradicted local state; both are
    /// unrecoverable.
    pub(crate) async fn run(mut self) -> RaftResult<LoopExit> {
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.node.tick();
                }
                Some(block) = self.block_rx.recv() => {
                    self.propose_block(&block);
                }
                Some(request) = self.conf_rx.recv() => {
                    self.propose_conf_change(request);
                }
                Some(message) = self.msg_rx.recv() => {
                    if let Err(e) = self.node.step(message) {
                        debug!(error = %e, "raft rejected inbound message");
                    }
                }
                Some(event) = self.event_rx.recv() => {
                    match event {
                        TransportEvent::Unreachable(id) => self.node.report_unreachable(id),
                        TransportEvent::SnapshotStatus(id, status) => {
                            self.node.report_snapshot(id, status);
                        }
                    }
                }
                _ = self.quit_rx.changed() => {
                    return Ok(LoopExit::Stopped);
                }
            }

            while self.node.has_ready() {
                if let Some(exit) = self.on_ready()? {
                    return Ok(exit);
                }
            }
        }
    }

    fn propose_block(&mut self, block: &Block) {
        let data = match block.encode() {
            Ok(data) => data,
            Err(e) => {
                warn!(error = %e, "failed to encode mined block");
                return;
            }
        };
        match self.node.propose(vec![], data) {
            Ok(()) => debug!(block = %block.hash(), "proposed block"),
            Err(raft::Error::ProposalDropped) => {
                // No leader, or the proposal buffer is full. The minter will
                // re-mint once the ordering settles.
                warn!(block = %block.hash(), "block proposal dropped")
            }
            Err(e) => warn!(block = %block.hash(), error = %e, "block proposal failed"),
        }
    }

    fn propose_conf_change(&mut self, request: ConfChangeRequest) {
        let ConfChangeRequest { mut cc, respond_to } = request;
        self.conf_change_count += 1;
        cc.id = self.conf_change_count;
        let result = match self.node.propose_conf_change(vec![], cc.clone()) {
            Ok(()) => {
                debug!(node = cc.node_id, id = cc.id, "proposed conf change");
                Ok(())
            }
            Err(raft::Error::ProposalDropped) => {
                warn!(node = cc.node_id, "conf change dropped; no leader to accept it");
                Err(RaftError::NotLeader)
            }
            Err(e) => {
                warn!(node = cc.node_id, error = %e, "conf change proposal failed");
                Err(e.into())
            }
        };
        let _ = respond_to.send(result);
    }

    /// Process one Ready batch. Returns `Some` when the loop must exit.
    fn on_ready(&mut self) -> RaftResult<Option<LoopExit>> {
        let mut rd = self.node.ready();

        if let Some(ss) = rd.ss() {
            self.update_role(ss.raft_state);
        }

        // (i) Persist. A snapshot in the batch must be on disk before the
        // entries that follow it, or a crash here loses the in-flight
        // snapshot.
        if !rd.snapshot().is_empty() {
            let snapshot = rd.snapshot().clone();
            self.snapshots.save(&snapshot)?;
            self.install_snapshot(snapshot)?;
        }
        self.wal.save(rd.hs(), rd.entries())?;

        // (ii) Volatile storage, so follower reads see the new entries.
        self.store.append(rd.entries())?;
        if let Some(hs) = rd.hs() {
            self.store.set_hard_state(hs.clone());
        }

        // (iii) Ship. Peer selection, retries and unreachable reporting are
        // the transport's business. The second batch was gated on the WAL
        // write above.
        self.transport.send(rd.take_messages());
        self.transport.send(rd.take_persisted_messages());

        // (iv) Apply committed entries.
        let committed = rd.take_committed_entries();
        self.apply_entries(committed)?;

        // (v) Periodic snapshot policy.
        self.maybe_trigger_snapshot()?;

        // (vii) Advance: tell the node this batch is fully processed.
        let mut light = self.node.advance(rd);
        if let Some(commit) = light.commit_index() {
            self.store.set_commit(commit);
        }
        self.transport.send(light.take_messages());
        let late_committed = light.take_committed_entries();
        self.apply_entries(late_committed)?;
        self.node.advance_apply();

        // (vi) Self-exit, after the entry's effects are fully durable.
        if self.exit_after_applying {
            warn!("permanently removed from the cluster");
            return Ok(Some(LoopExit::SelfEvicted));
        }
        Ok(None)
    }

    fn update_role(&mut self, state: StateRole) {
        let role = match state {
            StateRole::Leader => Role::Minter,
            _ => Role::Verifier,
        };
        let changed = self.role_tx.send_if_modified(|current| {
            if *current == role {
                false
            } else {
                *current = role;
                true
            }
        });
        if changed {
            info!(?role, "role changed");
            self.registry.set_role(role);
        }
    }

    /// Restore membership and durable indexes from a snapshot that arrived
    /// over the wire, then hand it to the in-memory storage.
    fn install_snapshot(&mut self, snapshot: Snapshot) -> RaftResult<()> {
        let meta = snapshot.get_metadata();
        let index = meta.index;
        info!(index, term = meta.term, "installing cluster snapshot");

        if !snapshot.data.is_empty() {
            let payload = SnapshotPayload::from_bytes(&snapshot.data)?;
            self.peer_book.install_payload(&payload);
        }

        self.conf_state = meta.get_conf_state().clone();
        self.snapshot_index = index;
        if index > self.applied {
            self.applied = index;
            self.applied_store.write(index)?;
        }

        self.store.apply_snapshot(snapshot)?;
        Ok(())
    }

    fn apply_entries(&mut self, committed: Vec<Entry>) -> RaftResult<()> {
        for entry in entries_to_apply(self.applied, committed)? {
            match entry.entry_type() {
                EntryType::EntryNormal => {
                    // An empty payload is the marker a fresh leader commits
                    // to establish its term; nothing to apply.
                    if !entry.data.is_empty() {
                        let block = Block::decode(&entry.data).map_err(|e| {
                            RaftError::Invariant(format!(
                                "undecodable block in committed entry {}: {e}",
                                entry.index
                            ))
                        })?;
                        self.applier.apply_new_chain_head(&block)?;
                    }
                }
                EntryType::EntryConfChange => {
                    let cc = ConfChange::decode(&entry.data[..]).map_err(|e| {
                        RaftError::Invariant(format!(
                            "undecodable conf change in committed entry {}: {e}",
                            entry.index
                        ))
                    })?;
                    if self.apply_conf_change(&cc)? {
                        // Snapshot *before* the durable applied index moves
                        // past this entry: crashing between the two must
                        // replay the membership change, not lose it.
                        self.trigger_snapshot(entry.index)?;
                    }
                }
                EntryType::EntryConfChangeV2 => {
                    return Err(RaftError::Invariant(
                        "joint-consensus conf changes are not supported".into(),
                    ));
                }
            }

            self.advance_applied_index(entry.index)?;
        }
        Ok(())
    }

    /// Apply a committed ConfChange to the Raft node and the registry.
    /// Returns whether a snapshot must be forced.
    fn apply_conf_change(&mut self, cc: &ConfChange) -> RaftResult<bool> {
        self.conf_state = self.node.apply_conf_change(cc)?;
        self.store.set_conf_state(self.conf_state.clone());

        match cc.change_type() {
            ConfChangeType::AddNode => {
                if self.registry.is_id_removed(cc.node_id) {
                    info!(node = cc.node_id, "ignoring AddNode for permanently-removed peer");
                    return Ok(false);
                }
                let raft_id = decode_raft_id(cc.node_id)?;
                if raft_id == self.raft_id || self.registry.has_peer(raft_id) {
                    // Expected during bootstrap: initial peers are inserted
                    // before the node starts.
                    info!(node = cc.node_id, "ignoring AddNode for known peer");
                    return Ok(false);
                }
                let address = Address::from_bytes(&cc.context).map_err(|e| {
                    RaftError::Invariant(format!(
                        "AddNode for {} carries an undecodable address: {e}",
                        cc.node_id
                    ))
                })?;
                self.peer_book.add_peer(&address);
                Ok(true)
            }
            ConfChangeType::RemoveNode => {
                if self.registry.is_id_removed(cc.node_id) {
                    info!(node = cc.node_id, "ignoring RemoveNode for already-removed peer");
                    return Ok(false);
                }
                let raft_id = decode_raft_id(cc.node_id)?;
                info!(node = cc.node_id, "removing peer");
                if raft_id == self.raft_id {
                    self.exit_after_applying = true;
                } else {
                    self.peer_book.remove_peer(raft_id);
                }
                Ok(true)
            }
            ConfChangeType::AddLearnerNode => Err(RaftError::Invariant(
                "learner members are not supported".into(),
            )),
        }
    }

    fn trigger_snapshot(&mut self, index: u64) -> RaftResult<()> {
        let payload = self.registry.snapshot_payload().to_bytes()?;

        let mut snapshot = Snapshot::default();
        {
            let meta = snapshot.mut_metadata();
            meta.index = index;
            meta.term = self.store.term_of(index)?;
            meta.set_conf_state(self.conf_state.clone());
        }
        snapshot.data = payload.clone().into();

        self.snapshots.save(&snapshot)?;
        self.store.set_outgoing_payload(payload);
        self.store.compact(index)?;
        self.snapshot_index = index;

        info!(index, "snapshot persisted");
        Ok(())
    }

    fn maybe_trigger_snapshot(&mut self) -> RaftResult<()> {
        if self.applied - self.snapshot_index >= self.snapshot_threshold {
            self.trigger_snapshot(self.applied)?;
        }
        Ok(())
    }

    /// Advance the in-memory applied index and write it durably.
    fn advance_applied_index(&mut self, index: u64) -> RaftResult<()> {
        self.applied = index;
        self.applied_store.write(index)
    }
}

/// The suffix of `committed` that has not been applied yet.
///
/// Raft may redeliver a prefix after a snapshot; entries at or below
/// `applied` are skipped. A committed batch that *starts* beyond
/// `applied + 1` means the log has a hole, which consensus forbids.
fn entries_to_apply(applied: u64, committed: Vec<Entry>) -> RaftResult<Vec<Entry>> {
    let first = match committed.first() {
        Some(entry) => entry.index,
        None => return Ok(committed),
    };
    if first > applied + 1 {
        return Err(RaftError::Invariant(format!(
            "first committed entry {first} leaves a gap after applied index {applied}"
        )));
    }
    let skip = (applied + 1 - first) as usize;
    if skip >= committed.len() {
        return Ok(Vec::new());
    }
    Ok(committed.into_iter().skip(skip).collect())
}

/// Raft IDs are 16-bit and local config cannot produce a larger one, so an
/// overflow here can only come from a corrupt or hostile committed entry.
fn decode_raft_id(node_id: u64) -> RaftResult<RaftId> {
    RaftId::try_from(node_id)
        .map_err(|_| RaftError::Invariant(format!("conf change names non-16-bit raft id {node_id}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(range: std::ops::RangeInclusive<u64>) -> Vec<Entry> {
        range
            .map(|index| {
                let mut e = Entry::default();
                e.index = index;
                e.term = 1;
                e
            })
            .collect()
    }

    #[test]
    fn empty_input_passes_through() {
        assert!(entries_to_apply(5, Vec::new()).unwrap().is_empty());
    }

    #[test]
    fn skips_already_applied_prefix() {
        let out = entries_to_apply(5, entries(3..=8)).unwrap();
        let indexes: Vec<u64> = out.iter().map(|e| e.index).collect();
        assert_eq!(indexes, vec![6, 7, 8]);
    }

    #[test]
    fn fully_applied_batch_yields_nothing() {
        assert!(entries_to_apply(8, entries(3..=8)).unwrap().is_empty());
    }

    #[test]
    fn contiguous_batch_is_returned_whole() {
        let out = entries_to_apply(2, entries(3..=5)).unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].index, 3);
    }

    #[test]
    fn gap_is_an_invariant_violation() {
        assert!(matches!(
            entries_to_apply(2, entries(4..=5)),
            Err(RaftError::Invariant(_))
        ));
    }

    #[test]
    fn raft_id_must_fit_sixteen_bits() {
        assert_eq!(decode_raft_id(3).unwrap(), 3);
        assert!(decode_raft_id(u64::from(u16::MAX) + 1).is_err());
    }
}
