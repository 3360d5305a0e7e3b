//! Peer registry and address book.
//!
//! One reader/writer lock protects everything the rest of the system wants
//! to observe about cluster membership: the local address, the live peers,
//! the tombstone set and the current role. The Raft driver (through
//! [`PeerBook`]) is the only writer; introspection APIs and the transport's
//! removed-ID gate read under the shared lock.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use quill_chain::P2pService;
use tracing::info;

use crate::address::{Address, RaftId};
use crate::manager::Role;
use crate::storage::SnapshotPayload;
use crate::transport::RaftTransport;

#[derive(Default)]
struct Inner {
    local: Option<Address>,
    peers: HashMap<RaftId, Address>,
    removed: HashSet<RaftId>,
    role: Role,
}

/// Shared membership state.
#[derive(Default)]
pub(crate) struct Registry {
    inner: RwLock<Inner>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Registry::default()
    }

    /// Whether the ID is permanently removed. Also gates inbound traffic.
    pub(crate) fn is_id_removed(&self, raft_id: u64) -> bool {
        RaftId::try_from(raft_id)
            .map(|id| self.inner.read().removed.contains(&id))
            .unwrap_or(false)
    }

    pub(crate) fn has_peer(&self, raft_id: RaftId) -> bool {
        self.inner.read().peers.contains_key(&raft_id)
    }

    pub(crate) fn peer(&self, raft_id: RaftId) -> Option<Address> {
        self.inner.read().peers.get(&raft_id).copied()
    }

    /// Every known peer, self excluded.
    pub(crate) fn peers(&self) -> Vec<Address> {
        let mut peers: Vec<Address> = self.inner.read().peers.values().copied().collect();
        peers.sort_by_key(|a| a.raft_id);
        peers
    }

    /// Peers plus self.
    pub(crate) fn cluster_size(&self) -> usize {
        self.inner.read().peers.len() + 1
    }

    pub(crate) fn local(&self) -> Option<Address> {
        self.inner.read().local
    }

    pub(crate) fn set_local(&self, address: Address) {
        self.inner.write().local = Some(address);
    }

    pub(crate) fn role(&self) -> Role {
        self.inner.read().role
    }

    pub(crate) fn set_role(&self, role: Role) {
        self.inner.write().role = role;
    }

    fn insert_peer(&self, address: Address) {
        self.inner.write().peers.insert(address.raft_id, address);
    }

    /// Remove from the live set and tombstone the ID. Idempotent.
    fn drop_peer(&self, raft_id: RaftId) -> Option<Address> {
        let mut inner = self.inner.write();
        let old = inner.peers.remove(&raft_id);
        inner.removed.insert(raft_id);
        old
    }

    /// Membership as carried in snapshots: every conf-state member's
    /// address (self included) plus the tombstones.
    pub(crate) fn snapshot_payload(&self) -> SnapshotPayload {
        let inner = self.inner.read();
        let mut addresses: Vec<Address> = inner.peers.values().copied().collect();
        if let Some(local) = inner.local {
            addresses.push(local);
        }
        addresses.sort_by_key(|a| a.raft_id);
        let mut removed: Vec<RaftId> = inner.removed.iter().copied().collect();
        removed.sort_unstable();
        SnapshotPayload { addresses, removed }
    }
}

/// The address book: keeps the p2p server, the Raft transport and the
/// registry in agreement about who the peers are.
pub(crate) struct PeerBook {
    pub(crate) registry: Arc<Registry>,
    pub(crate) p2p: Arc<dyn P2pService>,
    pub(crate) transport: RaftTransport,
    pub(crate) port_base: u16,
    pub(crate) self_id: RaftId,
}

impl PeerBook {
    /// Dial the peer, register its transport URL, record it.
    pub(crate) fn add_peer(&self, address: &Address) {
        info!(peer = address.raft_id, %address, "adding peer");
        self.p2p
            .add_peer(&address.node_id.0, address.ip, address.p2p_port);
        self.transport
            .add_peer(u64::from(address.raft_id), address.raft_url(self.port_base));
        self.registry.insert_peer(*address);
    }

    /// Drop the peer everywhere and tombstone its ID. Idempotent.
    pub(crate) fn remove_peer(&self, raft_id: RaftId) {
        if let Some(address) = self.registry.peer(raft_id) {
            self.p2p
                .remove_peer(&address.node_id.0, address.ip, address.p2p_port);
        }
        self.transport.remove_peer(u64::from(raft_id));
        self.registry.drop_peer(raft_id);
    }

    /// Install membership recovered from a snapshot: tombstones first, then
    /// connections to every member we do not already know.
    pub(crate) fn install_payload(&self, payload: &SnapshotPayload) {
        for raft_id in &payload.removed {
            self.remove_peer(*raft_id);
        }
        for address in &payload.addresses {
            if address.raft_id == self.self_id {
                self.registry.set_local(*address);
                continue;
            }
            if self.registry.is_id_removed(u64::from(address.raft_id))
                || self.registry.has_peer(address.raft_id)
            {
                continue;
            }
            self.add_peer(address);
        }
    }
}
