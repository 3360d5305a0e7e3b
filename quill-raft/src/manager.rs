//! The protocol manager.
//!
//! Owns the Raft node and everything around it: durable stores, transport,
//! proposal intake, the driver task, the mined-block bridge and the role
//! dispatcher. Embedders construct one with [`ProtocolManager::new`], call
//! [`start`](ProtocolManager::start), and watch
//! [`completion`](ProtocolManager::completion) for the terminal state,
//! including self-eviction, which the manager reports instead of exiting
//! the process.

use std::net::SocketAddr;
use std::sync::Arc;

use quill_chain::{BlockEngine, BlockHash, ChainEvent, EventBus, Minter, P2pService};
use raft::eraftpb::{ConfChange, ConfChangeType, Message};
use raft::storage::Storage as _;
use raft::RawNode;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::address::{raft_port, Address, RaftId};
use crate::applier::ChainApplier;
use crate::config::{NodeConfig, CLUSTER_ID};
use crate::driver::{ConfChangeRequest, Driver, LoopExit};
use crate::error::{RaftError, RaftResult};
use crate::registry::{PeerBook, Registry};
use crate::storage::{AppliedIndexStore, RaftWal, ReplicaStore, SnapshotPayload, SnapshotStore};
use crate::transport::{RaftHandler, RaftServer, RaftTransport};

/// A member's current duty. Exactly one member is the minter at a time:
/// the Raft leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    /// Assembles new blocks.
    Minter,
    /// Validates and applies blocks decided by consensus.
    #[default]
    Verifier,
}

/// Introspection snapshot for the operator console.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    /// Live members, self included.
    pub cluster_size: usize,
    /// Hash of the genesis block.
    pub genesis_hash: BlockHash,
    /// Hash of the current chain head.
    pub head_hash: BlockHash,
    /// This member's role.
    pub role: Role,
}

/// Terminal state of a manager, published on the completion channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// Shut down via [`ProtocolManager::stop`].
    Stopped,
    /// A committed membership change removed this node. The embedder
    /// decides whether to exit, restart or continue headless.
    SelfEvicted,
    /// The driver hit an unrecoverable error.
    Failed(String),
}

/// Inbound capability handed to the transport server: the gate for
/// tombstoned senders plus the path into the driver. Deliberately narrow;
/// the transport never sees the manager.
struct InboundHandler {
    registry: Arc<Registry>,
    msg_tx: mpsc::Sender<Message>,
}

impl RaftHandler for InboundHandler {
    fn is_id_removed(&self, raft_id: u64) -> bool {
        self.registry.is_id_removed(raft_id)
    }

    fn deliver(&self, message: Message) -> RaftResult<()> {
        match self.msg_tx.try_send(message) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                // Raft retransmits; shedding load here is safe.
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(RaftError::Stopped),
        }
    }
}

/// The Raft-driven block ordering core.
pub struct ProtocolManager {
    config: NodeConfig,
    engine: Arc<dyn BlockEngine>,
    events: EventBus,
    minter: Arc<dyn Minter>,
    p2p: Arc<dyn P2pService>,
    registry: Arc<Registry>,

    applied_store: Option<AppliedIndexStore>,
    conf_tx: Option<mpsc::Sender<ConfChangeRequest>>,
    quit_tx: watch::Sender<bool>,
    quit_rx: watch::Receiver<bool>,
    completion_tx: Option<watch::Sender<Option<Completion>>>,
    completion_rx: watch::Receiver<Option<Completion>>,

    server: Option<RaftServer>,
    driver_handle: Option<JoinHandle<()>>,
    aux_tasks: Vec<JoinHandle<()>>,
    started: bool,
}

impl ProtocolManager {
    /// Create a manager. Opens the applied-index store; everything else is
    /// deferred to [`start`](ProtocolManager::start).
    pub fn new(
        config: NodeConfig,
        engine: Arc<dyn BlockEngine>,
        events: EventBus,
        minter: Arc<dyn Minter>,
        p2p: Arc<dyn P2pService>,
    ) -> RaftResult<Self> {
        config.validate()?;
        let applied_store = AppliedIndexStore::open(&config.state_dir())?;

        let (quit_tx, quit_rx) = watch::channel(false);
        let (completion_tx, completion_rx) = watch::channel(None);

        Ok(ProtocolManager {
            config,
            engine,
            events,
            minter,
            p2p,
            registry: Arc::new(Registry::new()),
            applied_store: Some(applied_store),
            conf_tx: None,
            quit_tx,
            quit_rx,
            completion_tx: Some(completion_tx),
            completion_rx,
            server: None,
            driver_handle: None,
            aux_tasks: Vec::new(),
            started: false,
        })
    }

    /// Start the node: replay durable state, start the transport, spawn the
    /// driver and its satellite tasks.
    pub async fn start(&mut self) -> RaftResult<()> {
        if self.started {
            return Ok(());
        }
        let config = self.config.clone();
        info!(raft_id = config.raft_id, "starting raft protocol handler");

        let applied_store = self.applied_store.take().ok_or(RaftError::Stopped)?;
        let mut applied = applied_store.load()?;

        let wal_existed = RaftWal::exists(&config.wal_dir());
        let (wal, replay) = RaftWal::open(&config.wal_dir())?;
        let snapshots = SnapshotStore::open(&config.snap_dir())?;

        // Transport first: restoring membership below registers peer URLs.
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let transport = RaftTransport::new(
            CLUSTER_ID,
            std::time::Duration::from_millis(config.transport_timeout_ms),
            event_tx,
        )?;
        let (msg_tx, msg_rx) = mpsc::channel(1024);
        let handler = Arc::new(InboundHandler {
            registry: Arc::clone(&self.registry),
            msg_tx,
        });
        let listen: SocketAddr = (
            [0, 0, 0, 0],
            raft_port(config.raft_port_base, config.raft_id),
        )
            .into();
        let mut server = RaftServer::new(listen, CLUSTER_ID, handler);
        server.start().await?;

        let peer_book = PeerBook {
            registry: Arc::clone(&self.registry),
            p2p: Arc::clone(&self.p2p),
            transport: transport.clone(),
            port_base: config.raft_port_base,
            self_id: config.raft_id,
        };

        let has_state = replay.hard_state.is_some() || !replay.entries.is_empty();
        let mut snapshot_index = 0;

        let store = if wal_existed && has_state {
            info!("remounting existing raft log; reconnecting to peers");
            let store = match snapshots.load_latest()? {
                Some(snapshot) => {
                    let store = ReplicaStore::new();
                    if !snapshot.data.is_empty() {
                        let payload = SnapshotPayload::from_bytes(&snapshot.data)?;
                        peer_book.install_payload(&payload);
                    }
                    snapshot_index = snapshot.get_metadata().index;
                    store.apply_snapshot(snapshot)?;
                    store
                }
                // No snapshot means no membership change was ever applied
                // (one would have forced a snapshot), so the bootstrap list
                // still describes the cluster.
                None => self.seed_bootstrap_membership(&peer_book)?,
            };
            let mut entries = replay.entries;
            entries.retain(|e| e.index > snapshot_index);
            store.append(&entries)?;
            if let Some(hs) = replay.hard_state {
                store.set_hard_state(hs);
            }
            store
        } else if config.join_existing {
            info!("joining an existing cluster; waiting for contact");
            // Membership arrives with the first snapshot, but the transport
            // needs somewhere to send replies before that. The static peer
            // list the operator started us with fills the URL table only;
            // it is not membership.
            for (i, url) in config.bootstrap_nodes.iter().enumerate() {
                let address = Address::parse_enode((i as RaftId) + 1, url)?;
                if address.raft_id != config.raft_id {
                    transport.add_peer(
                        u64::from(address.raft_id),
                        address.raft_url(config.raft_port_base),
                    );
                }
            }
            ReplicaStore::new()
        } else {
            if config.bootstrap_nodes.is_empty() {
                return Err(RaftError::Config(
                    "refusing to bootstrap with an empty bootstrap list".into(),
                ));
            }
            info!(
                cluster_size = config.bootstrap_nodes.len(),
                "bootstrapping new raft cluster"
            );
            self.seed_bootstrap_membership(&peer_book)?
        };

        if snapshot_index > applied {
            applied = snapshot_index;
            applied_store.write(applied)?;
        }

        // Conf-state bootstrapping plants a placeholder snapshot at index 1,
        // so the log proper begins at first_index; nothing real is ever
        // applied below it. Not persisted: the durable store only records
        // entries that actually reached the chain.
        let applied = applied.max(store.first_index()?.saturating_sub(1));

        let raft_config = raft::Config {
            id: u64::from(config.raft_id),
            election_tick: config.raft.election_tick,
            heartbeat_tick: config.raft.heartbeat_tick,
            max_size_per_msg: config.raft.max_size_per_msg,
            max_inflight_msgs: config.raft.max_inflight_msgs,
            applied,
            pre_vote: true,
            check_quorum: false,
            ..Default::default()
        };
        raft_config.validate()?;
        info!(raft_id = raft_config.id, applied, "local raft node configured");

        let logger = slog::Logger::root(slog::Discard, slog::o!());
        let node = RawNode::new(&raft_config, store.clone(), &logger)?;
        let conf_state = store.initial_state()?.conf_state;

        let (block_tx, block_rx) = mpsc::channel(64);
        let (conf_tx, conf_rx) = mpsc::channel(64);
        let (role_tx, role_rx) = watch::channel(Role::Verifier);

        let driver = Driver {
            raft_id: config.raft_id,
            node,
            store,
            wal,
            applied_store,
            snapshots,
            transport,
            peer_book,
            registry: Arc::clone(&self.registry),
            applier: ChainApplier::new(Arc::clone(&self.engine), self.events.clone()),
            role_tx,
            tick_interval: config.tick_interval(),
            snapshot_threshold: config.snapshot_threshold,
            applied,
            snapshot_index,
            conf_state,
            // Seeded from the applied index so conf-change IDs stay
            // monotonic across restarts.
            conf_change_count: applied,
            exit_after_applying: false,
            block_rx,
            conf_rx,
            msg_rx,
            event_rx,
            quit_rx: self.quit_rx.clone(),
        };

        let completion_tx = self.completion_tx.take().ok_or(RaftError::Stopped)?;
        self.driver_handle = Some(tokio::spawn(async move {
            let completion = match driver.run().await {
                Ok(LoopExit::Stopped) => Completion::Stopped,
                Ok(LoopExit::SelfEvicted) => Completion::SelfEvicted,
                Err(e) => {
                    error!(error = %e, "raft driver failed");
                    Completion::Failed(e.to_string())
                }
            };
            let _ = completion_tx.send(Some(completion));
        }));

        self.aux_tasks.push(self.spawn_minted_bridge(block_tx));
        self.aux_tasks.push(self.spawn_role_dispatcher(role_rx));

        self.server = Some(server);
        self.conf_tx = Some(conf_tx);
        self.started = true;
        Ok(())
    }

    /// Stop the node. Teardown order matters: the mined-block bridge and
    /// transport go first, then the driver is signalled; the stores close
    /// when the driver drops them.
    pub async fn stop(&mut self) {
        if !self.started {
            return;
        }
        self.started = false;
        info!(raft_id = self.config.raft_id, "stopping raft protocol handler");

        self.conf_tx = None;
        if let Some(mut server) = self.server.take() {
            server.stop().await;
        }
        let _ = self.quit_tx.send(true);
        if let Some(handle) = self.driver_handle.take() {
            let _ = handle.await;
        }
        for task in self.aux_tasks.drain(..) {
            let _ = task.await;
        }

        info!(raft_id = self.config.raft_id, "raft protocol handler stopped");
    }

    /// Propose adding a member. Returns once Raft has taken the proposal;
    /// commitment is observable via cluster size. Fails with
    /// [`RaftError::BadAddress`] on a malformed enode and with
    /// [`RaftError::NotLeader`] when the cluster has no leader to accept
    /// the change; the caller retries the latter.
    pub async fn propose_peer(&self, raft_id: RaftId, enode_url: &str) -> RaftResult<()> {
        let address = Address::parse_enode(raft_id, enode_url)?;
        let mut cc = ConfChange::default();
        cc.set_change_type(ConfChangeType::AddNode);
        cc.node_id = u64::from(raft_id);
        cc.context = address.to_bytes().into();
        self.send_conf_change(cc).await
    }

    /// Propose removing a member (possibly self). Fails with
    /// [`RaftError::NotLeader`] when the cluster has no leader to accept
    /// the change.
    pub async fn propose_peer_removal(&self, raft_id: RaftId) -> RaftResult<()> {
        let mut cc = ConfChange::default();
        cc.set_change_type(ConfChangeType::RemoveNode);
        cc.node_id = u64::from(raft_id);
        self.send_conf_change(cc).await
    }

    /// Queue the change for the driver and wait for the propose outcome.
    async fn send_conf_change(&self, cc: ConfChange) -> RaftResult<()> {
        let tx = self.conf_tx.as_ref().ok_or(RaftError::Stopped)?;
        let (respond_to, response) = oneshot::channel();
        // Bounded queue with an awaited send: a full queue is backpressure
        // on the caller, never a dropped proposal.
        tx.send(ConfChangeRequest { cc, respond_to })
            .await
            .map_err(|_| RaftError::Stopped)?;
        response.await.map_err(|_| RaftError::Stopped)?
    }

    /// Introspection for the operator console.
    pub fn node_info(&self) -> NodeInfo {
        NodeInfo {
            cluster_size: self.registry.cluster_size(),
            genesis_hash: self.engine.genesis_hash(),
            head_hash: self.engine.head().hash(),
            role: self.registry.role(),
        }
    }

    /// Known peers, self excluded.
    pub fn peers(&self) -> Vec<Address> {
        self.registry.peers()
    }

    /// This node's Raft ID.
    pub fn raft_id(&self) -> RaftId {
        self.config.raft_id
    }

    /// Whether an ID is permanently removed.
    pub fn is_id_removed(&self, raft_id: u64) -> bool {
        self.registry.is_id_removed(raft_id)
    }

    /// Terminal-state channel. Holds `None` until the driver exits.
    pub fn completion(&self) -> watch::Receiver<Option<Completion>> {
        self.completion_rx.clone()
    }

    /// Parse the bootstrap list, record the local address, connect every
    /// other initial member, and seed the voter set.
    ///
    /// Peers are inserted up-front even though no AddNode entries exist for
    /// them: Raft's conf state already names them all, and snapshots must
    /// always carry an address for every conf-state member.
    fn seed_bootstrap_membership(&self, peer_book: &PeerBook) -> RaftResult<ReplicaStore> {
        let nodes = &self.config.bootstrap_nodes;
        if nodes.is_empty() {
            // A joiner restarting before its first snapshot: membership
            // arrives over the wire.
            return Ok(ReplicaStore::new());
        }

        let mut local = None;
        let mut peer_addresses = Vec::with_capacity(nodes.len() - 1);
        for (i, url) in nodes.iter().enumerate() {
            let address = Address::parse_enode((i as RaftId) + 1, url)?;
            if address.raft_id == self.config.raft_id {
                local = Some(address);
            } else {
                peer_addresses.push(address);
            }
        }
        let local = local.ok_or_else(|| {
            RaftError::Config(format!(
                "raft_id {} does not appear in the bootstrap list",
                self.config.raft_id
            ))
        })?;

        self.registry.set_local(local);
        for address in &peer_addresses {
            peer_book.add_peer(address);
        }

        let voters = (1..=nodes.len() as u64).collect();
        Ok(ReplicaStore::bootstrap(voters))
    }

    /// Forward mined blocks from the chain event bus into the driver.
    fn spawn_minted_bridge(&self, block_tx: mpsc::Sender<quill_chain::Block>) -> JoinHandle<()> {
        let mut chain_rx = self.events.subscribe();
        let mut quit = self.quit_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = quit.changed() => break,
                    event = chain_rx.recv() => match event {
                        Ok(ChainEvent::BlockMinted(block)) => {
                            if block_tx.send(block).await.is_err() {
                                break;
                            }
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "mined-block bridge lagged behind the event bus");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        })
    }

    /// Start or stop the minter as leadership moves.
    fn spawn_role_dispatcher(&self, mut role_rx: watch::Receiver<Role>) -> JoinHandle<()> {
        let minter = Arc::clone(&self.minter);
        let mut quit = self.quit_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = quit.changed() => break,
                    changed = role_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        match *role_rx.borrow_and_update() {
                            Role::Minter => {
                                info!("became minter");
                                minter.start();
                            }
                            Role::Verifier => {
                                info!("became verifier");
                                minter.stop();
                            }
                        }
                    }
                }
            }
            minter.stop();
        })
    }
}
