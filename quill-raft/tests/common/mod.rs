//! Common test utilities for quill-raft tests.

// Each test binary uses a different subset of these helpers.
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use quill_chain::engine::NullP2p;
use quill_chain::{Block, BlockEngine, ChainEvent, EventBus, MemoryEngine, Minter};
use quill_raft::storage::AppliedIndexStore;
use quill_raft::{NodeConfig, ProtocolManager, RaftId, Role};
use tempfile::TempDir;

/// Atomic counter handing out disjoint port ranges per test.
static PORT_BASE: AtomicU16 = AtomicU16::new(21000);

/// Reserve a port base; raft IDs are added to it, so step past a cluster's
/// worth of ports.
pub fn alloc_port_base() -> u16 {
    PORT_BASE.fetch_add(16, Ordering::SeqCst)
}

/// A deterministic enode URL for the given Raft ID.
pub fn test_enode(raft_id: RaftId) -> String {
    format!(
        "enode://{}@127.0.0.1:{}",
        hex::encode([raft_id as u8; 64]),
        33300 + raft_id
    )
}

/// Minter stub recording whether it is running.
#[derive(Default)]
pub struct TestMinter {
    running: AtomicBool,
}

impl TestMinter {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Minter for TestMinter {
    fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// One cluster member under test.
pub struct TestNode {
    pub raft_id: RaftId,
    pub manager: ProtocolManager,
    pub engine: Arc<MemoryEngine>,
    pub events: EventBus,
    pub minter: Arc<TestMinter>,
    pub data_dir: PathBuf,
}

impl TestNode {
    /// Start a node. `engine` is passed in so a restart can keep its chain,
    /// the way a real node keeps its database.
    pub async fn start(
        raft_id: RaftId,
        port_base: u16,
        bootstrap: Vec<String>,
        data_dir: &Path,
        join_existing: bool,
        engine: Arc<MemoryEngine>,
        snapshot_threshold: u64,
    ) -> TestNode {
        let events = EventBus::new(256);
        let minter = Arc::new(TestMinter::default());

        let config = NodeConfig::builder()
            .raft_id(raft_id)
            .data_dir(data_dir)
            .bootstrap_nodes(bootstrap)
            .join_existing(join_existing)
            .raft_port_base(port_base)
            .tick_interval_ms(20)
            .transport_timeout_ms(500)
            .snapshot_threshold(snapshot_threshold)
            .build()
            .expect("invalid test config");

        let mut manager = ProtocolManager::new(
            config,
            engine.clone(),
            events.clone(),
            minter.clone(),
            Arc::new(NullP2p),
        )
        .expect("failed to create manager");
        manager.start().await.expect("failed to start node");

        TestNode {
            raft_id,
            manager,
            engine,
            events,
            minter,
            data_dir: data_dir.to_path_buf(),
        }
    }

    /// Assemble the next block and publish it on this node's event bus, as
    /// the minter would.
    pub fn mint_block(&self, payload: &[u8]) -> Block {
        let head = self.engine.head();
        let block = Block::next(&head, self.raft_id, vec![payload.to_vec()]);
        self.events.post(ChainEvent::BlockMinted(block.clone()));
        block
    }

    pub fn role(&self) -> Role {
        self.manager.node_info().role
    }

    /// The durably recorded applied index.
    pub fn applied_index(&self) -> u64 {
        AppliedIndexStore::open(&self.data_dir.join("quorum-raft-state"))
            .expect("open applied store")
            .load()
            .expect("load applied index")
    }
}

/// A bootstrapped cluster plus its temp directories.
pub struct TestCluster {
    pub nodes: Vec<TestNode>,
    pub enodes: Vec<String>,
    pub port_base: u16,
    pub dirs: Vec<TempDir>,
}

impl TestCluster {
    /// Bootstrap `count` nodes that all know each other from the start.
    pub async fn bootstrap(count: usize) -> TestCluster {
        let port_base = alloc_port_base();
        let enodes: Vec<String> = (1..=count).map(|i| test_enode(i as RaftId)).collect();

        let mut dirs = Vec::with_capacity(count);
        let mut nodes = Vec::with_capacity(count);
        for i in 1..=count {
            let dir = TempDir::new().expect("create temp dir");
            let node = TestNode::start(
                i as RaftId,
                port_base,
                enodes.clone(),
                dir.path(),
                false,
                Arc::new(MemoryEngine::new()),
                250,
            )
            .await;
            dirs.push(dir);
            nodes.push(node);
        }

        TestCluster {
            nodes,
            enodes,
            port_base,
            dirs,
        }
    }

    /// Wait until exactly one member is the minter; returns its index.
    pub async fn wait_for_minter(&self, timeout: Duration) -> Option<usize> {
        let start = Instant::now();
        while start.elapsed() < timeout {
            let minters: Vec<usize> = self
                .nodes
                .iter()
                .enumerate()
                .filter(|(_, n)| n.role() == Role::Minter)
                .map(|(i, _)| i)
                .collect();
            if minters.len() == 1 {
                return Some(minters[0]);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        None
    }

    pub async fn shutdown(&mut self) {
        for node in &mut self.nodes {
            node.manager.stop().await;
        }
    }
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}
