//! Single-member cluster tests: minting, durability, restart.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{alloc_port_base, test_enode, wait_for, TestCluster, TestNode};
use quill_chain::{Block, BlockEngine, ChainEvent, MemoryEngine};
use quill_raft::Role;
use tempfile::TempDir;

/// A lone bootstrap node elects itself and starts the minter.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_node_becomes_minter() {
    let mut cluster = TestCluster::bootstrap(1).await;
    let node = &cluster.nodes[0];

    assert!(
        cluster.wait_for_minter(Duration::from_secs(5)).await == Some(0),
        "single node should become the minter"
    );
    assert!(
        wait_for(Duration::from_secs(2), || node.minter.is_running()).await,
        "minter should be started on leadership"
    );

    let info = node.manager.node_info();
    assert_eq!(info.cluster_size, 1);
    assert_eq!(info.role, Role::Minter);
    assert_eq!(info.head_hash, info.genesis_hash);

    cluster.shutdown().await;
}

/// A minted block is committed through the log and the durable applied
/// index advances.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn minted_block_extends_chain_and_applied_index() {
    let mut cluster = TestCluster::bootstrap(1).await;
    cluster
        .wait_for_minter(Duration::from_secs(5))
        .await
        .expect("minter");
    let node = &cluster.nodes[0];
    let applied_before = node.applied_index();

    let block = node.mint_block(b"tx-1");
    let hash = block.hash();

    assert!(
        wait_for(Duration::from_secs(5), || node.engine.head().hash() == hash).await,
        "block should become the head"
    );
    assert!(
        wait_for(Duration::from_secs(5), || {
            node.applied_index() > applied_before
        })
        .await,
        "durable applied index should advance"
    );

    cluster.shutdown().await;
}

/// A block that does not extend the head is discarded with an event; the
/// applied index still advances.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn non_extending_block_is_discarded() {
    let mut cluster = TestCluster::bootstrap(1).await;
    cluster
        .wait_for_minter(Duration::from_secs(5))
        .await
        .expect("minter");
    let node = &cluster.nodes[0];

    let genesis = node.engine.head();
    let first = node.mint_block(b"tx-1");
    let first_hash = first.hash();
    assert!(
        wait_for(Duration::from_secs(5), || {
            node.engine.head().hash() == first_hash
        })
        .await
    );

    let mut events = node.events.subscribe();
    let applied_before = node.applied_index();

    // Minted against the stale head, as a deposed minter would.
    let stale = Block::next(&genesis, 1, vec![b"stale".to_vec()]);
    node.events.post(ChainEvent::BlockMinted(stale.clone()));

    let event = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let ChainEvent::InvalidRaftOrdering { head, invalid } =
                events.recv().await.expect("event bus closed")
            {
                return (head, invalid);
            }
        }
    })
    .await
    .expect("expected an InvalidRaftOrdering event");

    assert_eq!(event.0, first_hash);
    assert_eq!(event.1.hash(), stale.hash());
    assert_eq!(node.engine.head().hash(), first_hash, "stale block not inserted");
    assert!(
        wait_for(Duration::from_secs(5), || {
            node.applied_index() > applied_before
        })
        .await,
        "applied index advances past the discarded entry"
    );

    cluster.shutdown().await;
}

/// Clean shutdown and restart: the WAL replays, the node resumes at the
/// recorded applied index, and no block is inserted twice.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn restart_resumes_without_duplicate_insertions() {
    let port_base = alloc_port_base();
    let dir = TempDir::new().unwrap();
    let engine = Arc::new(MemoryEngine::new());
    let bootstrap = vec![test_enode(1)];

    let mut node = TestNode::start(
        1,
        port_base,
        bootstrap.clone(),
        dir.path(),
        false,
        engine.clone(),
        250,
    )
    .await;
    assert!(wait_for(Duration::from_secs(5), || node.role() == Role::Minter).await);

    for payload in [b"tx-1".as_slice(), b"tx-2".as_slice()] {
        let block = node.mint_block(payload);
        let hash = block.hash();
        assert!(
            wait_for(Duration::from_secs(5), || engine.head().hash() == hash).await,
            "block should commit before shutdown"
        );
    }

    let applied_before = node.applied_index();
    let blocks_before = engine.len();
    assert!(applied_before > 0);
    node.manager.stop().await;

    // Same data dir, same (durable) chain.
    let mut node = TestNode::start(
        1,
        port_base,
        bootstrap,
        dir.path(),
        false,
        engine.clone(),
        250,
    )
    .await;
    assert!(
        wait_for(Duration::from_secs(5), || node.role() == Role::Minter).await,
        "restarted node should regain leadership"
    );

    assert_eq!(engine.len(), blocks_before, "no duplicate chain insertions");
    assert!(node.applied_index() >= applied_before);

    // The chain keeps extending after the restart.
    let block = node.mint_block(b"tx-3");
    let hash = block.hash();
    assert!(wait_for(Duration::from_secs(5), || engine.head().hash() == hash).await);
    assert_eq!(engine.len(), blocks_before + 1);

    node.manager.stop().await;
}

/// Crossing the snapshot threshold persists a snapshot, and the node
/// restarts from it.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn periodic_snapshot_is_taken_and_restartable() {
    let port_base = alloc_port_base();
    let dir = TempDir::new().unwrap();
    let engine = Arc::new(MemoryEngine::new());
    let bootstrap = vec![test_enode(1)];

    let mut node = TestNode::start(
        1,
        port_base,
        bootstrap.clone(),
        dir.path(),
        false,
        engine.clone(),
        4,
    )
    .await;
    assert!(wait_for(Duration::from_secs(5), || node.role() == Role::Minter).await);

    for i in 0..6u8 {
        let block = node.mint_block(&[i]);
        let hash = block.hash();
        assert!(wait_for(Duration::from_secs(5), || engine.head().hash() == hash).await);
    }

    let snap_dir = dir.path().join("raft-snap");
    assert!(
        wait_for(Duration::from_secs(5), || {
            std::fs::read_dir(&snap_dir)
                .map(|entries| entries.count() > 0)
                .unwrap_or(false)
        })
        .await,
        "a periodic snapshot should be on disk"
    );

    let blocks_before = engine.len();
    node.manager.stop().await;

    let mut node = TestNode::start(
        1,
        port_base,
        bootstrap,
        dir.path(),
        false,
        engine.clone(),
        4,
    )
    .await;
    assert!(
        wait_for(Duration::from_secs(5), || node.role() == Role::Minter).await,
        "node should restart from the snapshot"
    );
    assert_eq!(engine.len(), blocks_before);

    let block = node.mint_block(b"after-restart");
    let hash = block.hash();
    assert!(wait_for(Duration::from_secs(5), || engine.head().hash() == hash).await);

    node.manager.stop().await;
}

/// The completion channel reports a clean stop.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_resolves_completion_channel() {
    let mut cluster = TestCluster::bootstrap(1).await;
    let mut completion = cluster.nodes[0].manager.completion();

    cluster.shutdown().await;

    assert!(
        wait_for(Duration::from_secs(2), || {
            matches!(*completion.borrow_and_update(), Some(quill_raft::Completion::Stopped))
        })
        .await,
        "stop should resolve the completion channel"
    );
}
