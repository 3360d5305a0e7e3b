//! Raft-driven block ordering for permissioned Quill networks.
//!
//! Instead of racing on a proof-of-work puzzle, one designated member (the
//! *minter*, always the Raft leader) assembles candidate blocks and a Raft
//! cluster totally orders them. This crate is the protocol manager that
//! makes that happen: it owns the local Raft node, multiplexes block and
//! membership proposals into the replicated log, drives the Ready loop
//! (persist, ship, apply, snapshot, advance), keeps a durable applied index
//! so a restarted node rejoins exactly where it left off, and flips the
//! local minter on and off as leadership moves.
//!
//! # Architecture
//!
//! ```text
//!  minter ──BlockMinted──▶ EventBus ──▶ bridge ─┐
//!  operator ──ProposePeer/Removal──────────────┤
//!                                              ▼
//!                  ┌──────────── Raft driver ───────────────┐
//!   peers ◀──HTTP──│  tick · ready · persist · ship · apply │──▶ chain
//!   peers ──HTTP──▶│  WAL · snapshots · applied index       │    engine
//!                  └──────────────────────────────────────┬─┘
//!                                                         ▼
//!                                           completion (stopped /
//!                                           self-evicted / failed)
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use quill_raft::{NodeConfig, ProtocolManager};
//!
//! let config = NodeConfig::builder()
//!     .raft_id(1)
//!     .data_dir("/var/lib/quill")
//!     .bootstrap_nodes(vec![enode1, enode2, enode3])
//!     .build()?;
//!
//! let mut manager = ProtocolManager::new(config, engine, events, minter, p2p)?;
//! manager.start().await?;
//! ```

pub mod address;
pub mod applier;
pub mod config;
mod driver;
pub mod error;
pub mod manager;
mod registry;
pub mod storage;
pub mod transport;

pub use address::{raft_port, Address, NodeId, RaftId, DEFAULT_RAFT_PORT_BASE};
pub use config::{NodeConfig, NodeConfigBuilder, RaftTuning, CLUSTER_ID};
pub use error::{RaftError, RaftResult};
pub use manager::{Completion, NodeInfo, ProtocolManager, Role};
