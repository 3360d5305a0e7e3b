//! Node configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::address::{RaftId, DEFAULT_RAFT_PORT_BASE};
use crate::error::{RaftError, RaftResult};

/// Cluster ID carried on every transport request; requests from other
/// clusters are rejected.
pub const CLUSTER_ID: u64 = 0x1000;

/// Configuration for an ordering-core node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// This node's Raft ID (1-based for initial cluster members).
    pub raft_id: RaftId,

    /// Data directory; the WAL, snapshots and applied-index store live in
    /// subdirectories of it.
    pub data_dir: PathBuf,

    /// Enode URLs of the initial cluster, in Raft ID order (entry `i` gets
    /// Raft ID `i + 1`). Must include this node. Ignored when joining or
    /// restarting.
    pub bootstrap_nodes: Vec<String>,

    /// Join an existing cluster instead of bootstrapping a new one. The
    /// node starts empty and waits for a snapshot from the leader.
    pub join_existing: bool,

    /// Base port for the Raft HTTP transport; this node listens on
    /// `base + raft_id`.
    pub raft_port_base: u16,

    /// Raft logical clock interval in milliseconds.
    pub tick_interval_ms: u64,

    /// Raft timing and flow control.
    pub raft: RaftTuning,

    /// Take a periodic snapshot after this many applied entries since the
    /// last one. Config changes always force a snapshot regardless.
    pub snapshot_threshold: u64,

    /// Timeout for a single outbound transport request.
    pub transport_timeout_ms: u64,
}

/// Raft protocol tuning, in ticks and bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftTuning {
    /// Ticks without leader contact before a follower campaigns.
    pub election_tick: usize,
    /// Ticks between leader heartbeats.
    pub heartbeat_tick: usize,
    /// Max bytes of log entries per append message.
    pub max_size_per_msg: u64,
    /// Max in-flight append messages per follower.
    pub max_inflight_msgs: usize,
}

impl Default for RaftTuning {
    fn default() -> Self {
        RaftTuning {
            election_tick: 10,
            heartbeat_tick: 1,
            max_size_per_msg: 4096,
            max_inflight_msgs: 256,
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            raft_id: 1,
            data_dir: PathBuf::from("./quill-data"),
            bootstrap_nodes: Vec::new(),
            join_existing: false,
            raft_port_base: DEFAULT_RAFT_PORT_BASE,
            tick_interval_ms: 100,
            raft: RaftTuning::default(),
            snapshot_threshold: 250,
            transport_timeout_ms: 1000,
        }
    }
}

impl NodeConfig {
    /// Create a configuration builder.
    pub fn builder() -> NodeConfigBuilder {
        NodeConfigBuilder::default()
    }

    /// The tick interval as a [`Duration`].
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Directory of the Raft write-ahead log.
    pub fn wal_dir(&self) -> PathBuf {
        self.data_dir.join("raft-wal")
    }

    /// Directory of snapshot files.
    pub fn snap_dir(&self) -> PathBuf {
        self.data_dir.join("raft-snap")
    }

    /// Directory of the applied-index store.
    pub fn state_dir(&self) -> PathBuf {
        self.data_dir.join("quorum-raft-state")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> RaftResult<()> {
        if self.raft_id == 0 {
            return Err(RaftError::Config("raft_id must be > 0".into()));
        }
        if self.tick_interval_ms == 0 {
            return Err(RaftError::Config("tick_interval_ms must be > 0".into()));
        }
        if self.raft.heartbeat_tick == 0 || self.raft.election_tick <= self.raft.heartbeat_tick {
            return Err(RaftError::Config(
                "election_tick must be greater than heartbeat_tick".into(),
            ));
        }
        if self.snapshot_threshold == 0 {
            return Err(RaftError::Config("snapshot_threshold must be > 0".into()));
        }
        if !self.join_existing
            && !self.bootstrap_nodes.is_empty()
            && usize::from(self.raft_id) > self.bootstrap_nodes.len()
        {
            return Err(RaftError::Config(format!(
                "raft_id {} is outside the bootstrap list of {} nodes",
                self.raft_id,
                self.bootstrap_nodes.len()
            )));
        }
        Ok(())
    }
}

/// Builder for [`NodeConfig`].
#[derive(Debug, Default)]
pub struct NodeConfigBuilder {
    config: NodeConfig,
}

impl NodeConfigBuilder {
    /// Set the Raft ID.
    pub fn raft_id(mut self, id: RaftId) -> Self {
        self.config.raft_id = id;
        self
    }

    /// Set the data directory.
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_dir = path.into();
        self
    }

    /// Set the initial cluster enode list.
    pub fn bootstrap_nodes(mut self, nodes: impl IntoIterator<Item = String>) -> Self {
        self.config.bootstrap_nodes = nodes.into_iter().collect();
        self
    }

    /// Join an existing cluster instead of bootstrapping.
    pub fn join_existing(mut self, join: bool) -> Self {
        self.config.join_existing = join;
        self
    }

    /// Set the transport port base.
    pub fn raft_port_base(mut self, base: u16) -> Self {
        self.config.raft_port_base = base;
        self
    }

    /// Set the tick interval in milliseconds.
    pub fn tick_interval_ms(mut self, ms: u64) -> Self {
        self.config.tick_interval_ms = ms;
        self
    }

    /// Set the periodic snapshot threshold.
    pub fn snapshot_threshold(mut self, entries: u64) -> Self {
        self.config.snapshot_threshold = entries;
        self
    }

    /// Set the outbound transport timeout in milliseconds.
    pub fn transport_timeout_ms(mut self, ms: u64) -> Self {
        self.config.transport_timeout_ms = ms;
        self
    }

    /// Validate and build the configuration.
    pub fn build(self) -> RaftResult<NodeConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
