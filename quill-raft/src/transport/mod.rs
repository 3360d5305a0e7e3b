//! HTTP transport for Raft messages.
//!
//! Each cluster member listens on `raft_port_base + raft_id` and POSTs
//! protobuf-encoded Raft messages to its peers. The server side holds a
//! narrow [`RaftHandler`] capability (enough to gate tombstoned senders and
//! hand messages to the driver), never the protocol manager itself.

mod client;
mod server;

pub use client::{RaftTransport, TransportEvent};
pub use server::RaftServer;

use raft::eraftpb::Message;

use crate::error::RaftResult;

/// HTTP header carrying the cluster ID.
pub const CLUSTER_HEADER: &str = "x-quill-raft-cluster";

/// Path Raft messages are POSTed to.
pub const RAFT_PATH: &str = "/raft";

/// What the transport may ask of the protocol manager.
pub trait RaftHandler: Send + Sync {
    /// Whether this Raft ID has been permanently removed from the cluster.
    /// Traffic from removed members is rejected at the door.
    fn is_id_removed(&self, raft_id: u64) -> bool;

    /// Hand an inbound message to the Raft driver.
    fn deliver(&self, message: Message) -> RaftResult<()>;
}
