//! Error types for the ordering core.

use thiserror::Error;

/// Result type for ordering-core operations.
pub type RaftResult<T> = std::result::Result<T, RaftError>;

/// Errors surfaced by the protocol manager and its stores.
#[derive(Debug, Error)]
pub enum RaftError {
    /// A peer address could not be parsed or is not IPv4.
    #[error("bad address: {0}")]
    BadAddress(String),

    /// Invalid node configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The cluster currently has no leader to accept the proposal.
    /// Transient; the caller retries.
    #[error("no leader available to accept the proposal")]
    NotLeader,

    /// A durable store failed. Fatal: the driver aborts.
    #[error("storage error: {0}")]
    Storage(String),

    /// A durable store holds data that fails integrity checks. Fatal.
    #[error("corrupt store: {0}")]
    Corrupt(String),

    /// The committed log contradicts local state. Fatal: implies divergence
    /// from the rest of the cluster.
    #[error("invariant violation: {0}")]
    Invariant(String),

    /// Error from the Raft library.
    #[error("raft error: {0}")]
    Raft(#[from] raft::Error),

    /// Error from the chain layer.
    #[error("chain error: {0}")]
    Chain(#[from] quill_chain::ChainError),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Wire encoding or decoding failed.
    #[error("codec error: {0}")]
    Codec(String),

    /// The manager is not running.
    #[error("protocol manager is stopped")]
    Stopped,
}

impl From<prost::DecodeError> for RaftError {
    fn from(e: prost::DecodeError) -> Self {
        RaftError::Codec(e.to_string())
    }
}

impl From<bincode::Error> for RaftError {
    fn from(e: bincode::Error) -> Self {
        RaftError::Codec(e.to_string())
    }
}
