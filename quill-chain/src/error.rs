//! Error types for chain operations.

use thiserror::Error;

use crate::block::BlockHash;

/// Result type for chain operations.
pub type ChainResult<T> = std::result::Result<T, ChainError>;

/// Errors that can occur when validating or extending the chain.
#[derive(Debug, Error)]
pub enum ChainError {
    /// The block failed validation.
    #[error("block {hash} failed validation: {reason}")]
    InvalidBlock {
        /// Hash of the rejected block.
        hash: BlockHash,
        /// Why validation rejected it.
        reason: String,
    },

    /// The block does not extend the current head.
    #[error("block {hash} does not extend head {head}")]
    NonExtending {
        /// Hash of the offered block.
        hash: BlockHash,
        /// The current chain head.
        head: BlockHash,
    },

    /// The referenced block is unknown.
    #[error("unknown block {0}")]
    UnknownBlock(BlockHash),

    /// Block encoding or decoding failed.
    #[error("block codec error: {0}")]
    Codec(String),
}

impl From<bincode::Error> for ChainError {
    fn from(e: bincode::Error) -> Self {
        ChainError::Codec(e.to_string())
    }
}
