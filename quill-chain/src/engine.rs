//! Seams to the external collaborators of the ordering core.
//!
//! The ordering core never validates, executes, or persists blocks itself
//! and never dials p2p connections; it drives these traits.

use crate::block::{Block, BlockHash};
use crate::error::ChainResult;

/// The blockchain engine: validation, state transition, persistence.
pub trait BlockEngine: Send + Sync {
    /// Hash of the genesis block.
    fn genesis_hash(&self) -> BlockHash;

    /// The current chain head.
    fn head(&self) -> Block;

    /// Look up a block by hash, if the engine already knows it.
    fn block_by_hash(&self, hash: &BlockHash) -> Option<Block>;

    /// Run full validation on a block that extends the current head.
    fn validate_block(&self, block: &Block) -> ChainResult<()>;

    /// Append a validated (or already-known) block to the chain.
    fn insert_block(&self, block: Block) -> ChainResult<()>;
}

/// The block producer. Started on the member that holds Raft leadership,
/// stopped everywhere else.
pub trait Minter: Send + Sync {
    /// Begin assembling blocks and publishing them on the event bus.
    fn start(&self);

    /// Stop assembling blocks.
    fn stop(&self);
}

/// The peer-to-peer server. The ordering core only tells it which peers to
/// keep connections to; dialling, handshakes and gossip are its business.
pub trait P2pService: Send + Sync {
    /// Dial and retain a connection to the peer at `node_id@ip:port`.
    fn add_peer(&self, node_id: &[u8], ip: std::net::Ipv4Addr, port: u16);

    /// Drop the connection to the peer.
    fn remove_peer(&self, node_id: &[u8], ip: std::net::Ipv4Addr, port: u16);
}

/// A p2p service that ignores every call, for embedders and tests that run
/// without a devp2p stack.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullP2p;

impl P2pService for NullP2p {
    fn add_peer(&self, _node_id: &[u8], _ip: std::net::Ipv4Addr, _port: u16) {}
    fn remove_peer(&self, _node_id: &[u8], _ip: std::net::Ipv4Addr, _port: u16) {}
}
