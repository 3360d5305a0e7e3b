//! In-memory block engine.
//!
//! Keeps the whole chain in a hash-indexed map. Used by the integration
//! harness and by embedders that bring their own execution layer.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::block::{Block, BlockHash};
use crate::engine::BlockEngine;
use crate::error::{ChainError, ChainResult};

struct Inner {
    blocks: HashMap<BlockHash, Block>,
    head: BlockHash,
    genesis: BlockHash,
}

/// An in-memory [`BlockEngine`].
pub struct MemoryEngine {
    inner: RwLock<Inner>,
}

impl MemoryEngine {
    /// Create an engine holding only the genesis block.
    pub fn new() -> Self {
        let genesis = Block::genesis();
        let hash = genesis.hash();
        let mut blocks = HashMap::new();
        blocks.insert(hash, genesis);
        MemoryEngine {
            inner: RwLock::new(Inner {
                blocks,
                head: hash,
                genesis: hash,
            }),
        }
    }

    /// Number of blocks in the chain, genesis included.
    pub fn len(&self) -> usize {
        self.inner.read().blocks.len()
    }

    /// Whether only genesis is present.
    pub fn is_empty(&self) -> bool {
        self.len() <= 1
    }
}

impl Default for MemoryEngine {
    fn default() -> Self {
        MemoryEngine::new()
    }
}

impl BlockEngine for MemoryEngine {
    fn genesis_hash(&self) -> BlockHash {
        self.inner.read().genesis
    }

    fn head(&self) -> Block {
        let inner = self.inner.read();
        inner.blocks[&inner.head].clone()
    }

    fn block_by_hash(&self, hash: &BlockHash) -> Option<Block> {
        self.inner.read().blocks.get(hash).cloned()
    }

    fn validate_block(&self, block: &Block) -> ChainResult<()> {
        let inner = self.inner.read();
        let parent = inner
            .blocks
            .get(&block.parent_hash)
            .ok_or(ChainError::UnknownBlock(block.parent_hash))?;
        if block.number != parent.number + 1 {
            return Err(ChainError::InvalidBlock {
                hash: block.hash(),
                reason: format!(
                    "number {} does not follow parent number {}",
                    block.number, parent.number
                ),
            });
        }
        Ok(())
    }

    fn insert_block(&self, block: Block) -> ChainResult<()> {
        let hash = block.hash();
        let mut inner = self.inner.write();
        if block.parent_hash != inner.head {
            return Err(ChainError::NonExtending {
                hash,
                head: inner.head,
            });
        }
        inner.blocks.insert(hash, block);
        inner.head = hash;
        Ok(())
    }
}
