//! Chain applier: commits Raft-ordered blocks to the blockchain.

use std::sync::Arc;

use quill_chain::{Block, BlockEngine, ChainEvent, EventBus};
use tracing::{info, warn};

use crate::error::{RaftError, RaftResult};

/// Applies committed blocks in log order, enforcing that each one extends
/// the current head.
pub struct ChainApplier {
    engine: Arc<dyn BlockEngine>,
    events: EventBus,
}

impl ChainApplier {
    /// Create an applier over the given engine.
    pub fn new(engine: Arc<dyn BlockEngine>, events: EventBus) -> Self {
        ChainApplier { engine, events }
    }

    /// Apply one committed block.
    ///
    /// A block whose parent is not the current head is discarded with an
    /// [`ChainEvent::InvalidRaftOrdering`] event: the expected, benign case
    /// when the previous minter proposed it before learning that an earlier
    /// block of its own had committed. Validation or insertion failures are
    /// fatal, since consensus has ordered the block and local disagreement
    /// means divergence.
    pub fn apply_new_chain_head(&self, block: &Block) -> RaftResult<()> {
        let head = self.engine.head();
        let head_hash = head.hash();

        if block.parent_hash != head_hash {
            warn!(
                block = %block.hash(),
                parent = %block.parent_hash,
                head = %head_hash,
                "discarding non-extending block"
            );
            self.events.post(ChainEvent::InvalidRaftOrdering {
                head: head_hash,
                invalid: block.clone(),
            });
            return Ok(());
        }

        let hash = block.hash();
        if self.engine.block_by_hash(&hash).is_none() {
            // Unknown block: full validation. A known hash is a replay
            // (crash between apply and applied-index write) and skips it.
            self.engine.validate_block(block).map_err(|e| {
                RaftError::Invariant(format!(
                    "consensus accepted block {hash} that fails validation: {e}"
                ))
            })?;
        }

        self.engine
            .insert_block(block.clone())
            .map_err(|e| RaftError::Invariant(format!("failed to extend chain with {hash}: {e}")))?;

        info!(block = %hash, number = block.number, "extended chain");
        Ok(())
    }
}
