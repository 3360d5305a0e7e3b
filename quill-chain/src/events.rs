//! Chain event bus.
//!
//! A broadcast channel connecting the minter, the ordering core, and any
//! observers. The minter publishes [`ChainEvent::BlockMinted`]; the ordering
//! core publishes [`ChainEvent::InvalidRaftOrdering`] so the minter can
//! re-mint on top of the real head.

use tokio::sync::broadcast;

use crate::block::{Block, BlockHash};

/// Events flowing between the chain components.
#[derive(Debug, Clone)]
pub enum ChainEvent {
    /// The local minter assembled a new candidate block.
    BlockMinted(Block),
    /// A committed block did not extend the chain head and was discarded.
    InvalidRaftOrdering {
        /// The head at the time the block was applied.
        head: BlockHash,
        /// The discarded block.
        invalid: Block,
    },
}

/// Cloneable handle to the broadcast bus.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ChainEvent>,
}

impl EventBus {
    /// Create a bus with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        EventBus { tx }
    }

    /// Subscribe to all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<ChainEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Events posted while nobody is subscribed are
    /// dropped, matching broadcast semantics.
    pub fn post(&self, event: ChainEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_posted_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.post(ChainEvent::BlockMinted(Block::genesis()));

        match rx.recv().await.unwrap() {
            ChainEvent::BlockMinted(block) => assert_eq!(block.number, 0),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn post_without_subscribers_is_a_noop() {
        let bus = EventBus::default();
        bus.post(ChainEvent::BlockMinted(Block::genesis()));
    }
}
