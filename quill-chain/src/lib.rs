//! Chain-side contracts for the Quill ordering core.
//!
//! The consensus layer in `quill-raft` decides the *order* of blocks; this
//! crate defines everything it needs to know about the blocks themselves:
//!
//! - the [`Block`] model and its canonical byte codec,
//! - the [`BlockEngine`] trait, the seam to the real blockchain engine
//!   (validation, state transition, persistence),
//! - the [`Minter`] and [`P2pService`] traits for the block producer and the
//!   peer-to-peer server,
//! - the [`EventBus`] carrying mined blocks in and ordering anomalies out,
//! - [`MemoryEngine`], an in-memory engine for tests and embedders.

pub mod block;
pub mod engine;
pub mod error;
pub mod events;
pub mod memory;

pub use block::{Block, BlockHash};
pub use engine::{BlockEngine, Minter, P2pService};
pub use error::{ChainError, ChainResult};
pub use events::{ChainEvent, EventBus};
pub use memory::MemoryEngine;
