//! The block model and its canonical byte codec.
//!
//! Consensus treats blocks as opaque payloads: they are encoded with
//! [`Block::encode`] before being proposed into the replicated log and
//! decoded with [`Block::decode`] when a committed entry is applied. The
//! codec is canonical, so a block's hash is stable across every replica and
//! every replay.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{ChainError, ChainResult};

/// 32-byte block hash (blake3 over the canonical encoding).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct BlockHash(pub [u8; 32]);

impl BlockHash {
    /// The all-zero hash, used as the genesis parent.
    pub const ZERO: BlockHash = BlockHash([0u8; 32]);

    /// Hex-encode the full hash.
    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    /// Parse a hash from a 64-character hex string.
    pub fn from_hex(s: &str) -> ChainResult<Self> {
        let bytes = hex::decode(s).map_err(|e| ChainError::Codec(e.to_string()))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| ChainError::Codec("hash must be 32 bytes".into()))?;
        Ok(BlockHash(arr))
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form for logs; `to_hex` gives the full digest.
        write!(f, "{}", &hex::encode(self.0)[..12])
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockHash({})", self.to_hex())
    }
}

impl Serialize for BlockHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_hex())
        } else {
            serializer.serialize_bytes(&self.0)
        }
    }
}

impl<'de> Deserialize<'de> for BlockHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            BlockHash::from_hex(&s).map_err(serde::de::Error::custom)
        } else {
            let bytes = <Vec<u8>>::deserialize(deserializer)?;
            let arr: [u8; 32] = bytes
                .try_into()
                .map_err(|_| serde::de::Error::custom("hash must be 32 bytes"))?;
            Ok(BlockHash(arr))
        }
    }
}

/// A block as seen by the ordering core.
///
/// The transaction payloads are opaque byte strings; execution happens in
/// the engine, not here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Hash of the parent block.
    pub parent_hash: BlockHash,
    /// Height of this block (genesis is 0).
    pub number: u64,
    /// Unix timestamp (seconds) at minting time.
    pub timestamp: u64,
    /// Raft ID of the minter that assembled the block.
    pub proposer: u16,
    /// Opaque transaction payloads.
    pub transactions: Vec<Vec<u8>>,
    /// Arbitrary extra data.
    pub extra: Vec<u8>,
}

impl Block {
    /// The genesis block.
    pub fn genesis() -> Self {
        Block {
            parent_hash: BlockHash::ZERO,
            number: 0,
            timestamp: 0,
            proposer: 0,
            transactions: Vec::new(),
            extra: b"quill-genesis".to_vec(),
        }
    }

    /// Build the successor of `parent` with the given payloads.
    pub fn next(parent: &Block, proposer: u16, transactions: Vec<Vec<u8>>) -> Self {
        Block {
            parent_hash: parent.hash(),
            number: parent.number + 1,
            timestamp: unix_now(),
            proposer,
            transactions,
            extra: Vec::new(),
        }
    }

    /// Hash of the block: blake3 over the canonical encoding.
    pub fn hash(&self) -> BlockHash {
        let encoded = bincode::serialize(self).expect("block encoding is infallible");
        BlockHash(*blake3::hash(&encoded).as_bytes())
    }

    /// Canonical byte encoding, used for Raft log payloads.
    pub fn encode(&self) -> ChainResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Inverse of [`Block::encode`].
    pub fn decode(bytes: &[u8]) -> ChainResult<Block> {
        Ok(bincode::deserialize(bytes)?)
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
