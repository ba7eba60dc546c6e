//! Blocks and transactions.
//!
//! A block is immutable once hashed. Its self-hash covers every field except
//! the hash itself and the producer's key and signature, so a block can be signed
//! after it is built without changing its identity.

use serde::{Deserialize, Serialize};

use crate::{BlockHash, NodeId, GENESIS_HEIGHT};

/// An opaque client transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Transaction {
    /// Submitting node
    pub from: NodeId,
    /// Per-sender sequence number
    pub nonce: u64,
    /// Application payload (not interpreted by consensus)
    pub payload: Vec<u8>,
}

impl Transaction {
    pub fn new(from: NodeId, nonce: u64, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            from,
            nonce,
            payload: payload.into(),
        }
    }

    /// Content hash, used for pool dedupe and inside the block hash.
    pub fn hash(&self) -> BlockHash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"chronicle:tx:");
        hasher.update(self.from.as_bytes());
        hasher.update(&self.nonce.to_le_bytes());
        hasher.update(&(self.payload.len() as u64).to_le_bytes());
        hasher.update(&self.payload);
        hasher.finalize().into()
    }
}

/// A single link in the chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Chain height (1 = genesis)
    pub height: u64,
    /// Node that built this block
    pub producer: NodeId,
    /// Creation time (unix ms). For produced blocks this is the
    /// phase boundary the block was built on.
    pub timestamp_ms: u64,
    /// Self-hash over the block content
    pub hash: BlockHash,
    /// Predecessor's self-hash (zero for genesis)
    pub prev_hash: BlockHash,
    /// Ordered transactions
    pub txs: Vec<Transaction>,
    /// Producer public key; its hash is `producer` (empty when signing is stubbed)
    pub producer_key: Vec<u8>,
    /// Producer signature over `hash` (empty when signing is stubbed)
    pub signature: Vec<u8>,
}

impl Block {
    /// Build a block on top of `prev_hash` and compute its hash.
    pub fn new(
        height: u64,
        producer: NodeId,
        timestamp_ms: u64,
        prev_hash: BlockHash,
        txs: Vec<Transaction>,
    ) -> Self {
        let mut block = Self {
            height,
            producer,
            timestamp_ms,
            hash: BlockHash::ZERO,
            prev_hash,
            txs,
            producer_key: Vec::new(),
            signature: Vec::new(),
        };
        block.hash = block.compute_hash();
        block
    }

    /// Create the genesis block (height 1, zero predecessor).
    pub fn genesis(producer: NodeId, timestamp_ms: u64) -> Self {
        Self::new(GENESIS_HEIGHT, producer, timestamp_ms, BlockHash::ZERO, Vec::new())
    }

    /// Build the successor of `self`.
    pub fn child(&self, producer: NodeId, timestamp_ms: u64, txs: Vec<Transaction>) -> Self {
        Self::new(self.height + 1, producer, timestamp_ms, self.hash, txs)
    }

    /// Deterministic content hash. Excludes `hash`, `producer_key` and `signature`.
    pub fn compute_hash(&self) -> BlockHash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"chronicle:block:");
        hasher.update(&self.height.to_le_bytes());
        hasher.update(self.producer.as_bytes());
        hasher.update(&self.timestamp_ms.to_le_bytes());
        hasher.update(self.prev_hash.as_bytes());
        hasher.update(&(self.txs.len() as u64).to_le_bytes());
        for tx in &self.txs {
            hasher.update(tx.hash().as_bytes());
        }
        hasher.finalize().into()
    }

    /// Check that the stored hash matches the content.
    pub fn verify_hash(&self) -> bool {
        self.hash == self.compute_hash()
    }

    /// True if `self` is the direct successor of `prev`.
    pub fn links_to(&self, prev: &Block) -> bool {
        self.height == prev.height + 1 && self.prev_hash == prev.hash
    }

    pub fn is_genesis(&self) -> bool {
        self.height == GENESIS_HEIGHT && self.prev_hash.is_zero()
    }

    pub fn tx_count(&self) -> u64 {
        self.txs.len() as u64
    }
}
