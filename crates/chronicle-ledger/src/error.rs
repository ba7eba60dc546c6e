//! Error types for chronicle-ledger.

use chronicle_types::{Block, BlockHash};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, LedgerError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// A block's previous-hash does not match its predecessor.
    #[error("hash link mismatch at height {height}: expected prev {expected}, found {found}")]
    HashLinkMismatch {
        height: u64,
        expected: BlockHash,
        found: BlockHash,
    },

    /// Part of a requested range is not held yet.
    #[error("range has {} missing heights ({} blocks available)", missing.len(), available.len())]
    Gap {
        available: Vec<Block>,
        missing: Vec<u64>,
    },

    #[error("block at height {height} does not match its hash")]
    InvalidBlock { height: u64 },

    #[error("no block at index {0}")]
    NotFound(i64),
}

impl LedgerError {
    /// Asking again later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Gap { .. } | Self::NotFound(_))
    }

    /// The peer that supplied the data broke the chain rules.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Self::HashLinkMismatch { .. } | Self::InvalidBlock { .. })
    }
}
