//! Chronicle core types
//!
//! Every other crate in the workspace speaks in terms of these values:
//!
//! - [`NodeId`]: 256-bit node identity (BLAKE3 of the node's public key)
//! - [`BlockHash`]: 256-bit content hash, ordered lexicographically
//! - [`Block`] / [`Transaction`]: the append-only chain
//! - [`Proof`] / [`RoundAnchor`]: the compact claim a producer broadcasts
//!   during the competition phase instead of its full candidate block
//! - [`Duty`]: whether a node is a seed (authority) or a peer (producer)
//!
//! # Heights
//!
//! Heights start at 1. The genesis block has height 1 and a zero
//! previous-hash; an empty ledger is said to have tip height 0.

mod block;
mod hash;
mod id;
mod proof;

pub use block::{Block, Transaction};
pub use hash::BlockHash;
pub use id::{Duty, NodeId};
pub use proof::{Proof, RoundAnchor};

use std::time::{SystemTime, UNIX_EPOCH};

/// Height of the genesis block.
pub const GENESIS_HEIGHT: u64 = 1;

/// Wall-clock time in unix milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
