//! Proofs: the compact claim broadcast during competition.

use serde::{Deserialize, Serialize};

use crate::{Block, BlockHash, NodeId};

/// The ledger tip a round's competition builds on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct RoundAnchor {
    pub height: u64,
    pub hash: BlockHash,
}

impl RoundAnchor {
    pub const fn new(height: u64, hash: BlockHash) -> Self {
        Self { height, hash }
    }

    /// Anchor on an existing block.
    pub fn of(block: &Block) -> Self {
        Self::new(block.height, block.hash)
    }

    /// Height of the block being competed for.
    pub const fn next_height(&self) -> u64 {
        self.height + 1
    }
}

impl std::fmt::Display for RoundAnchor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.height, self.hash)
    }
}

/// A producer's claim to the next block.
///
/// Carries just enough to rank candidates; the block body follows only
/// from the round's winner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Proof {
    pub producer: NodeId,
    pub tx_count: u64,
    pub block_hash: BlockHash,
    pub anchor: RoundAnchor,
}

impl Proof {
    /// Form the proof for a candidate built on `anchor`.
    pub fn for_block(block: &Block, anchor: RoundAnchor) -> Self {
        Self {
            producer: block.producer,
            tx_count: block.tx_count(),
            block_hash: block.hash,
            anchor,
        }
    }

    /// True if `block` is the body this proof claims.
    pub fn matches(&self, block: &Block) -> bool {
        block.hash == self.block_hash
            && block.producer == self.producer
            && block.tx_count() == self.tx_count
            && block.height == self.anchor.next_height()
            && block.prev_hash == self.anchor.hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Transaction;

    #[test]
    fn proof_matches_its_block() {
        let producer = NodeId::derive(b"p");
        let genesis = Block::genesis(NodeId::derive(b"s"), 0);
        let anchor = RoundAnchor::of(&genesis);
        let block = genesis.child(producer, 1_000, vec![Transaction::new(producer, 1, vec![9u8])]);
        let proof = Proof::for_block(&block, anchor);

        assert_eq!(proof.tx_count, 1);
        assert!(proof.matches(&block));
    }

    #[test]
    fn proof_rejects_block_on_other_anchor() {
        let producer = NodeId::derive(b"p");
        let genesis = Block::genesis(NodeId::derive(b"s"), 0);
        let other = Block::genesis(NodeId::derive(b"other"), 0);
        let block = genesis.child(producer, 1_000, vec![]);
        let proof = Proof::for_block(&block, RoundAnchor::of(&other));
        assert!(!proof.matches(&block));
    }
}
