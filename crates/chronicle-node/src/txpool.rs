//! Pending transactions.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chronicle_types::{Block, BlockHash, Transaction};
use tracing::trace;

#[derive(Debug, Default)]
struct Inner {
    next_seq: u64,
    /// Arrival order.
    by_seq: BTreeMap<u64, Transaction>,
    by_hash: HashMap<BlockHash, u64>,
}

/// Deduplicating transaction pool, oldest first.
#[derive(Debug)]
pub struct TxPool {
    inner: Mutex<Inner>,
    capacity: usize,
}

impl TxPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns false for duplicates and when the pool is full.
    pub fn add(&self, tx: Transaction) -> bool {
        let hash = tx.hash();
        let mut inner = self.lock();
        if inner.by_hash.contains_key(&hash) || inner.by_seq.len() >= self.capacity {
            return false;
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.by_seq.insert(seq, tx);
        inner.by_hash.insert(hash, seq);
        true
    }

    /// The oldest `max` transactions, left in the pool.
    ///
    /// They leave once a block containing them is decided.
    pub fn take(&self, max: usize) -> Vec<Transaction> {
        self.lock().by_seq.values().take(max).cloned().collect()
    }

    /// Drop every transaction included in `block`.
    pub fn prune(&self, block: &Block) -> usize {
        let included: HashSet<BlockHash> = block.txs.iter().map(Transaction::hash).collect();
        let mut inner = self.lock();
        let mut removed = 0;
        for hash in &included {
            if let Some(seq) = inner.by_hash.remove(hash) {
                inner.by_seq.remove(&seq);
                removed += 1;
            }
        }
        if removed > 0 {
            trace!(removed, height = block.height, "Pruned decided transactions");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.lock().by_seq.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().by_seq.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chronicle_types::NodeId;

    fn tx(nonce: u64) -> Transaction {
        Transaction::new(NodeId::derive(b"client"), nonce, vec![nonce as u8])
    }

    #[test]
    fn dedupes_and_keeps_order() {
        let pool = TxPool::new(16);
        assert!(pool.add(tx(2)));
        assert!(pool.add(tx(1)));
        assert!(!pool.add(tx(2)));
        assert_eq!(pool.take(10), vec![tx(2), tx(1)]);
        assert_eq!(pool.take(1), vec![tx(2)]);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn capacity_is_enforced() {
        let pool = TxPool::new(1);
        assert!(pool.add(tx(1)));
        assert!(!pool.add(tx(2)));
    }

    #[test]
    fn prune_removes_included() {
        let pool = TxPool::new(16);
        for n in 0..4 {
            pool.add(tx(n));
        }
        let genesis = Block::genesis(NodeId::derive(b"seed"), 0);
        let block = genesis.child(NodeId::derive(b"peer"), 1, vec![tx(1), tx(3), tx(9)]);
        assert_eq!(pool.prune(&block), 2);
        assert_eq!(pool.take(10), vec![tx(0), tx(2)]);
    }
}
