//! Candidate block bodies awaiting a decision.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chronicle_types::{Block, BlockHash};
use tracing::trace;

#[derive(Debug, Default)]
struct Inner {
    /// Height accepted; `None` accepts any height.
    scope: Option<u64>,
    entries: HashMap<BlockHash, (Block, u32)>,
}

/// Majority vote over candidate blocks for one height.
#[derive(Debug, Default)]
pub struct UndecidedBlockTable {
    inner: RwLock<Inner>,
}

impl UndecidedBlockTable {
    pub fn new(scope: Option<u64>) -> Self {
        Self {
            inner: RwLock::new(Inner {
                scope,
                entries: HashMap::new(),
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Vote for `block`. Returns false if it is out of scope or its hash
    /// does not match its content.
    pub fn add(&self, block: Block) -> bool {
        let mut inner = self.write();
        if inner.scope.is_some_and(|h| h != block.height) {
            trace!(height = block.height, scope = ?inner.scope, "Undecided block out of scope");
            return false;
        }
        if !block.verify_hash() {
            return false;
        }
        inner
            .entries
            .entry(block.hash)
            .and_modify(|(_, votes)| *votes += 1)
            .or_insert((block, 1));
        true
    }

    pub fn get(&self, hash: &BlockHash) -> Option<Block> {
        self.read().entries.get(hash).map(|(b, _)| b.clone())
    }

    pub fn votes(&self, hash: &BlockHash) -> u32 {
        self.read().entries.get(hash).map_or(0, |(_, v)| *v)
    }

    /// The most-voted block; equal votes go to the larger hash.
    pub fn major(&self) -> Option<Block> {
        self.read()
            .entries
            .iter()
            .max_by(|(ha, (_, va)), (hb, (_, vb))| va.cmp(vb).then_with(|| ha.cmp(hb)))
            .map(|(_, (b, _))| b.clone())
    }

    /// Drop all entries and rescope.
    pub fn reset(&self, scope: Option<u64>) {
        let mut inner = self.write();
        inner.scope = scope;
        inner.entries.clear();
    }

    pub fn scope(&self) -> Option<u64> {
        self.read().scope
    }

    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().entries.is_empty()
    }
}
