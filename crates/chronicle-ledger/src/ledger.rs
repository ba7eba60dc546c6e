//! Segment bookkeeping and reconciliation.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chronicle_types::{Block, BlockHash};
use tracing::{debug, trace, warn};

use crate::{LedgerError, Result};

/// Height range covered by one segment (inclusive).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentSpan {
    pub start: u64,
    pub end: u64,
}

#[derive(Debug)]
struct Segment {
    start: u64,
    blocks: VecDeque<Block>,
}

impl Segment {
    fn new(block: Block) -> Self {
        Self {
            start: block.height,
            blocks: VecDeque::from([block]),
        }
    }

    fn end(&self) -> u64 {
        self.start + self.blocks.len() as u64 - 1
    }

    fn first_prev(&self) -> BlockHash {
        self.blocks.front().map_or(BlockHash::ZERO, |b| b.prev_hash)
    }

    fn last_hash(&self) -> BlockHash {
        self.blocks.back().map_or(BlockHash::ZERO, |b| b.hash)
    }

    fn get(&self, height: u64) -> Option<&Block> {
        if height < self.start {
            return None;
        }
        self.blocks.get((height - self.start) as usize)
    }

    fn span(&self) -> SegmentSpan {
        SegmentSpan {
            start: self.start,
            end: self.end(),
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    /// Ordered by start, never overlapping.
    segments: Vec<Segment>,
    /// Hash -> height for every block held in a segment.
    index: HashMap<BlockHash, u64>,
    max_index: u64,
    holes: BTreeMap<u64, Block>,
}

impl Inner {
    /// Height and hash of the active tip; (0, ZERO) when empty.
    fn tip(&self) -> (u64, BlockHash) {
        self.segments
            .last()
            .map_or((0, BlockHash::ZERO), |s| (s.end(), s.last_hash()))
    }

    fn block_at(&self, height: u64) -> Option<&Block> {
        self.segments.iter().find_map(|s| s.get(height))
    }

    /// Put `block` at the end of the last segment, or open a new trailing one.
    fn append(&mut self, block: Block) {
        let height = block.height;
        self.index.insert(block.hash, height);
        self.holes.remove(&height);
        match self.segments.last_mut() {
            Some(last) if last.end() + 1 == height => last.blocks.push_back(block),
            _ => self.segments.push(Segment::new(block)),
        }
        self.max_index = self.max_index.max(height);
    }

    fn links_to_successor(&self, block: &Block) -> bool {
        let next = block.height + 1;
        self.block_at(next)
            .or_else(|| self.holes.get(&next))
            .is_some_and(|succ| succ.prev_hash == block.hash)
    }

    /// Pull holes onto segment ends and merge adjacent segments.
    ///
    /// Returns the first boundary mismatch found; the offending later
    /// segment is gone by then.
    fn reconcile(&mut self) -> Result<()> {
        let mut violation = None;
        loop {
            let mut changed = false;

            for i in 0..self.segments.len() {
                changed |= self.extend_forward(i);
                changed |= self.extend_backward(i);
            }

            let mut i = 0;
            while i + 1 < self.segments.len() {
                if self.segments[i].end() + 1 != self.segments[i + 1].start {
                    i += 1;
                    continue;
                }
                let expected = self.segments[i].last_hash();
                let found = self.segments[i + 1].first_prev();
                let later = self.segments.remove(i + 1);
                changed = true;
                if expected == found {
                    trace!(at = later.start, "Segments merged");
                    self.segments[i].blocks.extend(later.blocks);
                } else {
                    warn!(
                        height = later.start,
                        discarded = later.blocks.len(),
                        %expected,
                        %found,
                        "Segment link mismatch, discarding later segment"
                    );
                    for block in &later.blocks {
                        self.index.remove(&block.hash);
                    }
                    violation.get_or_insert(LedgerError::HashLinkMismatch {
                        height: later.start,
                        expected,
                        found,
                    });
                }
            }

            if !changed {
                break;
            }
        }

        let stale: Vec<u64> = self
            .holes
            .keys()
            .copied()
            .filter(|h| self.block_at(*h).is_some())
            .collect();
        for height in stale {
            self.holes.remove(&height);
        }

        if let Some(last) = self.segments.last() {
            self.max_index = self.max_index.max(last.end());
        }
        violation.map_or(Ok(()), Err)
    }

    fn extend_forward(&mut self, i: usize) -> bool {
        let limit = self.segments.get(i + 1).map(|s| s.start);
        let mut changed = false;
        loop {
            let segment = &self.segments[i];
            let next = segment.end() + 1;
            if limit.is_some_and(|l| next >= l) {
                break;
            }
            let last_hash = segment.last_hash();
            if !self.holes.get(&next).is_some_and(|b| b.prev_hash == last_hash) {
                break;
            }
            let Some(block) = self.holes.remove(&next) else {
                break;
            };
            self.index.insert(block.hash, next);
            self.segments[i].blocks.push_back(block);
            changed = true;
        }
        changed
    }

    fn extend_backward(&mut self, i: usize) -> bool {
        let floor = if i == 0 { 0 } else { self.segments[i - 1].end() };
        let mut changed = false;
        loop {
            let segment = &self.segments[i];
            if segment.start <= 1 || segment.start - 1 <= floor {
                break;
            }
            let prev = segment.start - 1;
            let want = segment.first_prev();
            if !self.holes.get(&prev).is_some_and(|b| b.hash == want) {
                break;
            }
            let Some(block) = self.holes.remove(&prev) else {
                break;
            };
            self.index.insert(block.hash, prev);
            let segment = &mut self.segments[i];
            segment.blocks.push_front(block);
            segment.start = prev;
            changed = true;
        }
        changed
    }

    /// Resolve a possibly negative index against the tip.
    fn resolve(&self, index: i64) -> u64 {
        let (tip, _) = self.tip();
        if index < 0 {
            let back = index.unsigned_abs();
            (tip + 1).saturating_sub(back).max(1)
        } else {
            (index as u64).max(1)
        }
    }
}

/// Gap-tolerant, hash-linked block store.
#[derive(Debug, Default)]
pub struct SegmentedLedger {
    inner: RwLock<Inner>,
}

impl SegmentedLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a freshly decided block.
    ///
    /// Extends the active segment when `block` follows the tip, opens a new
    /// trailing segment when it skips ahead. Returns `Ok(false)` for a block
    /// not newer than `max_index`.
    pub fn add_new_block(&self, block: Block) -> Result<bool> {
        if !block.verify_hash() {
            return Err(LedgerError::InvalidBlock {
                height: block.height,
            });
        }
        let mut inner = self.write();
        if block.height <= inner.max_index {
            trace!(height = block.height, max_index = inner.max_index, "Block not newer than max index");
            return Ok(false);
        }
        let (tip, tip_hash) = inner.tip();
        if block.height == tip + 1 && block.prev_hash != tip_hash {
            return Err(LedgerError::HashLinkMismatch {
                height: block.height,
                expected: tip_hash,
                found: block.prev_hash,
            });
        }
        if block.height > tip + 1 {
            debug!(height = block.height, tip, "Opening trailing segment");
        }
        inner.append(block);
        inner.reconcile()?;
        Ok(true)
    }

    /// Insert a block from any source (range replies, catch-up).
    ///
    /// Blocks that follow the active tip are appended directly; everything
    /// else waits in holes until reconciliation places it. Returns
    /// `Ok(false)` for duplicates and for blocks conflicting with stored ones.
    pub fn add_block(&self, block: Block) -> Result<bool> {
        if !block.verify_hash() {
            return Err(LedgerError::InvalidBlock {
                height: block.height,
            });
        }
        let mut inner = self.write();
        if let Some(existing) = inner.block_at(block.height) {
            if existing.hash != block.hash {
                debug!(height = block.height, "Conflicting block for stored height ignored");
            }
            return Ok(false);
        }

        let (tip, tip_hash) = inner.tip();
        if block.height == tip + 1 && block.prev_hash == tip_hash {
            inner.append(block);
        } else {
            match inner.holes.get(&block.height) {
                Some(existing) if existing.hash == block.hash => return Ok(false),
                Some(_) if !inner.links_to_successor(&block) => return Ok(false),
                _ => {}
            }
            trace!(height = block.height, tip, "Block parked in holes");
            inner.holes.insert(block.height, block);
        }
        inner.reconcile()?;
        Ok(true)
    }

    /// Blocks `start..start+count` relative to the tip.
    ///
    /// `start < 0` counts back from the tip (`-1` is the tip itself),
    /// `start == 0` means the first height, `count == 0` runs to the tip.
    pub fn get_blocks_by_range(&self, start: i64, count: u64) -> Result<Vec<Block>> {
        let inner = self.read();
        let (tip, _) = inner.tip();
        let from = inner.resolve(start);
        let to = if count == 0 {
            tip
        } else {
            from.saturating_add(count - 1).min(tip)
        };

        let mut available = Vec::new();
        let mut missing = Vec::new();
        for height in from..=to {
            match inner.block_at(height) {
                Some(block) => available.push(block.clone()),
                None => missing.push(height),
            }
        }
        if missing.is_empty() {
            Ok(available)
        } else {
            Err(LedgerError::Gap { available, missing })
        }
    }

    /// Blocks for the hashes held; unknown hashes are skipped.
    pub fn get_blocks_by_hashes(&self, hashes: &[BlockHash]) -> Vec<Block> {
        let inner = self.read();
        hashes
            .iter()
            .filter_map(|h| inner.index.get(h))
            .filter_map(|height| inner.block_at(*height).cloned())
            .collect()
    }

    /// Block at `index`, negative counting back from the tip.
    pub fn get_block_by_index(&self, index: i64) -> Result<Block> {
        let inner = self.read();
        let height = inner.resolve(index);
        inner
            .block_at(height)
            .cloned()
            .ok_or(LedgerError::NotFound(index))
    }

    pub fn get_block_by_hash(&self, hash: &BlockHash) -> Option<Block> {
        let inner = self.read();
        let height = inner.index.get(hash)?;
        inner.block_at(*height).cloned()
    }

    pub fn contains(&self, hash: &BlockHash) -> bool {
        self.read().index.contains_key(hash)
    }

    /// Last block of the active segment.
    pub fn tip(&self) -> Option<Block> {
        let inner = self.read();
        inner.segments.last().and_then(|s| s.blocks.back().cloned())
    }

    pub fn tip_height(&self) -> u64 {
        self.read().tip().0
    }

    pub fn max_index(&self) -> u64 {
        self.read().max_index
    }

    /// Holes remain and the chain is split into more than one segment.
    pub fn discontinuous(&self) -> bool {
        let inner = self.read();
        !inner.holes.is_empty() && inner.segments.len() > 1
    }

    /// Height gaps not covered by segments or holes, as `(start, count)`.
    ///
    /// Includes the run below the first segment when it does not start at 1.
    pub fn missing_ranges(&self) -> Vec<(u64, u64)> {
        let inner = self.read();
        let mut ranges = Vec::new();
        let mut expected = 1;
        for segment in &inner.segments {
            let mut run: Option<(u64, u64)> = None;
            for height in expected..segment.start {
                if inner.holes.contains_key(&height) {
                    if let Some(r) = run.take() {
                        ranges.push(r);
                    }
                } else {
                    match run.as_mut() {
                        Some((_, count)) => *count += 1,
                        None => run = Some((height, 1)),
                    }
                }
            }
            if let Some(r) = run {
                ranges.push(r);
            }
            expected = segment.end() + 1;
        }
        ranges
    }

    pub fn segments(&self) -> Vec<SegmentSpan> {
        self.read().segments.iter().map(Segment::span).collect()
    }

    pub fn hole_count(&self) -> usize {
        self.read().holes.len()
    }

    /// Number of blocks held in segments.
    pub fn len(&self) -> usize {
        self.read().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().segments.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chronicle_types::{NodeId, Transaction};
    use proptest::prelude::*;

    fn chain(n: u64) -> Vec<Block> {
        let producer = NodeId::derive(b"peer");
        let mut blocks = vec![Block::genesis(NodeId::derive(b"seed"), 1_000)];
        for h in 2..=n {
            let tx = Transaction::new(producer, h, vec![h as u8]);
            let next = blocks[blocks.len() - 1].child(producer, 1_000 + h * 2_000, vec![tx]);
            blocks.push(next);
        }
        blocks
    }

    fn ledger_with(blocks: &[Block]) -> SegmentedLedger {
        let ledger = SegmentedLedger::new();
        for b in blocks {
            ledger.add_new_block(b.clone()).unwrap();
        }
        ledger
    }

    fn span(start: u64, end: u64) -> SegmentSpan {
        SegmentSpan { start, end }
    }

    #[test]
    fn add_new_block_extends_and_skips() {
        let blocks = chain(6);
        let ledger = ledger_with(&blocks[..3]);
        assert_eq!(ledger.segments(), vec![span(1, 3)]);

        assert!(ledger.add_new_block(blocks[4].clone()).unwrap());
        assert_eq!(ledger.segments(), vec![span(1, 3), span(5, 5)]);
        assert_eq!(ledger.max_index(), 5);

        // Not newer than max index.
        assert!(!ledger.add_new_block(blocks[3].clone()).unwrap());
    }

    #[test]
    fn add_new_block_rejects_broken_link() {
        let blocks = chain(3);
        let ledger = ledger_with(&blocks[..2]);
        let fork = Block::genesis(NodeId::derive(b"other"), 5).child(NodeId::derive(b"p"), 9, vec![]);
        let forged = fork.child(NodeId::derive(b"p"), 10, vec![]);
        let err = ledger.add_new_block(forged).unwrap_err();
        assert!(err.is_protocol_violation());
        assert_eq!(ledger.tip_height(), 2);
    }

    #[test]
    fn invalid_hash_is_rejected() {
        let mut block = chain(1).remove(0);
        block.timestamp_ms += 1;
        let ledger = SegmentedLedger::new();
        assert_eq!(
            ledger.add_block(block),
            Err(LedgerError::InvalidBlock { height: 1 })
        );
    }

    #[test]
    fn holes_fill_gap_and_merge() {
        let blocks = chain(7);
        let ledger = ledger_with(&blocks[..2]);
        ledger.add_new_block(blocks[5].clone()).unwrap();
        ledger.add_new_block(blocks[6].clone()).unwrap();
        assert_eq!(ledger.missing_ranges(), vec![(3, 3)]);

        ledger.add_block(blocks[3].clone()).unwrap();
        assert!(ledger.discontinuous());
        assert_eq!(ledger.missing_ranges(), vec![(3, 1), (5, 1)]);

        ledger.add_block(blocks[4].clone()).unwrap();
        assert_eq!(ledger.segments(), vec![span(1, 2), span(4, 7)]);

        ledger.add_block(blocks[2].clone()).unwrap();
        assert_eq!(ledger.segments(), vec![span(1, 7)]);
        assert!(!ledger.discontinuous());
        assert_eq!(ledger.hole_count(), 0);
        assert!(ledger.missing_ranges().is_empty());
    }

    #[test]
    fn equivocation_discards_later_segment() {
        let blocks = chain(7);
        let ledger = ledger_with(&blocks[..3]);
        for b in &blocks[4..] {
            ledger.add_new_block(b.clone()).unwrap();
        }
        assert_eq!(ledger.max_index(), 7);

        // Links to height 3 but not to the real height 5.
        let forged = blocks[2].child(NodeId::derive(b"mallory"), 123, vec![]);
        let err = ledger.add_block(forged.clone()).unwrap_err();

        assert!(err.is_protocol_violation());
        assert!(matches!(err, LedgerError::HashLinkMismatch { height: 5, .. }));
        assert_eq!(ledger.max_index(), 7);
        assert_eq!(ledger.segments(), vec![span(1, 4)]);
        assert_eq!(ledger.tip_height(), 4);
        assert!(!ledger.contains(&blocks[5].hash));
        assert_eq!(ledger.tip().map(|b| b.hash), Some(forged.hash));
    }

    #[test]
    fn range_queries_relative_to_tip() {
        let blocks = chain(5);
        let ledger = ledger_with(&blocks);

        let all = ledger.get_blocks_by_range(0, 0).unwrap();
        assert_eq!(all.len(), 5);

        let last_two = ledger.get_blocks_by_range(-2, 0).unwrap();
        assert_eq!(last_two.iter().map(|b| b.height).collect::<Vec<_>>(), vec![4, 5]);

        let middle = ledger.get_blocks_by_range(2, 2).unwrap();
        assert_eq!(middle.iter().map(|b| b.height).collect::<Vec<_>>(), vec![2, 3]);

        // Past the tip is clamped.
        assert_eq!(ledger.get_blocks_by_range(4, 10).unwrap().len(), 2);
        assert!(ledger.get_blocks_by_range(9, 1).unwrap().is_empty());

        assert_eq!(ledger.get_block_by_index(-1).unwrap().height, 5);
        assert_eq!(ledger.get_block_by_index(1).unwrap(), blocks[0]);
    }

    #[test]
    fn range_across_gap_is_retryable() {
        let blocks = chain(6);
        let ledger = ledger_with(&blocks[..2]);
        ledger.add_new_block(blocks[4].clone()).unwrap();
        ledger.add_new_block(blocks[5].clone()).unwrap();

        let err = ledger.get_blocks_by_range(1, 0).unwrap_err();
        assert!(err.is_retryable());
        match err {
            LedgerError::Gap { available, missing } => {
                assert_eq!(available.len(), 4);
                assert_eq!(missing, vec![3, 4]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn lookup_by_hash() {
        let blocks = chain(4);
        let ledger = ledger_with(&blocks);
        let found = ledger.get_blocks_by_hashes(&[blocks[1].hash, BlockHash([9; 32]), blocks[3].hash]);
        assert_eq!(found, vec![blocks[1].clone(), blocks[3].clone()]);
        assert_eq!(ledger.get_block_by_hash(&blocks[2].hash), Some(blocks[2].clone()));
        assert!(ledger.get_block_by_index(9).is_err());
    }

    #[test]
    fn duplicates_are_ignored() {
        let blocks = chain(3);
        let ledger = ledger_with(&blocks);
        assert!(!ledger.add_block(blocks[1].clone()).unwrap());
        assert_eq!(ledger.len(), 3);
    }

    #[test]
    fn empty_ledger_has_zero_tip() {
        let ledger = SegmentedLedger::new();
        assert_eq!(ledger.tip_height(), 0);
        assert!(ledger.tip().is_none());
        assert!(ledger.is_empty());
        assert!(ledger.get_blocks_by_range(0, 0).unwrap().is_empty());
    }

    proptest! {
        #[test]
        fn any_permutation_yields_one_segment(
            order in (1usize..24).prop_flat_map(|n| Just((0..n).collect::<Vec<_>>()).prop_shuffle())
        ) {
            let n = order.len() as u64;
            let blocks = chain(n);
            let ledger = SegmentedLedger::new();
            for i in &order {
                ledger.add_block(blocks[*i].clone()).unwrap();
            }

            prop_assert_eq!(ledger.segments(), vec![span(1, n)]);
            prop_assert!(!ledger.discontinuous());
            prop_assert_eq!(ledger.hole_count(), 0);
            let heights: Vec<u64> = ledger
                .get_blocks_by_range(0, 0)
                .unwrap()
                .iter()
                .map(|b| b.height)
                .collect();
            prop_assert_eq!(heights, (1..=n).collect::<Vec<_>>());
        }
    }
}
