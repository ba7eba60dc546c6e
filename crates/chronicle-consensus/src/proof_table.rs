//! Per-round proof collection, judging and seed-relay reconciliation.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chronicle_clock::PotEvent;
use chronicle_types::{Block, NodeId, Proof, RoundAnchor};
use tracing::{debug, trace};

use crate::error::{expect_phase, Result};
use crate::tie_break::compare;

#[derive(Debug, Default)]
struct Inner {
    anchor: RoundAnchor,
    /// Best proof seen per producer for the current anchor.
    proofs: HashMap<NodeId, Proof>,
    best: Option<Proof>,
    /// Captured at the first PotOver of the round.
    judged: Option<Option<Proof>>,
    /// Producer -> distinct seeds that relayed it.
    relays: HashMap<NodeId, HashSet<NodeId>>,
    /// Captured at the first PotStart after the round.
    decided: Option<Option<Proof>>,
}

impl Inner {
    fn store(&mut self, proof: Proof) -> bool {
        if proof.anchor != self.anchor {
            trace!(anchor = %proof.anchor, expected = %self.anchor, "Proof on stale anchor ignored");
            return false;
        }
        let slot = self.proofs.entry(proof.producer).or_insert(proof);
        if compare(&proof, slot) == Ordering::Greater {
            *slot = proof;
        }
        let improves = self
            .best
            .as_ref()
            .map_or(true, |best| compare(&proof, best) == Ordering::Greater);
        if improves {
            self.best = Some(proof);
        }
        true
    }

    fn most_relayed(&self) -> Option<Proof> {
        self.relays
            .iter()
            .filter_map(|(id, seeds)| self.proofs.get(id).map(|p| (seeds.len(), p)))
            .max_by(|(va, a), (vb, b)| va.cmp(vb).then_with(|| compare(a, b)))
            .map(|(_, p)| *p)
    }
}

/// Proof table for the round following the current anchor.
///
/// Every method takes the lock for its own body only.
#[derive(Debug, Default)]
pub struct ProofTable {
    inner: RwLock<Inner>,
}

impl ProofTable {
    pub fn new(anchor: RoundAnchor) -> Self {
        Self {
            inner: RwLock::new(Inner {
                anchor,
                ..Inner::default()
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a proof. Returns false if it targets another anchor.
    pub fn add(&self, proof: Proof) -> bool {
        self.write().store(proof)
    }

    /// Record a proof relayed by `seed` and count the seed's vote for its producer.
    ///
    /// Repeated relays from the same seed count once.
    pub fn add_relayed(&self, proof: Proof, seed: NodeId) -> bool {
        let mut inner = self.write();
        if !inner.store(proof) {
            return false;
        }
        let fresh = inner.relays.entry(proof.producer).or_default().insert(seed);
        if fresh {
            trace!(producer = %proof.producer, %seed, "Relay vote counted");
        }
        true
    }

    /// Capture the locally best proof. Only valid at `PotOver`; later
    /// calls in the same round return the first judgement.
    pub fn judge(&self, event: PotEvent) -> Result<Option<Proof>> {
        expect_phase("judge", PotEvent::PotOver, event)?;
        let mut inner = self.write();
        if let Some(judged) = inner.judged {
            return Ok(judged);
        }
        let judged = inner.best;
        inner.judged = Some(judged);
        debug!(
            anchor = %inner.anchor,
            winner = ?judged.map(|p| p.producer.to_string()),
            candidates = inner.proofs.len(),
            "Round judged"
        );
        Ok(judged)
    }

    /// Reconcile the round's winner. Only valid at `PotStart`.
    ///
    /// The proof relayed by the most distinct seeds wins; equal vote counts
    /// fall back to proof ranking. Without relays, the local judgement stands.
    pub fn decide(&self, event: PotEvent) -> Result<Option<Proof>> {
        expect_phase("decide", PotEvent::PotStart, event)?;
        let mut inner = self.write();
        if let Some(decided) = inner.decided {
            return Ok(decided);
        }
        let decided = match inner.most_relayed() {
            Some(relayed) => Some(relayed),
            None => inner.judged.unwrap_or(inner.best),
        };
        inner.decided = Some(decided);
        debug!(
            anchor = %inner.anchor,
            winner = ?decided.map(|p| p.producer.to_string()),
            relayed = !inner.relays.is_empty(),
            "Round decided"
        );
        Ok(decided)
    }

    /// Start a new round on `latest`. Only valid at `PotStart`.
    pub fn reset(&self, event: PotEvent, latest: &Block) -> Result<()> {
        expect_phase("reset", PotEvent::PotStart, event)?;
        self.rebase(RoundAnchor::of(latest));
        Ok(())
    }

    /// Clear the table and move to `anchor` regardless of phase.
    ///
    /// Used when a node enters the round cycle mid-way (startup).
    pub fn rebase(&self, anchor: RoundAnchor) {
        let mut inner = self.write();
        *inner = Inner {
            anchor,
            ..Inner::default()
        };
    }

    pub fn anchor(&self) -> RoundAnchor {
        self.read().anchor
    }

    pub fn best(&self) -> Option<Proof> {
        self.read().best
    }

    pub fn judged(&self) -> Option<Proof> {
        self.read().judged.flatten()
    }

    pub fn get(&self, producer: &NodeId) -> Option<Proof> {
        self.read().proofs.get(producer).copied()
    }

    /// Number of distinct seeds that relayed `producer`'s proof.
    pub fn votes(&self, producer: &NodeId) -> usize {
        self.read().relays.get(producer).map_or(0, HashSet::len)
    }

    pub fn len(&self) -> usize {
        self.read().proofs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().proofs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chronicle_types::BlockHash;
    use proptest::prelude::*;

    fn genesis() -> Block {
        Block::genesis(NodeId::derive(b"seed-0"), 1_000)
    }

    fn proof_on(anchor: RoundAnchor, id: u8, tx_count: u64, hash: u8) -> Proof {
        Proof {
            producer: NodeId::derive(&[id]),
            tx_count,
            block_hash: BlockHash([hash; 32]),
            anchor,
        }
    }

    #[test]
    fn add_ignores_other_anchor() {
        let table = ProofTable::new(RoundAnchor::of(&genesis()));
        let stale = proof_on(RoundAnchor::new(9, BlockHash([9; 32])), 1, 1, 1);
        assert!(!table.add(stale));
        assert!(table.is_empty());
    }

    #[test]
    fn judge_picks_best_and_only_at_pot_over() {
        let anchor = RoundAnchor::of(&genesis());
        let table = ProofTable::new(anchor);
        table.add(proof_on(anchor, 1, 2, 1));
        table.add(proof_on(anchor, 2, 5, 1));
        table.add(proof_on(anchor, 3, 3, 1));

        assert!(table.judge(PotEvent::PotStart).is_err());
        let judged = table.judge(PotEvent::PotOver).unwrap().unwrap();
        assert_eq!(judged.producer, NodeId::derive(&[2]));

        // Late proofs do not change the judgement.
        table.add(proof_on(anchor, 4, 9, 1));
        assert_eq!(table.judge(PotEvent::PotOver).unwrap(), Some(judged));
    }

    #[test]
    fn decide_prefers_relay_votes_over_local_judgement() {
        let anchor = RoundAnchor::of(&genesis());
        let table = ProofTable::new(anchor);
        let strong = proof_on(anchor, 1, 10, 1);
        let relayed = proof_on(anchor, 2, 1, 1);
        table.add(strong);
        table.judge(PotEvent::PotOver).unwrap();
        table.add_relayed(relayed, NodeId::derive(b"seed-a"));

        assert!(table.decide(PotEvent::PotOver).is_err());
        assert_eq!(table.decide(PotEvent::PotStart).unwrap(), Some(relayed));
    }

    #[test]
    fn duplicate_relays_count_once() {
        let anchor = RoundAnchor::of(&genesis());
        let table = ProofTable::new(anchor);
        let a = proof_on(anchor, 1, 1, 1);
        let b = proof_on(anchor, 2, 1, 2);
        let seed_a = NodeId::derive(b"seed-a");
        let seed_b = NodeId::derive(b"seed-b");
        let seed_c = NodeId::derive(b"seed-c");

        for _ in 0..5 {
            table.add_relayed(a, seed_a);
        }
        table.add_relayed(b, seed_b);
        table.add_relayed(b, seed_c);

        assert_eq!(table.votes(&a.producer), 1);
        assert_eq!(table.votes(&b.producer), 2);
        assert_eq!(table.decide(PotEvent::PotStart).unwrap(), Some(b));
    }

    #[test]
    fn decide_without_anything_is_none() {
        let table = ProofTable::new(RoundAnchor::of(&genesis()));
        table.judge(PotEvent::PotOver).unwrap();
        assert_eq!(table.decide(PotEvent::PotStart).unwrap(), None);
    }

    #[test]
    fn reset_clears_and_moves_anchor() {
        let g = genesis();
        let anchor = RoundAnchor::of(&g);
        let table = ProofTable::new(anchor);
        let p = proof_on(anchor, 1, 1, 1);
        table.add_relayed(p, NodeId::derive(b"seed-a"));
        table.judge(PotEvent::PotOver).unwrap();

        let next = g.child(NodeId::derive(&[1]), 2_000, vec![]);
        assert!(table.reset(PotEvent::PotOver, &next).is_err());
        table.reset(PotEvent::PotStart, &next).unwrap();

        assert_eq!(table.anchor(), RoundAnchor::of(&next));
        assert!(table.is_empty());
        assert_eq!(table.votes(&p.producer), 0);
        assert_eq!(table.judged(), None);
        assert!(!table.add(p), "old-anchor proof is stale now");
    }

    #[test]
    fn full_ties_are_judged_alike_everywhere() {
        let anchor = RoundAnchor::of(&genesis());
        let a = proof_on(anchor, 1, 3, 0x42);
        let b = proof_on(anchor, 2, 3, 0x42);

        let first = ProofTable::new(anchor);
        first.add(a);
        first.add(b);
        let second = ProofTable::new(anchor);
        second.add(b);
        second.add(a);

        let winner = first.judge(PotEvent::PotOver).unwrap();
        assert!(winner.is_some());
        assert_eq!(second.judge(PotEvent::PotOver).unwrap(), winner);
        assert_eq!(first.decide(PotEvent::PotStart).unwrap(), winner);
        assert_eq!(second.decide(PotEvent::PotStart).unwrap(), winner);
    }

    #[derive(Debug, Clone)]
    enum Call {
        Add(Proof),
        Relay(Proof, NodeId),
    }

    fn arb_calls() -> impl Strategy<Value = Vec<Call>> {
        let anchor = RoundAnchor::new(1, BlockHash([1; 32]));
        prop::collection::vec(
            (0u8..6, 0u64..3, 0u8..3, prop::option::of(0u8..3)).prop_map(move |(id, tx, h, seed)| {
                let proof = proof_on(anchor, id, tx, h);
                match seed {
                    Some(s) => Call::Relay(proof, NodeId::derive(&[b's', s])),
                    None => Call::Add(proof),
                }
            }),
            0..24,
        )
    }

    fn run(calls: &[Call]) -> Option<Proof> {
        let table = ProofTable::new(RoundAnchor::new(1, BlockHash([1; 32])));
        for call in calls {
            match call {
                Call::Add(p) => {
                    table.add(*p);
                }
                Call::Relay(p, seed) => {
                    table.add_relayed(*p, *seed);
                }
            }
        }
        table.judge(PotEvent::PotOver).unwrap();
        table.decide(PotEvent::PotStart).unwrap()
    }

    proptest! {
        #[test]
        fn decide_is_order_independent(
            (calls, shuffled) in arb_calls().prop_flat_map(|calls| {
                let shuffled = Just(calls.clone()).prop_shuffle();
                (Just(calls), shuffled)
            })
        ) {
            prop_assert_eq!(run(&calls), run(&shuffled));
        }
    }
}
