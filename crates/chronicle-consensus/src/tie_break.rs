//! Deterministic proof ranking.
//!
//! NO TIMESTAMPS. NO "FIRST WINS". A pure function of proof content.

use std::cmp::Ordering;

use chronicle_types::{NodeId, Proof};

/// Total order over proofs competing on the same anchor.
///
/// `Ordering::Greater` means `a` beats `b`.
pub fn compare(a: &Proof, b: &Proof) -> Ordering {
    a.tx_count
        .cmp(&b.tx_count)
        .then_with(|| a.block_hash.cmp(&b.block_hash))
        .then_with(|| {
            let height = a.anchor.next_height().max(b.anchor.next_height());
            salted_score(&a.producer, height).cmp(&salted_score(&b.producer, height))
        })
        .then_with(|| a.producer.cmp(&b.producer))
}

/// H(id ‖ height), little-endian height.
pub fn salted_score(id: &NodeId, height: u64) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(id.as_bytes());
    hasher.update(&height.to_le_bytes());
    *hasher.finalize().as_bytes()
}

/// The winning proof among `proofs`, if any.
pub fn best_of<'a>(proofs: impl IntoIterator<Item = &'a Proof>) -> Option<&'a Proof> {
    proofs.into_iter().max_by(|a, b| compare(a, b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chronicle_types::{BlockHash, RoundAnchor};
    use proptest::prelude::*;

    fn proof(id: u8, tx_count: u64, hash: u8, height: u64) -> Proof {
        Proof {
            producer: NodeId::derive(&[id]),
            tx_count,
            block_hash: BlockHash([hash; 32]),
            anchor: RoundAnchor::new(height, BlockHash::ZERO),
        }
    }

    #[test]
    fn tx_count_dominates() {
        let a = proof(1, 5, 0x00, 1);
        let b = proof(2, 4, 0xff, 1);
        assert_eq!(compare(&a, &b), Ordering::Greater);
    }

    #[test]
    fn hash_breaks_equal_tx_count() {
        let a = proof(1, 3, 0x10, 1);
        let b = proof(2, 3, 0x20, 1);
        assert_eq!(compare(&a, &b), Ordering::Less);
    }

    #[test]
    fn salted_hash_breaks_full_tie() {
        let a = proof(1, 3, 0x10, 1);
        let b = proof(2, 3, 0x10, 1);
        let expected = salted_score(&a.producer, 2).cmp(&salted_score(&b.producer, 2));
        assert_ne!(expected, Ordering::Equal);
        assert_eq!(compare(&a, &b), expected);
        assert_eq!(compare(&b, &a), expected.reverse());
    }

    #[test]
    fn salted_tie_break_is_unbiased() {
        let a = NodeId::derive(b"alice");
        let b = NodeId::derive(b"bob");
        let rounds = 2_000u64;
        let a_wins = (1..=rounds)
            .filter(|h| salted_score(&a, *h) > salted_score(&b, *h))
            .count() as f64;
        let share = a_wins / rounds as f64;
        assert!((0.45..=0.55).contains(&share), "share {share}");
    }

    #[test]
    fn best_of_empty_is_none() {
        assert!(best_of(std::iter::empty()).is_none());
    }

    fn arb_proof() -> impl Strategy<Value = Proof> {
        (0u8..8, 0u64..3, 0u8..3).prop_map(|(id, tx, hash)| proof(id, tx, hash, 7))
    }

    proptest! {
        #[test]
        fn compare_is_antisymmetric(a in arb_proof(), b in arb_proof()) {
            prop_assert_eq!(compare(&a, &b), compare(&b, &a).reverse());
            if compare(&a, &b) == Ordering::Equal {
                prop_assert_eq!(a, b);
            }
        }

        #[test]
        fn compare_is_transitive(a in arb_proof(), b in arb_proof(), c in arb_proof()) {
            if compare(&a, &b) == Ordering::Greater && compare(&b, &c) == Ordering::Greater {
                prop_assert_eq!(compare(&a, &c), Ordering::Greater);
            }
        }
    }
}
