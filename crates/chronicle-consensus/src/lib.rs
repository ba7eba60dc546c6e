//! Leader Election Tables
//!
//! Each round, ready peers broadcast a [`Proof`](chronicle_types::Proof) of
//! their candidate block. Every node ranks what it receives with the same
//! total order, so honest nodes that saw the same proofs pick the same winner
//! with no coordination.
//!
//! # Ranking
//!
//! ```text
//! compare(a, b):
//!   1. higher tx_count wins
//!   2. larger block hash wins
//!   3. larger H(producer ‖ next_height) wins
//! ```
//!
//! The last step is salted with the height being competed for, so no
//! identity wins every tie. Roughly half of all pairwise ties go each way.
//!
//! # Round Lifecycle
//!
//! ```text
//! PotStart ── decide(prev round) ── reset(anchor) ── add(proof)* ──
//! PotOver  ── judge() ── add_relayed(proof, seed)* ── PotStart ...
//! ```
//!
//! Nodes that missed proofs disagree after `judge`. Seeds relay their own
//! judgement during the decision phase; at the next `PotStart`, the proof
//! relayed by the most distinct seeds wins over the local judgement.
//!
//! [`UndecidedBlockTable`] holds the candidate block bodies broadcast by
//! winners, keyed by hash, until the round is decided.

mod error;
mod proof_table;
mod tie_break;
mod undecided;

pub use error::{Result, TableError};
pub use proof_table::ProofTable;
pub use tie_break::{best_of, compare, salted_score};
pub use undecided::UndecidedBlockTable;
