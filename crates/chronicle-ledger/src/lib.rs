//! Segmented Ledger
//!
//! Blocks do not arrive in order. A node that joins late, misses a
//! broadcast or receives range replies out of sequence still has to build
//! one hash-linked chain. The ledger keeps what it can verify in
//! **segments** and parks everything else in **holes** until a link appears.
//!
//! ```text
//!   segments:  [1 ────── 4]        [7 ── 9]
//!   holes:                   {6}
//!   max_index: 9
//! ```
//!
//! - A segment is a contiguous, hash-verified run of heights.
//! - A hole is a block whose neighbours are not known yet.
//! - `max_index` only grows; it is the highest height ever held in a segment.
//!
//! # Reconciliation
//!
//! After every insertion, holes are pulled onto segment ends while hash
//! links verify, and segments that become height-adjacent are merged once
//! their boundary link verifies. A boundary that does not verify is a
//! protocol violation: the later segment is discarded wholesale and the
//! first such mismatch is returned as [`LedgerError::HashLinkMismatch`].
//!
//! # Queries
//!
//! Range queries are relative to the active tip (the end of the last
//! segment). A negative start counts back from the tip, `count == 0` runs
//! to the tip, and a range spanning missing heights yields the blocks that
//! exist inside a retryable [`LedgerError::Gap`].

mod error;
mod ledger;

pub use error::{LedgerError, Result};
pub use ledger::{SegmentSpan, SegmentedLedger};
