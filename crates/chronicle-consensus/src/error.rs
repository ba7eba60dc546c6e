//! Error types for chronicle-consensus.

use chronicle_clock::PotEvent;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TableError>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TableError {
    /// A phase-bound operation was called on the wrong boundary.
    #[error("{operation} is only valid at {expected}, got {got}")]
    WrongPhase {
        operation: &'static str,
        expected: PotEvent,
        got: PotEvent,
    },
}

pub(crate) fn expect_phase(operation: &'static str, expected: PotEvent, got: PotEvent) -> Result<()> {
    if expected == got {
        Ok(())
    } else {
        Err(TableError::WrongPhase {
            operation,
            expected,
            got,
        })
    }
}
