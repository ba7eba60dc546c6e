//! Error types for chronicle-clock.

use thiserror::Error;

/// Result type for clock operations.
pub type Result<T> = std::result::Result<T, ClockError>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClockError {
    /// An anchor block claims a creation time later than the local clock.
    #[error("anchor timestamp {anchor_ms} is in the future (now {now_ms})")]
    FutureAnchor { anchor_ms: u64, now_ms: u64 },

    #[error("clock has not been started")]
    NotStarted,

    #[error("clock is already running")]
    AlreadyStarted,
}
