//! Error types for chronicle-node.

use chronicle_clock::ClockError;
use chronicle_consensus::TableError;
use chronicle_directory::{DirectoryError, StoreError};
use chronicle_ledger::LedgerError;
use chronicle_protocols::ProtocolError;
use thiserror::Error;

use crate::ConfigError;

/// Result type for node operations.
pub type Result<T> = std::result::Result<T, NodeError>;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("clock error: {0}")]
    Clock(#[from] ClockError),

    #[error("table error: {0}")]
    Table(#[from] TableError),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("directory error: {0}")]
    Directory(#[from] DirectoryError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Startup could not reach enough of the cluster.
    #[error("startup failed: {0}")]
    Startup(String),

    /// The node's own state is inconsistent; it must stop.
    #[error("invariant violated: {0}")]
    Invariant(String),
}

impl NodeError {
    /// Errors after which the node must not keep running.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Startup(_) | Self::Invariant(_) | Self::Clock(ClockError::FutureAnchor { .. })
        )
    }
}
