//! Error types for chronicle-protocols.

use std::net::SocketAddr;

use chronicle_types::NodeId;
use thiserror::Error;

/// Result type for chronicle-protocols operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Encoding or decoding failed.
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("invalid frame: {0}")]
    Frame(String),

    #[error("protocol version mismatch: expected {expected}, got {got}")]
    VersionMismatch { expected: u16, got: u16 },

    #[error("bad signature from {0}")]
    BadSignature(NodeId),

    /// The sender id is not derived from the attached public key.
    #[error("sender {0} does not match its public key")]
    IdMismatch(NodeId),

    #[error("block at height {0} does not match its hash")]
    BlockHash(u64),

    #[error("unsigned message from {0}")]
    Unsigned(NodeId),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("no route to {0}")]
    Unreachable(SocketAddr),

    #[error("transport closed")]
    Closed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Failures of a single delivery, as opposed to malformed input.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unreachable(_) | Self::Closed | Self::Io(_))
    }
}
