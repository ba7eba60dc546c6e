//! Error types for chronicle-directory.

use chronicle_types::NodeId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DirectoryError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unknown column family: {0}")]
    UnknownColumnFamily(String),

    #[error("store is closed")]
    Closed,

    #[error("storage backend error: {0}")]
    Backend(String),
}

#[cfg(feature = "rocksdb")]
impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        Self::Backend(e.into_string())
    }
}

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("unknown peer: {0}")]
    UnknownPeer(NodeId),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
