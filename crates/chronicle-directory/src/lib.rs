//! Peer Directory
//!
//! Who is in the cluster and where to reach them. Seeds and peers are
//! tracked separately because the consensus engine treats them differently:
//! seeds answer startup queries and relay judgements, peers produce blocks.
//!
//! Entries can be persisted through any [`Store`]. [`MemoryStore`] is always
//! available; `RocksStore` is enabled by the `rocksdb` feature.

mod directory;
mod error;
mod peer;
mod store;

pub use directory::{PeerDirectory, PEERS_CF};
pub use error::{DirectoryError, Result, StoreError};
pub use peer::PeerInfo;
pub use store::{MemoryStore, Store};

#[cfg(feature = "rocksdb")]
pub use store::RocksStore;
