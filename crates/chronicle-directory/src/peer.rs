//! Directory entries.

use std::net::SocketAddr;

use chronicle_types::{now_millis, Duty, NodeId};
use serde::{Deserialize, Serialize};

/// Information about a cluster member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: NodeId,
    pub addr: SocketAddr,
    pub duty: Duty,
    /// Ed25519 public key, empty when signing is stubbed.
    #[serde(default)]
    pub public_key: Vec<u8>,
    /// When this info was last updated (unix millis).
    pub timestamp: u64,
}

impl PeerInfo {
    pub fn new(id: NodeId, addr: SocketAddr, duty: Duty) -> Self {
        Self {
            id,
            addr,
            duty,
            public_key: Vec::new(),
            timestamp: now_millis(),
        }
    }

    pub fn with_public_key(mut self, public_key: Vec<u8>) -> Self {
        self.public_key = public_key;
        self
    }

    /// Check if this info is newer than another.
    pub fn is_newer_than(&self, other: &PeerInfo) -> bool {
        self.timestamp > other.timestamp
    }

    pub fn is_seed(&self) -> bool {
        self.duty == Duty::Seed
    }
}

impl std::fmt::Display for PeerInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})@{}", self.duty, self.id, self.addr)
    }
}
