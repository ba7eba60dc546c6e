//! Node identities and duties.

use serde::{Deserialize, Serialize};

/// Unique node identifier (256-bit hash of the node's public key).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub [u8; 32]);

impl NodeId {
    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Hash a public key to create a NodeId.
    pub fn from_public_key(pubkey: &[u8]) -> Self {
        let hash = blake3::hash(pubkey);
        Self(*hash.as_bytes())
    }

    /// Derive an identity from an arbitrary label.
    ///
    /// Used where no key pair exists (stubbed signing, tests).
    pub fn derive(label: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"chronicle:node-id:");
        hasher.update(label);
        Self(*hasher.finalize().as_bytes())
    }

    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Self(arr))
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}...", &self.to_hex()[..8])
    }
}

/// The fixed role a node plays in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Duty {
    /// Authority node: never produces blocks, relays its judgement.
    Seed,
    /// Producer node: competes for the next block when ready.
    Peer,
}

impl std::fmt::Display for Duty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Seed => write!(f, "seed"),
            Self::Peer => write!(f, "peer"),
        }
    }
}

impl std::str::FromStr for Duty {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "seed" => Ok(Self::Seed),
            "peer" => Ok(Self::Peer),
            other => Err(format!("unknown duty: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_is_deterministic() {
        assert_eq!(NodeId::derive(b"a"), NodeId::derive(b"a"));
        assert_ne!(NodeId::derive(b"a"), NodeId::derive(b"b"));
    }

    #[test]
    fn hex_roundtrip() {
        let id = NodeId::derive(b"peer-7");
        assert_eq!(NodeId::from_hex(&id.to_hex()).unwrap(), id);
    }

    #[test]
    fn duty_parses() {
        assert_eq!("Seed".parse::<Duty>().unwrap(), Duty::Seed);
        assert_eq!(" peer ".parse::<Duty>().unwrap(), Duty::Peer);
        assert!("witness".parse::<Duty>().is_err());
    }
}
