//! Wire message envelope and payloads.

use chronicle_directory::PeerInfo;
use chronicle_types::{Block, BlockHash, NodeId, Proof, Transaction};
use serde::{Deserialize, Serialize};

use crate::{verify_signature, ProtocolError, Result, Signer};

/// Current wire protocol version.
pub const PROTOCOL_VERSION: u16 = 1;

/// Tagged payload union. The bincode variant index is the type tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    /// Block-range or block-hash reply.
    Blocks(Vec<Block>),
    /// A winner's candidate block.
    NewBlock(Block),
    Txs(Vec<Transaction>),
    Peers(Vec<PeerInfo>),
    Proof(Proof),
    /// Blocks from `start` (negative counts back from the tip), `count == 0` to the tip.
    ReqBlockByIndex { start: i64, count: u64 },
    ReqBlockByHash(Vec<BlockHash>),
    /// Membership request carrying the requester's own entry.
    ReqPeers(PeerInfo),
}

/// Message type tag, for logging and filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Blocks,
    NewBlock,
    Txs,
    Peers,
    Proof,
    ReqBlockByIndex,
    ReqBlockByHash,
    ReqPeers,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blocks => "blocks",
            Self::NewBlock => "new_block",
            Self::Txs => "txs",
            Self::Peers => "peers",
            Self::Proof => "proof",
            Self::ReqBlockByIndex => "req_block_by_index",
            Self::ReqBlockByHash => "req_block_by_hash",
            Self::ReqPeers => "req_peers",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Payload {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Blocks(_) => MessageKind::Blocks,
            Self::NewBlock(_) => MessageKind::NewBlock,
            Self::Txs(_) => MessageKind::Txs,
            Self::Peers(_) => MessageKind::Peers,
            Self::Proof(_) => MessageKind::Proof,
            Self::ReqBlockByIndex { .. } => MessageKind::ReqBlockByIndex,
            Self::ReqBlockByHash(_) => MessageKind::ReqBlockByHash,
            Self::ReqPeers(_) => MessageKind::ReqPeers,
        }
    }
}

/// Signed envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub version: u16,
    /// Sender's round number (its tip height when sent).
    pub epoch: u64,
    pub from: NodeId,
    /// `None` for broadcasts.
    pub to: Option<NodeId>,
    /// Sender's public key; empty when unsigned.
    pub public_key: Vec<u8>,
    pub signature: Vec<u8>,
    pub payload: Payload,
}

/// The fields covered by the signature, in wire order.
#[derive(Serialize)]
struct SignedPart<'a> {
    version: u16,
    epoch: u64,
    from: &'a NodeId,
    to: &'a Option<NodeId>,
    payload: &'a Payload,
}

impl Message {
    /// Build an unsigned message.
    pub fn new(from: NodeId, to: Option<NodeId>, epoch: u64, payload: Payload) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            epoch,
            from,
            to,
            public_key: Vec::new(),
            signature: Vec::new(),
            payload,
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }

    /// Canonical bytes the signature covers.
    pub fn signing_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(&SignedPart {
            version: self.version,
            epoch: self.epoch,
            from: &self.from,
            to: &self.to,
            payload: &self.payload,
        })?)
    }

    /// Attach the signer's key and signature.
    pub fn signed(mut self, signer: &dyn Signer) -> Result<Self> {
        if signer.is_stub() {
            return Ok(self);
        }
        self.public_key = signer.public_key();
        self.signature = signer.sign(&self.signing_bytes()?);
        Ok(self)
    }

    /// Check the envelope's authenticity.
    ///
    /// Unsigned messages pass only when `require_signature` is false.
    pub fn verify(&self, require_signature: bool) -> Result<()> {
        if self.public_key.is_empty() && self.signature.is_empty() {
            return if require_signature {
                Err(ProtocolError::Unsigned(self.from))
            } else {
                Ok(())
            };
        }
        if NodeId::from_public_key(&self.public_key) != self.from {
            return Err(ProtocolError::IdMismatch(self.from));
        }
        verify_signature(&self.public_key, &self.signing_bytes()?, &self.signature)
            .map_err(|_| ProtocolError::BadSignature(self.from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Ed25519Signer, NoopSigner};

    fn payload() -> Payload {
        Payload::ReqBlockByIndex { start: -1, count: 0 }
    }

    #[test]
    fn signed_message_verifies() {
        let signer = Ed25519Signer::generate();
        let msg = Message::new(signer.id(), None, 7, payload()).signed(&signer).unwrap();
        assert!(msg.verify(true).is_ok());
        assert_eq!(msg.kind(), MessageKind::ReqBlockByIndex);
    }

    #[test]
    fn tampered_payload_fails() {
        let signer = Ed25519Signer::generate();
        let mut msg = Message::new(signer.id(), None, 7, payload()).signed(&signer).unwrap();
        msg.epoch = 8;
        assert!(matches!(msg.verify(true), Err(ProtocolError::BadSignature(_))));
    }

    #[test]
    fn spoofed_sender_fails() {
        let signer = Ed25519Signer::generate();
        let mut msg = Message::new(signer.id(), None, 7, payload()).signed(&signer).unwrap();
        msg.from = NodeId::derive(b"someone-else");
        assert!(matches!(msg.verify(true), Err(ProtocolError::IdMismatch(_))));
    }

    #[test]
    fn unsigned_only_when_allowed() {
        let signer = NoopSigner::new(NodeId::derive(b"peer"));
        let msg = Message::new(signer.id(), None, 0, payload()).signed(&signer).unwrap();
        assert!(msg.signature.is_empty());
        assert!(msg.verify(false).is_ok());
        assert!(matches!(msg.verify(true), Err(ProtocolError::Unsigned(_))));
    }
}
