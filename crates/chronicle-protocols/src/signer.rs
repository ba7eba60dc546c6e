//! Signing capability.

use chronicle_types::{Block, NodeId};
use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;

use crate::{ProtocolError, Result};

/// Identity plus the ability to sign on its behalf.
pub trait Signer: Send + Sync {
    fn id(&self) -> NodeId;

    /// Public key bytes; empty for stubbed signers.
    fn public_key(&self) -> Vec<u8>;

    fn sign(&self, bytes: &[u8]) -> Vec<u8>;

    /// True when signatures are not produced at all.
    fn is_stub(&self) -> bool {
        false
    }

    /// Sign a block's hash in place.
    fn sign_block(&self, block: &mut Block) {
        if !self.is_stub() {
            block.producer_key = self.public_key();
            block.signature = self.sign(block.hash.as_bytes());
        }
    }
}

/// Ed25519 keys with a self-certifying id.
pub struct Ed25519Signer {
    key: SigningKey,
    id: NodeId,
}

impl Ed25519Signer {
    pub fn new(key: SigningKey) -> Self {
        let id = NodeId::from_public_key(key.verifying_key().as_bytes());
        Self { key, id }
    }

    /// Fresh random identity.
    pub fn generate() -> Self {
        Self::new(SigningKey::generate(&mut OsRng))
    }

    /// Load from a 32-byte hex secret.
    pub fn from_secret_hex(secret: &str) -> Result<Self> {
        let bytes = hex::decode(secret.trim()).map_err(|e| ProtocolError::InvalidKey(e.to_string()))?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| ProtocolError::InvalidKey("secret key must be 32 bytes".into()))?;
        Ok(Self::new(SigningKey::from_bytes(&seed)))
    }

    pub fn secret_hex(&self) -> String {
        hex::encode(self.key.to_bytes())
    }
}

impl Signer for Ed25519Signer {
    fn id(&self) -> NodeId {
        self.id
    }

    fn public_key(&self) -> Vec<u8> {
        self.key.verifying_key().to_bytes().to_vec()
    }

    fn sign(&self, bytes: &[u8]) -> Vec<u8> {
        self.key.sign(bytes).to_bytes().to_vec()
    }
}

/// Stubbed signer for closed clusters and tests.
pub struct NoopSigner {
    id: NodeId,
}

impl NoopSigner {
    pub fn new(id: NodeId) -> Self {
        Self { id }
    }
}

impl Signer for NoopSigner {
    fn id(&self) -> NodeId {
        self.id
    }

    fn public_key(&self) -> Vec<u8> {
        Vec::new()
    }

    fn sign(&self, _bytes: &[u8]) -> Vec<u8> {
        Vec::new()
    }

    fn is_stub(&self) -> bool {
        true
    }
}

/// Verify an Ed25519 signature.
pub fn verify_signature(public_key: &[u8], bytes: &[u8], signature: &[u8]) -> Result<()> {
    let key: [u8; 32] = public_key
        .try_into()
        .map_err(|_| ProtocolError::InvalidKey("public key must be 32 bytes".into()))?;
    let key = VerifyingKey::from_bytes(&key).map_err(|e| ProtocolError::InvalidKey(e.to_string()))?;
    let signature = Signature::from_slice(signature).map_err(|e| ProtocolError::InvalidKey(e.to_string()))?;
    key.verify(bytes, &signature)
        .map_err(|e| ProtocolError::InvalidKey(e.to_string()))
}

/// Check a block's content hash and its producer's signature.
///
/// Unsigned blocks pass only when `require_signature` is false.
pub fn verify_block(block: &Block, require_signature: bool) -> Result<()> {
    if !block.verify_hash() {
        return Err(ProtocolError::BlockHash(block.height));
    }
    if block.producer_key.is_empty() && block.signature.is_empty() {
        return if require_signature {
            Err(ProtocolError::Unsigned(block.producer))
        } else {
            Ok(())
        };
    }
    if NodeId::from_public_key(&block.producer_key) != block.producer {
        return Err(ProtocolError::IdMismatch(block.producer));
    }
    verify_signature(&block.producer_key, block.hash.as_bytes(), &block.signature)
        .map_err(|_| ProtocolError::BadSignature(block.producer))
}
