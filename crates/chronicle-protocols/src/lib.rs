//! Chronicle wire protocol
//!
//! Everything a node puts on the wire is a [`Message`]: a signed envelope
//! around one [`Payload`] variant, bincode-encoded. Transports move opaque
//! bytes; decoding and signature checks happen at the receiving node.
//!
//! # Payloads
//!
//! | Payload | Sent by | Purpose |
//! |---------|---------|---------|
//! | `Proof` | producers, seeds | Competition claims and seed relays |
//! | `NewBlock` | round winner | Candidate block body |
//! | `Blocks` | anyone | Reply to a block request |
//! | `ReqBlockByIndex` / `ReqBlockByHash` | catching-up nodes | Block requests |
//! | `Txs` | clients, peers | Transaction gossip |
//! | `Peers` / `ReqPeers` | anyone | Membership exchange |
//!
//! # Signing
//!
//! With an [`Ed25519Signer`], node ids are self-certifying
//! (`NodeId = BLAKE3(public key)`) and every message carries the sender key.
//! [`NoopSigner`] leaves signatures empty for closed test clusters.

mod codec;
mod error;
mod message;
mod signer;
mod transport;

pub use codec::{
    chunk_blocks, decode, decode_framed, encode, encode_framed, encoded_len, MAX_FRAME_LEN, MAX_PAYLOAD_LEN,
};
pub use error::{ProtocolError, Result};
pub use message::{Message, MessageKind, Payload, PROTOCOL_VERSION};
pub use signer::{verify_block, verify_signature, Ed25519Signer, NoopSigner, Signer};
pub use transport::{LocalNetwork, Transport, UdpTransport};
