//! Byte encoding and length-prefixed framing.

use chronicle_types::Block;
use serde::Serialize;

use crate::{Message, ProtocolError, Result, PROTOCOL_VERSION};

/// Largest frame accepted from the wire.
pub const MAX_FRAME_LEN: usize = 60 * 1024;

/// Room for payload contents once the signed envelope is accounted for.
pub const MAX_PAYLOAD_LEN: usize = MAX_FRAME_LEN - 1024;

/// Encoded size of a wire value.
pub fn encoded_len<T: Serialize + ?Sized>(value: &T) -> Result<usize> {
    Ok(bincode::serialized_size(value)? as usize)
}

/// Split `blocks` into ordered runs that each fit one `Blocks` frame.
///
/// A block too large for any frame ends up alone in its run.
pub fn chunk_blocks(blocks: Vec<Block>) -> Result<Vec<Vec<Block>>> {
    let mut chunks = Vec::new();
    let mut current = Vec::new();
    let mut size = 0;
    for block in blocks {
        let len = encoded_len(&block)?;
        if !current.is_empty() && size + len > MAX_PAYLOAD_LEN {
            chunks.push(std::mem::take(&mut current));
            size = 0;
        }
        size += len;
        current.push(block);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    Ok(chunks)
}

/// Serialize a message with bincode.
pub fn encode(msg: &Message) -> Result<Vec<u8>> {
    Ok(bincode::serialize(msg)?)
}

/// Deserialize a message and check its protocol version.
pub fn decode(bytes: &[u8]) -> Result<Message> {
    let msg: Message = bincode::deserialize(bytes)?;
    if msg.version != PROTOCOL_VERSION {
        return Err(ProtocolError::VersionMismatch {
            expected: PROTOCOL_VERSION,
            got: msg.version,
        });
    }
    Ok(msg)
}

/// Encode with a 4-byte little-endian length prefix.
pub fn encode_framed(msg: &Message) -> Result<Vec<u8>> {
    let body = encode(msg)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(ProtocolError::Frame(format!(
            "message of {} bytes exceeds {MAX_FRAME_LEN}",
            body.len()
        )));
    }
    let mut buf = Vec::with_capacity(4 + body.len());
    buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
    buf.extend_from_slice(&body);
    Ok(buf)
}

/// Decode one length-prefixed frame.
pub fn decode_framed(frame: &[u8]) -> Result<Message> {
    let Some((prefix, body)) = frame.split_first_chunk::<4>() else {
        return Err(ProtocolError::Frame("short frame".into()));
    };
    let len = u32::from_le_bytes(*prefix) as usize;
    if len > MAX_FRAME_LEN || body.len() < len {
        return Err(ProtocolError::Frame(format!(
            "declared {len} bytes, have {}",
            body.len()
        )));
    }
    decode(&body[..len])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Ed25519Signer, Payload, Signer};
    use chronicle_types::{NodeId, Proof, RoundAnchor, Transaction};

    fn sample() -> Message {
        let genesis = Block::genesis(NodeId::derive(b"seed"), 0);
        let block = genesis.child(NodeId::derive(b"peer"), 1_000, vec![]);
        Message::new(
            NodeId::derive(b"peer"),
            None,
            3,
            Payload::Proof(Proof::for_block(&block, RoundAnchor::of(&genesis))),
        )
    }

    #[test]
    fn framed_decode_matches() {
        let msg = sample();
        let frame = encode_framed(&msg).unwrap();
        assert_eq!(decode_framed(&frame).unwrap(), msg);
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let frame = encode_framed(&sample()).unwrap();
        assert!(matches!(
            decode_framed(&frame[..frame.len() - 1]),
            Err(ProtocolError::Frame(_))
        ));
        assert!(matches!(decode_framed(&[1, 2]), Err(ProtocolError::Frame(_))));
    }

    #[test]
    fn version_is_checked() {
        let mut msg = sample();
        msg.version = PROTOCOL_VERSION + 1;
        let bytes = encode(&msg).unwrap();
        assert!(matches!(
            decode(&bytes),
            Err(ProtocolError::VersionMismatch { .. })
        ));
    }

    #[test]
    fn garbage_is_a_codec_error() {
        assert!(matches!(decode(&[0xff; 3]), Err(ProtocolError::Codec(_))));
    }

    fn heavy_chain(len: usize) -> Vec<Block> {
        let producer = NodeId::derive(b"peer");
        let mut chain = vec![Block::genesis(NodeId::derive(b"seed"), 0)];
        while chain.len() < len {
            let txs = (0..40)
                .map(|n| Transaction::new(producer, n, vec![n as u8; 64]))
                .collect();
            let prev = &chain[chain.len() - 1];
            let next = prev.child(producer, prev.timestamp_ms + 1_000, txs);
            chain.push(next);
        }
        chain
    }

    #[test]
    fn block_runs_fit_signed_frames() {
        let chain = heavy_chain(40);
        assert!(encoded_len(&chain).unwrap() > MAX_FRAME_LEN);

        let chunks = chunk_blocks(chain.clone()).unwrap();
        assert!(chunks.len() > 1);
        assert_eq!(chunks.concat(), chain);

        let signer = Ed25519Signer::generate();
        for chunk in chunks {
            let msg = Message::new(signer.id(), Some(NodeId::derive(b"asker")), u64::MAX, Payload::Blocks(chunk))
                .signed(&signer)
                .unwrap();
            assert!(encode_framed(&msg).is_ok());
        }
    }

    #[test]
    fn small_replies_stay_whole() {
        let chain = heavy_chain(3);
        assert_eq!(chunk_blocks(chain.clone()).unwrap(), vec![chain]);
        assert!(chunk_blocks(Vec::new()).unwrap().is_empty());
    }
}
