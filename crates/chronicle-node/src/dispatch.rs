//! Inbound message handling.
//!
//! Decodes, authenticates and routes every inbound frame. Nothing a
//! neighbor sends can stop the loop: failures are logged and the frame
//! is dropped.

use std::sync::Arc;

use chronicle_directory::PeerInfo;
use chronicle_ledger::LedgerError;
use chronicle_protocols::{chunk_blocks, decode_framed, verify_block, Message, Payload};
use chronicle_types::{Block, BlockHash, NodeId, Proof, Transaction};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

use crate::context::Reply;
use crate::{NodeContext, NodeError, Stage};

/// Most blocks returned for one range request.
pub const MAX_BLOCKS_PER_REPLY: u64 = 64;

/// Run until `inbound` closes or shutdown is signalled.
pub async fn run(
    ctx: Arc<NodeContext>,
    mut inbound: mpsc::Receiver<Vec<u8>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            frame = inbound.recv() => {
                let Some(frame) = frame else { break };
                handle_frame(&ctx, &frame);
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    debug!("Dispatcher stopped");
}

/// Handle one raw frame.
pub fn handle_frame(ctx: &NodeContext, frame: &[u8]) {
    let msg = match decode_framed(frame) {
        Ok(msg) => msg,
        Err(e) => {
            debug!(len = frame.len(), error = %e, "Dropping undecodable frame");
            return;
        }
    };
    if let Err(e) = msg.verify(ctx.require_signatures()) {
        warn!(from = %msg.from, kind = %msg.kind(), error = %e, "Dropping unauthenticated message");
        return;
    }
    if msg.from == ctx.id {
        return;
    }
    let kind = msg.kind();
    let from = msg.from;
    if let Err(e) = handle_message(ctx, msg) {
        debug!(%from, %kind, stage = %ctx.stage(), error = %e, "Message handling failed");
    }
}

fn handle_message(ctx: &NodeContext, msg: Message) -> Result<(), NodeError> {
    trace!(from = %msg.from, kind = %msg.kind(), epoch = msg.epoch, "Message received");
    let from = msg.from;
    match msg.payload {
        Payload::Blocks(blocks) => on_blocks(ctx, from, blocks),
        Payload::NewBlock(block) => on_new_block(ctx, from, block),
        Payload::Txs(txs) => on_txs(ctx, txs),
        Payload::Peers(peers) => on_peers(ctx, from, peers),
        Payload::Proof(proof) => on_proof(ctx, from, proof),
        Payload::ReqBlockByIndex { start, count } => on_req_by_index(ctx, from, start, count),
        Payload::ReqBlockByHash(hashes) => on_req_by_hash(ctx, from, &hashes),
        Payload::ReqPeers(info) => on_req_peers(ctx, from, info),
    }
}

fn on_blocks(ctx: &NodeContext, from: NodeId, mut blocks: Vec<Block>) -> Result<(), NodeError> {
    blocks.retain(|block| authentic(ctx, from, block));
    // Until the genesis block is agreed, replies are only votes.
    if matches!(ctx.stage(), Stage::RequestNeighbors | Stage::RequestFirstBlock) {
        ctx.forward_reply(Reply::Blocks { from, blocks });
        return Ok(());
    }
    let mut added = 0usize;
    for block in &blocks {
        ctx.observe_height(block.height);
        match ctx.ledger.add_block(block.clone()) {
            Ok(true) => {
                ctx.txpool.prune(block);
                added += 1;
            }
            Ok(false) => {}
            Err(e) if e.is_protocol_violation() => {
                warn!(%from, height = block.height, error = %e, "Rejected block from neighbor");
            }
            Err(e) => return Err(e.into()),
        }
    }
    if added > 0 {
        debug!(
            %from,
            added,
            tip = ctx.ledger.tip_height(),
            max_index = ctx.ledger.max_index(),
            "Blocks stored"
        );
    }
    ctx.forward_reply(Reply::Blocks { from, blocks });
    Ok(())
}

fn on_new_block(ctx: &NodeContext, from: NodeId, block: Block) -> Result<(), NodeError> {
    if !authentic(ctx, from, &block) {
        return Ok(());
    }
    ctx.observe_height(block.height.saturating_sub(1));
    let height = block.height;
    let hash = block.hash;
    if ctx.undecided.add(block) {
        trace!(height, %hash, votes = ctx.undecided.votes(&hash), "Candidate block recorded");
    }
    Ok(())
}

/// Blocks must carry their producer's signature whenever messages must.
fn authentic(ctx: &NodeContext, from: NodeId, block: &Block) -> bool {
    match verify_block(block, ctx.require_signatures()) {
        Ok(()) => true,
        Err(e) => {
            warn!(%from, height = block.height, producer = %block.producer, error = %e, "Dropping unauthenticated block");
            false
        }
    }
}

fn on_txs(ctx: &NodeContext, txs: Vec<Transaction>) -> Result<(), NodeError> {
    let added = txs.into_iter().filter(|tx| ctx.txpool.add(tx.clone())).count();
    if added > 0 {
        trace!(added, pending = ctx.txpool.len(), "Transactions pooled");
    }
    Ok(())
}

fn on_peers(ctx: &NodeContext, from: NodeId, peers: Vec<PeerInfo>) -> Result<(), NodeError> {
    for info in peers {
        if info.id == ctx.id {
            continue;
        }
        ctx.directory.set(info)?;
    }
    ctx.forward_reply(Reply::Peers { from });
    Ok(())
}

/// Producers' own proofs count only while competition is open; seed
/// relays count only during the decision phase.
fn on_proof(ctx: &NodeContext, from: NodeId, proof: Proof) -> Result<(), NodeError> {
    if proof.anchor.height > ctx.ledger.tip_height() {
        ctx.observe_height(proof.anchor.height);
    }
    let stage = ctx.stage();
    let accepted = if from == proof.producer {
        stage == Stage::InPot && ctx.proofs.add(proof)
    } else if ctx.directory.is_seed(&from) {
        stage == Stage::PostPot && ctx.proofs.add_relayed(proof, from)
    } else {
        false
    };
    trace!(
        %from,
        producer = %proof.producer,
        anchor = %proof.anchor,
        %stage,
        accepted,
        "Proof received"
    );
    Ok(())
}

fn on_req_by_index(ctx: &NodeContext, from: NodeId, start: i64, count: u64) -> Result<(), NodeError> {
    let count = match count {
        0 => MAX_BLOCKS_PER_REPLY,
        n => n.min(MAX_BLOCKS_PER_REPLY),
    };
    let blocks = match ctx.ledger.get_blocks_by_range(start, count) {
        Ok(blocks) => blocks,
        Err(LedgerError::Gap { available, missing }) => {
            trace!(start, count, missing = missing.len(), "Serving partial range");
            available
        }
        Err(e) => return Err(e.into()),
    };
    reply_blocks(ctx, from, blocks)
}

fn on_req_by_hash(ctx: &NodeContext, from: NodeId, hashes: &[BlockHash]) -> Result<(), NodeError> {
    let mut blocks = ctx.ledger.get_blocks_by_hashes(hashes);
    // Candidates not yet decided are served from the undecided table.
    for hash in hashes {
        if !blocks.iter().any(|b| &b.hash == hash) {
            if let Some(block) = ctx.undecided.get(hash) {
                blocks.push(block);
            }
        }
    }
    reply_blocks(ctx, from, blocks)
}

/// Record the requester, answer with the full membership and tell
/// everyone else about a newcomer.
fn on_req_peers(ctx: &NodeContext, from: NodeId, info: PeerInfo) -> Result<(), NodeError> {
    if info.id != from {
        warn!(%from, claimed = %info.id, "Peer request for another id ignored");
        return Ok(());
    }
    // Configured neighbors start with a zero timestamp until they speak.
    let known = ctx.directory.get(&from).is_ok_and(|p| p.timestamp > 0);
    let changed = ctx.directory.set(info.clone())?;

    let mut everyone = ctx.directory.all();
    everyone.retain(|p| p.id != from);
    everyone.push(ctx.self_info());
    ctx.send_to_addr(Some(from), info.addr, Payload::Peers(everyone));

    if changed && !known {
        debug!(peer = %info, "New member announced");
        let announce = Payload::Peers(vec![info]);
        broadcast_except(ctx, from, announce);
    }
    Ok(())
}

fn broadcast_except(ctx: &NodeContext, skip: NodeId, payload: Payload) -> usize {
    let bytes = match ctx.frame(None, payload) {
        Ok(bytes) => bytes,
        Err(e) => {
            debug!(error = %e, "Failed to frame announcement");
            return 0;
        }
    };
    ctx.directory
        .all()
        .into_iter()
        .filter(|p| p.id != skip && p.id != ctx.id)
        .filter(|p| ctx.outbox.send(p.addr, bytes.clone()))
        .count()
}

/// Answer with as many frames as the blocks need.
fn reply_blocks(ctx: &NodeContext, to: NodeId, blocks: Vec<Block>) -> Result<(), NodeError> {
    let peer = match ctx.directory.get(&to) {
        Ok(peer) => peer,
        Err(e) => {
            trace!(error = %e, blocks = blocks.len(), "Block reply skipped");
            return Ok(());
        }
    };
    for chunk in chunk_blocks(blocks)? {
        let first = chunk.first().map(|b| b.height);
        let len = chunk.len();
        if !ctx.send(&peer, Payload::Blocks(chunk)) {
            warn!(%to, ?first, len, "Block reply not sent");
        }
    }
    Ok(())
}
