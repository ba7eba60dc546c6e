//! Joining the cluster.
//!
//! The first seed creates the genesis block and starts the clock. Every
//! other node learns the membership, agrees on the genesis block with its
//! neighbors, starts its clock on that genesis and, at the first PotStart,
//! fetches the latest block before entering the round cycle.

use std::collections::HashSet;
use std::time::Duration;

use chronicle_clock::{Clock, PotEvent, PotTick};
use chronicle_consensus::UndecidedBlockTable;
use chronicle_directory::PeerInfo;
use chronicle_protocols::Payload;
use chronicle_types::{now_millis, Block, Duty, NodeId, RoundAnchor, GENESIS_HEIGHT};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::context::Reply;
use crate::{NodeContext, NodeError, Result, Stage, State};

/// Put the configured neighbors into the directory.
///
/// Their timestamps are zero so anything they announce replaces them.
pub fn load_neighbors(ctx: &NodeContext) -> Result<()> {
    let configured = ctx
        .config
        .seeds
        .iter()
        .map(|n| n.to_peer_info(Duty::Seed))
        .chain(ctx.config.peers.iter().map(|n| n.to_peer_info(Duty::Peer)));
    for info in configured {
        let info = info?;
        if info.id != ctx.id {
            ctx.directory.set(info)?;
        }
    }
    Ok(())
}

/// A seed with no other seeds configured starts the chain without asking.
pub fn is_first_seed(ctx: &NodeContext) -> bool {
    ctx.duty == Duty::Seed && ctx.config.seeds.iter().all(|s| s.node_id().ok() == Some(ctx.id))
}

/// Bring the node into the round cycle.
///
/// Returns the most recent clock event still worth handling.
pub async fn run(
    ctx: &NodeContext,
    clock: &Clock,
    events: &mut mpsc::Receiver<PotTick>,
) -> Result<Option<PotTick>> {
    load_neighbors(ctx)?;
    if is_first_seed(ctx) {
        bootstrap(ctx, clock)?;
        return Ok(None);
    }

    let responders = match request_neighbors(ctx).await? {
        Some(responders) => responders,
        None => {
            warn!(
                seeds = others(ctx, ctx.directory.seeds()).len(),
                "No other seed reachable; starting a new chain"
            );
            bootstrap(ctx, clock)?;
            return Ok(None);
        }
    };
    let genesis = request_first_block(ctx, &responders).await?;
    clock.start(&genesis)?;

    let boundary = wait_for_pot_start(events).await?;
    request_latest_block(ctx, &responders).await?;
    enter_rounds(ctx);
    info!(
        tip = ctx.ledger.tip_height(),
        observed = ctx.observed_tip(),
        neighbors = ctx.directory.len(),
        boundary_ms = boundary.boundary_ms,
        "Joined the cluster"
    );
    Ok(drain_stale(events, clock))
}

fn bootstrap(ctx: &NodeContext, clock: &Clock) -> Result<()> {
    let mut genesis = Block::genesis(ctx.id, now_millis());
    ctx.signer().sign_block(&mut genesis);
    ctx.ledger.add_new_block(genesis.clone())?;
    ctx.proofs.rebase(RoundAnchor::of(&genesis));
    ctx.undecided.reset(Some(genesis.height + 1));
    ctx.set_stage(Stage::PostPot);
    ctx.set_state(State::Witness);
    clock.start(&genesis)?;
    info!(hash = %genesis.hash, "Genesis block created");
    Ok(())
}

/// Ask the seeds (or, failing that, the configured peers) who is out there.
///
/// `None` when this node is a seed and no other seed answered.
async fn request_neighbors(ctx: &NodeContext) -> Result<Option<Vec<NodeId>>> {
    ctx.set_stage(Stage::RequestNeighbors);
    let timeout = ctx.config.startup_timeout();

    let seeds = others(ctx, ctx.directory.seeds());
    let mut responders = ask_for_peers(ctx, &seeds, timeout).await;
    if responders.is_empty() && ctx.duty == Duty::Seed {
        return Ok(None);
    }
    if responders.is_empty() {
        let peers = others(ctx, ctx.directory.peers());
        if !peers.is_empty() {
            warn!(seeds = seeds.len(), "No seed answered; asking configured peers");
            responders = ask_for_peers(ctx, &peers, timeout).await;
        }
    }
    if responders.is_empty() {
        return Err(NodeError::Startup("no neighbor answered the membership request".into()));
    }
    debug!(responders = responders.len(), known = ctx.directory.len(), "Membership learned");
    Ok(Some(responders))
}

async fn ask_for_peers(ctx: &NodeContext, targets: &[PeerInfo], timeout: Duration) -> Vec<NodeId> {
    let mut replies = ctx.subscribe_replies();
    let asked: HashSet<NodeId> = targets.iter().map(|p| p.id).collect();
    for target in targets {
        ctx.send(target, Payload::ReqPeers(ctx.self_info()));
    }
    collect(&mut replies, asked.len(), timeout, |reply| match reply {
        Reply::Peers { from } if asked.contains(&from) => Some((from, ())),
        _ => None,
    })
    .await
    .into_iter()
    .map(|(from, ())| from)
    .collect()
}

/// Agree on the genesis block by majority of the responders.
async fn request_first_block(ctx: &NodeContext, responders: &[NodeId]) -> Result<Block> {
    ctx.set_stage(Stage::RequestFirstBlock);
    let votes = UndecidedBlockTable::new(Some(GENESIS_HEIGHT));
    let replies = ask_for_blocks(ctx, responders, GENESIS_HEIGHT as i64).await;
    for (_, block) in replies {
        votes.add(block);
    }
    let genesis = votes
        .major()
        .ok_or_else(|| NodeError::Startup("no neighbor served the genesis block".into()))?;
    if !ctx.ledger.contains(&genesis.hash) {
        ctx.ledger.add_block(genesis.clone())?;
    }
    debug!(hash = %genesis.hash, votes = votes.votes(&genesis.hash), "Genesis block agreed");
    Ok(genesis)
}

/// Fetch the neighbors' latest block and whatever lies between it and ours.
async fn request_latest_block(ctx: &NodeContext, responders: &[NodeId]) -> Result<()> {
    ctx.set_stage(Stage::RequestLatestBlock);
    let votes = UndecidedBlockTable::new(None);
    let replies = ask_for_blocks(ctx, responders, -1).await;
    let mut served_by = Vec::new();
    for (from, block) in replies {
        served_by.push((from, block.hash));
        votes.add(block);
    }
    let latest = votes
        .major()
        .ok_or_else(|| NodeError::Startup("no neighbor served its latest block".into()))?;
    ctx.observe_height(latest.height);
    if let Err(e) = ctx.ledger.add_block(latest.clone()) {
        warn!(height = latest.height, error = %e, "Latest block rejected");
        return Ok(());
    }
    ctx.txpool.prune(&latest);

    let tip = ctx.ledger.tip_height();
    if latest.height > tip + 1 {
        let source = served_by
            .iter()
            .find(|(_, hash)| *hash == latest.hash)
            .map(|(from, _)| *from);
        if let Some(source) = source {
            ctx.send_to(
                &source,
                Payload::ReqBlockByIndex {
                    start: (tip + 1) as i64,
                    count: latest.height - tip - 1,
                },
            );
        }
    }
    debug!(latest = latest.height, tip, "Latest block learned");
    Ok(())
}

async fn ask_for_blocks(ctx: &NodeContext, responders: &[NodeId], start: i64) -> Vec<(NodeId, Block)> {
    let mut replies = ctx.subscribe_replies();
    let asked: HashSet<NodeId> = responders.iter().copied().collect();
    for id in responders {
        ctx.send_to(id, Payload::ReqBlockByIndex { start, count: 1 });
    }
    collect(&mut replies, asked.len(), ctx.config.startup_timeout(), |reply| match reply {
        Reply::Blocks { from, mut blocks } if asked.contains(&from) && blocks.len() == 1 => {
            blocks.pop().map(|b| (from, b))
        }
        _ => None,
    })
    .await
}

fn enter_rounds(ctx: &NodeContext) {
    if let Some(tip) = ctx.ledger.tip() {
        ctx.proofs.rebase(RoundAnchor::of(&tip));
        ctx.undecided.reset(Some(tip.height + 1));
    }
    ctx.set_stage(Stage::InPot);
    ctx.set_state(match ctx.duty {
        Duty::Seed => State::Witness,
        Duty::Peer => State::Learner,
    });
}

async fn wait_for_pot_start(events: &mut mpsc::Receiver<PotTick>) -> Result<PotTick> {
    while let Some(tick) = events.recv().await {
        if tick.event == PotEvent::PotStart {
            return Ok(tick);
        }
    }
    Err(NodeError::Startup("clock stopped before the first round".into()))
}

/// Drop events that queued up during startup, keeping the last one if it
/// is still less than a tick old.
fn drain_stale(events: &mut mpsc::Receiver<PotTick>, clock: &Clock) -> Option<PotTick> {
    let tick_ms = clock.config().tick.as_millis() as u64;
    let mut last = None;
    while let Ok(tick) = events.try_recv() {
        last = Some(tick);
    }
    last.filter(|t| now_millis().saturating_sub(t.boundary_ms) < tick_ms)
}

/// Gather one answer per distinct sender until `expected` have answered
/// or `timeout` passes.
async fn collect<T, F>(
    replies: &mut broadcast::Receiver<Reply>,
    expected: usize,
    timeout: Duration,
    mut accept: F,
) -> Vec<(NodeId, T)>
where
    F: FnMut(Reply) -> Option<(NodeId, T)>,
{
    let deadline = Instant::now() + timeout;
    let mut seen = HashSet::new();
    let mut answers = Vec::new();
    while answers.len() < expected {
        match tokio::time::timeout_at(deadline, replies.recv()).await {
            Ok(Ok(reply)) => {
                if let Some((from, value)) = accept(reply) {
                    if seen.insert(from) {
                        answers.push((from, value));
                    }
                }
            }
            Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                debug!(skipped, "Startup replies lagged");
            }
            Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => break,
        }
    }
    answers
}

fn others(ctx: &NodeContext, list: Vec<PeerInfo>) -> Vec<PeerInfo> {
    list.into_iter().filter(|p| p.id != ctx.id).collect()
}
