//! State shared by a node's tasks.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chronicle_consensus::{ProofTable, UndecidedBlockTable};
use chronicle_directory::{PeerDirectory, PeerInfo};
use chronicle_ledger::SegmentedLedger;
use chronicle_protocols::{encode_framed, Message, Payload, ProtocolError, Signer};
use chronicle_types::{Block, Duty, NodeId, RoundAnchor, GENESIS_HEIGHT};
use rand::seq::SliceRandom;
use tokio::sync::{broadcast, watch};
use tracing::{trace, warn};

use crate::{NodeConfig, NodeStatus, Outbox, Stage, State, TxPool};

/// Who a broadcast goes to. The sender itself is always skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Audience {
    All,
    Seeds,
    Peers,
}

/// A reply forwarded from the dispatcher to whoever is waiting on it.
#[derive(Debug, Clone)]
pub(crate) enum Reply {
    Peers { from: NodeId },
    Blocks { from: NodeId, blocks: Vec<Block> },
}

/// Everything the dispatcher, engine and startup share.
///
/// Each table guards itself, so no lock is held across tasks.
pub struct NodeContext {
    pub id: NodeId,
    pub duty: Duty,
    pub config: NodeConfig,
    pub(crate) signer: Arc<dyn Signer>,
    pub ledger: SegmentedLedger,
    pub proofs: ProofTable,
    pub undecided: UndecidedBlockTable,
    pub directory: PeerDirectory,
    pub txpool: TxPool,
    pub(crate) outbox: Outbox,
    stage: watch::Sender<Stage>,
    state: watch::Sender<State>,
    /// Highest height any neighbor has claimed.
    observed_tip: AtomicU64,
    rounds: AtomicU64,
    last_winner: Mutex<Option<NodeId>>,
    replies: broadcast::Sender<Reply>,
    shutdown: watch::Sender<bool>,
}

impl NodeContext {
    pub(crate) fn new(
        config: NodeConfig,
        signer: Arc<dyn Signer>,
        directory: PeerDirectory,
        outbox: Outbox,
        shutdown: watch::Sender<bool>,
    ) -> Self {
        let (stage, _) = watch::channel(Stage::RequestNeighbors);
        let (state, _) = watch::channel(State::Witness);
        let (replies, _) = broadcast::channel(config.channel_capacity.max(16));
        Self {
            id: signer.id(),
            duty: config.duty,
            txpool: TxPool::new(config.channel_capacity * 16),
            config,
            signer,
            ledger: SegmentedLedger::new(),
            proofs: ProofTable::new(RoundAnchor::default()),
            undecided: UndecidedBlockTable::new(Some(GENESIS_HEIGHT)),
            directory,
            outbox,
            stage,
            state,
            observed_tip: AtomicU64::new(0),
            rounds: AtomicU64::new(0),
            last_winner: Mutex::new(None),
            replies,
            shutdown,
        }
    }

    /// This node's own directory entry.
    pub fn self_info(&self) -> PeerInfo {
        PeerInfo::new(self.id, self.config.listen_addr, self.duty)
            .with_public_key(self.signer.public_key())
    }

    pub fn stage(&self) -> Stage {
        *self.stage.borrow()
    }

    pub fn state(&self) -> State {
        *self.state.borrow()
    }

    pub(crate) fn set_stage(&self, stage: Stage) {
        let prev = self.stage.send_replace(stage);
        if prev != stage {
            trace!(from = %prev, to = %stage, "Stage changed");
        }
    }

    pub(crate) fn set_state(&self, state: State) {
        let prev = self.state.send_replace(state);
        if prev != state {
            trace!(from = %prev, to = %state, "State changed");
        }
    }

    pub fn watch_stage(&self) -> watch::Receiver<Stage> {
        self.stage.subscribe()
    }

    pub fn observed_tip(&self) -> u64 {
        self.observed_tip.load(Ordering::Acquire)
    }

    pub(crate) fn observe_height(&self, height: u64) {
        let prev = self.observed_tip.fetch_max(height, Ordering::AcqRel);
        if height > prev {
            trace!(height, "Observed a higher tip");
        }
    }

    pub(crate) fn next_round(&self) -> u64 {
        self.rounds.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn last_winner(&self) -> Option<NodeId> {
        *self.last_winner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn record_winner(&self, producer: NodeId) {
        *self.last_winner.lock().unwrap_or_else(PoisonError::into_inner) = Some(producer);
    }

    pub(crate) fn subscribe_replies(&self) -> broadcast::Receiver<Reply> {
        self.replies.subscribe()
    }

    pub(crate) fn forward_reply(&self, reply: Reply) {
        // Nobody waiting is the normal case once startup is over.
        let _ = self.replies.send(reply);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub(crate) fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Messages must be signed unless this node itself runs unsigned.
    pub(crate) fn require_signatures(&self) -> bool {
        !self.signer.is_stub()
    }

    pub(crate) fn signer(&self) -> &dyn Signer {
        self.signer.as_ref()
    }

    /// Sign and frame `payload`. The epoch is the current tip height.
    pub(crate) fn frame(&self, to: Option<NodeId>, payload: Payload) -> Result<Vec<u8>, ProtocolError> {
        let msg = Message::new(self.id, to, self.ledger.tip_height(), payload).signed(self.signer())?;
        encode_framed(&msg)
    }

    pub(crate) fn send_to_addr(&self, to: Option<NodeId>, addr: SocketAddr, payload: Payload) -> bool {
        let kind = payload.kind();
        match self.frame(to, payload) {
            Ok(bytes) => self.outbox.send(addr, bytes),
            Err(e) => {
                warn!(%kind, %addr, error = %e, "Failed to frame message");
                false
            }
        }
    }

    pub(crate) fn send(&self, peer: &PeerInfo, payload: Payload) -> bool {
        self.send_to_addr(Some(peer.id), peer.addr, payload)
    }

    /// Send to a directory member. Returns false for unknown ids.
    pub(crate) fn send_to(&self, id: &NodeId, payload: Payload) -> bool {
        match self.directory.get(id) {
            Ok(peer) => self.send(&peer, payload),
            Err(e) => {
                trace!(error = %e, "Send skipped");
                false
            }
        }
    }

    /// Frame once and queue a copy for every member of `audience`.
    ///
    /// Returns how many sends were queued.
    pub(crate) fn broadcast(&self, audience: Audience, payload: Payload) -> usize {
        let kind = payload.kind();
        let bytes = match self.frame(None, payload) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(%kind, error = %e, "Failed to frame broadcast");
                return 0;
            }
        };
        let deliver = |peer: &PeerInfo| -> Result<(), ()> {
            if peer.id == self.id || !self.outbox.send(peer.addr, bytes.clone()) {
                return Err(());
            }
            Ok(())
        };
        let (visited, failed) = match audience {
            Audience::Seeds => self.directory.range_seeds(deliver),
            Audience::Peers => self.directory.range_peers(deliver),
            Audience::All => {
                let (seeds, mut failed) = self.directory.range_seeds(deliver);
                let (peers, failed_peers) = self.directory.range_peers(deliver);
                failed.extend(failed_peers);
                (seeds + peers, failed)
            }
        };
        trace!(%kind, ?audience, visited, "Broadcast queued");
        visited - failed.len()
    }

    /// A random neighbor to sync from: a seed if any is known, else a peer.
    pub(crate) fn pick_source(&self) -> Option<PeerInfo> {
        let mut rng = rand::thread_rng();
        let others = |list: Vec<PeerInfo>| -> Vec<PeerInfo> {
            list.into_iter().filter(|p| p.id != self.id).collect()
        };
        others(self.directory.seeds())
            .choose(&mut rng)
            .cloned()
            .or_else(|| others(self.directory.peers()).choose(&mut rng).cloned())
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            id: self.id,
            duty: self.duty,
            stage: self.stage(),
            state: self.state(),
            tip_height: self.ledger.tip_height(),
            max_index: self.ledger.max_index(),
            discontinuous: self.ledger.discontinuous(),
            last_winner: self.last_winner(),
            round: self.rounds.load(Ordering::Acquire),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use chronicle_protocols::{LocalNetwork, Transport};
    use tokio::sync::mpsc;

    use crate::{LatencyRange, SigningMode};

    pub(crate) struct Harness {
        pub ctx: Arc<NodeContext>,
        pub net: Arc<LocalNetwork>,
        pub inbox: mpsc::Receiver<Vec<u8>>,
    }

    pub(crate) fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    /// An unsigned context with instant delivery. Needs a tokio runtime.
    pub(crate) fn harness(duty: Duty, port: u16) -> Harness {
        harness_with(duty, port, SigningMode::Disabled)
    }

    pub(crate) fn harness_with(duty: Duty, port: u16, signing: SigningMode) -> Harness {
        let net = LocalNetwork::new(64);
        let config = NodeConfig {
            duty,
            listen_addr: addr(port),
            signing,
            send_latency_ms: LatencyRange::new(0, 0),
            ..NodeConfig::default()
        };
        let signer = config.signer().unwrap();
        let inbox = net.register(config.listen_addr);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let transport: Arc<dyn Transport> = net.clone();
        let (outbox, _task) = Outbox::spawn(transport, config.send_latency_ms, 64, shutdown_rx);
        let ctx = NodeContext::new(config, signer, PeerDirectory::new(), outbox, shutdown);
        Harness {
            ctx: Arc::new(ctx),
            net,
            inbox,
        }
    }

    /// Put a genesis block in the ledger and point both tables at height 2.
    pub(crate) fn with_genesis(ctx: &NodeContext) -> Block {
        let genesis = Block::genesis(NodeId::derive(b"seed-0"), chronicle_types::now_millis() - 60_000);
        ctx.ledger.add_new_block(genesis.clone()).unwrap();
        ctx.proofs.rebase(RoundAnchor::of(&genesis));
        ctx.undecided.reset(Some(genesis.height + 1));
        genesis
    }

    /// A neighbor with its own inbox on `net`, known to `ctx`.
    pub(crate) fn neighbor(
        h: &Harness,
        label: &str,
        duty: Duty,
        port: u16,
    ) -> (PeerInfo, mpsc::Receiver<Vec<u8>>) {
        let info = PeerInfo::new(NodeId::derive(label.as_bytes()), addr(port), duty);
        let inbox = h.net.register(info.addr);
        h.ctx.directory.set(info.clone()).unwrap();
        (info, inbox)
    }

    pub(crate) fn frame_from(from: NodeId, payload: Payload) -> Vec<u8> {
        encode_framed(&Message::new(from, None, 0, payload)).unwrap()
    }

    pub(crate) fn signed_frame(signer: &dyn Signer, payload: Payload) -> Vec<u8> {
        let msg = Message::new(signer.id(), None, 0, payload).signed(signer).unwrap();
        encode_framed(&msg).unwrap()
    }

    pub(crate) async fn next_message(inbox: &mut mpsc::Receiver<Vec<u8>>) -> Message {
        let frame = tokio::time::timeout(std::time::Duration::from_secs(2), inbox.recv())
            .await
            .expect("timed out waiting for a message")
            .expect("inbox closed");
        chronicle_protocols::decode_framed(&frame).unwrap()
    }
}
