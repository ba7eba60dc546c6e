//! The round state machine.
//!
//! Driven only by clock events. At `PotStart` the previous round is
//! decided, the tables move to the new tip and ready peers compete. At
//! `PotOver` every node judges what it has seen; the winner reveals its
//! block and seeds relay their judgement.

use std::sync::Arc;

use chronicle_clock::{Clock, ClockError, PotEvent, PotTick};
use chronicle_protocols::{encoded_len, Payload, MAX_PAYLOAD_LEN};
use chronicle_types::{Block, Duty, Proof, RoundAnchor, Transaction};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, trace, warn};

use crate::context::Audience;
use crate::{NodeContext, NodeError, Result, Stage, State};

/// Upper bound on a signed block's encoding without its transactions.
const BLOCK_HEADER_LEN: usize = 512;

pub(crate) struct ConsensusEngine {
    ctx: Arc<NodeContext>,
    clock: Arc<Clock>,
    events: mpsc::Receiver<PotTick>,
    /// This round's own block, revealed only on winning.
    candidate: Option<Block>,
}

impl ConsensusEngine {
    pub fn new(ctx: Arc<NodeContext>, clock: Arc<Clock>, events: mpsc::Receiver<PotTick>) -> Self {
        Self {
            ctx,
            clock,
            events,
            candidate: None,
        }
    }

    pub(crate) fn events_mut(&mut self) -> &mut mpsc::Receiver<PotTick> {
        &mut self.events
    }

    /// Handle clock events until shutdown. A fatal error stops the node.
    pub async fn run(mut self, pending: Option<PotTick>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        if let Some(tick) = pending {
            self.handle_or_stop(tick)?;
        }
        loop {
            tokio::select! {
                tick = self.events.recv() => {
                    let Some(tick) = tick else { break };
                    self.handle_or_stop(tick)?;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("ConsensusEngine stopped");
        Ok(())
    }

    fn handle_or_stop(&mut self, tick: PotTick) -> Result<()> {
        match self.on_tick(tick) {
            Ok(()) => Ok(()),
            Err(e) if e.is_fatal() => {
                error!(
                    event = %tick.event,
                    stage = %self.ctx.stage(),
                    state = %self.ctx.state(),
                    error = %e,
                    "Stopping node"
                );
                self.ctx.shutdown();
                Err(e)
            }
            Err(e) => {
                warn!(
                    event = %tick.event,
                    stage = %self.ctx.stage(),
                    state = %self.ctx.state(),
                    error = %e,
                    "Round step failed"
                );
                Ok(())
            }
        }
    }

    pub fn on_tick(&mut self, tick: PotTick) -> Result<()> {
        trace!(event = %tick.event, boundary_ms = tick.boundary_ms, "Clock event");
        match tick.event {
            PotEvent::PotStart => self.on_pot_start(tick),
            PotEvent::PotOver => self.on_pot_over(),
        }
    }

    fn on_pot_start(&mut self, tick: PotTick) -> Result<()> {
        let round = self.ctx.next_round();
        if let Some(block) = self.decide()? {
            self.apply(block)?;
        }

        let tip = self
            .ctx
            .ledger
            .tip()
            .ok_or_else(|| NodeError::Invariant("ledger has no tip after startup".into()))?;
        self.ctx.proofs.reset(PotEvent::PotStart, &tip)?;
        self.ctx.undecided.reset(Some(tip.height + 1));
        self.candidate = None;
        self.ctx.set_stage(Stage::InPot);

        if self.ctx.duty == Duty::Peer && self.is_ready() {
            self.compete(&tip, tick.boundary_ms);
        } else {
            self.ctx.set_state(State::Witness);
        }
        self.catch_up();
        debug!(round, tip = tip.height, state = %self.ctx.state(), "Round opened");
        Ok(())
    }

    /// The block the previous round settled on, if its body is here.
    fn decide(&self) -> Result<Option<Block>> {
        let ctx = &self.ctx;
        let anchor = ctx.proofs.anchor();
        let Some(proof) = ctx.proofs.decide(PotEvent::PotStart)? else {
            return Ok(ctx
                .undecided
                .major()
                .filter(|b| b.height == anchor.next_height() && b.prev_hash == anchor.hash));
        };
        match ctx.undecided.get(&proof.block_hash) {
            Some(block) if proof.matches(&block) => Ok(Some(block)),
            Some(block) => {
                warn!(
                    producer = %proof.producer,
                    proof = %proof.block_hash,
                    block = %block.hash,
                    "Winning block does not match its proof"
                );
                Ok(None)
            }
            None => {
                debug!(producer = %proof.producer, hash = %proof.block_hash, "Winning block missing, requesting it");
                self.request_body(&proof);
                Ok(None)
            }
        }
    }

    fn request_body(&self, proof: &Proof) {
        let ctx = &self.ctx;
        let request = Payload::ReqBlockByHash(vec![proof.block_hash]);
        ctx.send_to(&proof.producer, request.clone());
        if let Some(seed) = ctx.directory.seeds().into_iter().find(|s| s.id != ctx.id) {
            ctx.send(&seed, request);
        }
    }

    fn apply(&self, block: Block) -> Result<()> {
        let ctx = &self.ctx;
        let stored = match ctx.ledger.add_new_block(block.clone()) {
            // Already past this height through catch-up; fill it in place.
            Ok(false) => ctx.ledger.add_block(block.clone()),
            other => other,
        };
        match stored {
            Ok(_) => {}
            Err(e) if e.is_protocol_violation() => {
                warn!(height = block.height, producer = %block.producer, error = %e, "Decided block rejected");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        ctx.txpool.prune(&block);
        ctx.record_winner(block.producer);
        info!(
            height = block.height,
            hash = %block.hash,
            producer = %block.producer,
            txs = block.tx_count(),
            "Block decided"
        );

        match self.clock.trigger(&block) {
            Ok(_) => Ok(()),
            Err(e @ ClockError::FutureAnchor { .. }) => Err(e.into()),
            Err(e) => {
                debug!(error = %e, "Clock not re-anchored");
                Ok(())
            }
        }
    }

    /// A node with holes between segments sits out the competition.
    fn is_ready(&self) -> bool {
        !self.ctx.ledger.discontinuous()
    }

    fn compete(&mut self, tip: &Block, boundary_ms: u64) {
        let ctx = &self.ctx;
        let txs = self.candidate_txs();
        let mut block = tip.child(ctx.id, boundary_ms, txs);
        ctx.signer().sign_block(&mut block);

        let proof = Proof::for_block(&block, RoundAnchor::of(tip));
        ctx.proofs.add(proof);
        let sent = ctx.broadcast(Audience::All, Payload::Proof(proof));
        trace!(height = block.height, txs = proof.tx_count, sent, "Competing");

        self.candidate = Some(block);
        ctx.set_state(State::Competitor);
    }

    /// Oldest pooled transactions that keep the candidate within one frame.
    fn candidate_txs(&self) -> Vec<Transaction> {
        let mut room = MAX_PAYLOAD_LEN - BLOCK_HEADER_LEN;
        let pooled = self.ctx.txpool.take(self.ctx.config.max_block_txs);
        let offered = pooled.len();
        let txs: Vec<_> = pooled
            .into_iter()
            .filter(|tx| match encoded_len(tx) {
                Ok(len) if len <= room => {
                    room -= len;
                    true
                }
                _ => false,
            })
            .collect();
        if txs.len() < offered {
            debug!(offered, taken = txs.len(), "Candidate trimmed to one frame");
        }
        txs
    }

    /// Ask a neighbor for every height we are missing, including anything
    /// above our tip that a neighbor has shown us.
    fn catch_up(&self) {
        let ctx = &self.ctx;
        let tip = ctx.ledger.tip_height();
        let observed = ctx.observed_tip();
        let mut ranges = ctx.ledger.missing_ranges();
        let above = ctx.ledger.max_index().max(tip);
        if observed > above {
            ranges.push((above + 1, observed - above));
        }
        if ranges.is_empty() {
            return;
        }
        let Some(source) = ctx.pick_source() else {
            return;
        };
        debug!(source = %source.id, ?ranges, tip, observed, "Catching up");
        for (start, count) in ranges {
            ctx.send(
                &source,
                Payload::ReqBlockByIndex {
                    start: start as i64,
                    count,
                },
            );
        }
    }

    fn on_pot_over(&mut self) -> Result<()> {
        let ctx = &self.ctx;
        ctx.set_stage(Stage::PostPot);
        let judged = ctx.proofs.judge(PotEvent::PotOver)?;
        let Some(proof) = judged else {
            ctx.set_state(match ctx.duty {
                Duty::Seed => State::Witness,
                Duty::Peer => State::Learner,
            });
            return Ok(());
        };

        if proof.producer == ctx.id && ctx.state() == State::Competitor {
            if let Some(block) = self.candidate.clone() {
                ctx.set_state(State::Winner);
                ctx.undecided.add(block.clone());
                let sent = ctx.broadcast(Audience::All, Payload::NewBlock(block));
                debug!(height = proof.anchor.next_height(), sent, "Revealed winning block");
                return Ok(());
            }
        }

        if ctx.duty == Duty::Seed {
            ctx.set_state(State::Judger);
            ctx.proofs.add_relayed(proof, ctx.id);
            ctx.broadcast(Audience::All, Payload::Proof(proof));
            trace!(producer = %proof.producer, "Relayed judgement");
        } else {
            ctx.set_state(State::Learner);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::{harness, neighbor, next_message, with_genesis, Harness};
    use chronicle_clock::ClockConfig;
    use chronicle_types::{now_millis, NodeId, Transaction};

    fn engine(h: &Harness) -> (ConsensusEngine, watch::Sender<bool>) {
        let (events_tx, events_rx) = mpsc::channel(8);
        let (stop, stop_rx) = watch::channel(false);
        let clock = Clock::new(ClockConfig::default(), events_tx, stop_rx);
        (ConsensusEngine::new(Arc::clone(&h.ctx), Arc::new(clock), events_rx), stop)
    }

    fn tick(event: PotEvent) -> PotTick {
        PotTick {
            event,
            boundary_ms: now_millis() - 5,
        }
    }

    #[tokio::test]
    async fn lone_peer_competes_wins_and_extends_the_ledger() {
        let h = harness(Duty::Peer, 2000);
        with_genesis(&h.ctx);
        let tx = Transaction::new(NodeId::derive(b"client"), 0, vec![7u8]);
        h.ctx.txpool.add(tx.clone());
        let (mut engine, _stop) = engine(&h);

        engine.on_tick(tick(PotEvent::PotStart)).unwrap();
        assert_eq!(h.ctx.stage(), Stage::InPot);
        assert_eq!(h.ctx.state(), State::Competitor);
        assert_eq!(h.ctx.proofs.len(), 1);

        engine.on_tick(tick(PotEvent::PotOver)).unwrap();
        assert_eq!(h.ctx.stage(), Stage::PostPot);
        assert_eq!(h.ctx.state(), State::Winner);
        assert_eq!(h.ctx.undecided.len(), 1);

        engine.on_tick(tick(PotEvent::PotStart)).unwrap();
        let tip = h.ctx.ledger.tip().unwrap();
        assert_eq!(tip.height, 2);
        assert_eq!(tip.producer, h.ctx.id);
        assert_eq!(tip.txs, vec![tx]);
        assert!(h.ctx.txpool.is_empty());
        assert_eq!(h.ctx.last_winner(), Some(h.ctx.id));
        assert_eq!(h.ctx.proofs.anchor().height, 2);
        assert_eq!(h.ctx.undecided.scope(), Some(3));
        assert_eq!(h.ctx.status().round, 2);
    }

    #[tokio::test]
    async fn seed_judges_and_relays() {
        let h = harness(Duty::Seed, 2010);
        let genesis = with_genesis(&h.ctx);
        let (peer, mut peer_inbox) = neighbor(&h, "peer", Duty::Peer, 2011);
        let (mut engine, _stop) = engine(&h);

        engine.on_tick(tick(PotEvent::PotStart)).unwrap();
        assert_eq!(h.ctx.state(), State::Witness);
        assert!(h.ctx.proofs.is_empty());

        let block = genesis.child(peer.id, genesis.timestamp_ms + 1_000, vec![]);
        let proof = Proof::for_block(&block, RoundAnchor::of(&genesis));
        assert!(h.ctx.proofs.add(proof));

        engine.on_tick(tick(PotEvent::PotOver)).unwrap();
        assert_eq!(h.ctx.state(), State::Judger);
        assert_eq!(h.ctx.proofs.votes(&peer.id), 1);
        let relayed = next_message(&mut peer_inbox).await;
        assert_eq!(relayed.payload, Payload::Proof(proof));
        assert_eq!(relayed.from, h.ctx.id);
    }

    #[tokio::test]
    async fn missing_winner_body_is_requested() {
        let h = harness(Duty::Peer, 2020);
        let genesis = with_genesis(&h.ctx);
        let (winner, mut winner_inbox) = neighbor(&h, "winner", Duty::Peer, 2021);
        let (mut engine, _stop) = engine(&h);

        h.ctx.set_stage(Stage::InPot);
        let block = genesis.child(winner.id, genesis.timestamp_ms + 1_000, vec![]);
        h.ctx.proofs.add(Proof::for_block(&block, RoundAnchor::of(&genesis)));
        engine.on_tick(tick(PotEvent::PotOver)).unwrap();
        assert_eq!(h.ctx.state(), State::Learner);

        engine.on_tick(tick(PotEvent::PotStart)).unwrap();
        assert_eq!(h.ctx.ledger.tip_height(), 1);
        // The node's own proof for the next round may arrive too.
        loop {
            let msg = next_message(&mut winner_inbox).await;
            if let Payload::ReqBlockByHash(hashes) = msg.payload {
                assert_eq!(hashes, vec![block.hash]);
                break;
            }
        }
    }

    #[tokio::test]
    async fn lagging_peer_requests_the_gap() {
        let h = harness(Duty::Peer, 2030);
        with_genesis(&h.ctx);
        let (_seed, mut seed_inbox) = neighbor(&h, "seed", Duty::Seed, 2031);
        h.ctx.observe_height(5);
        let (mut engine, _stop) = engine(&h);

        engine.on_tick(tick(PotEvent::PotStart)).unwrap();
        loop {
            let msg = next_message(&mut seed_inbox).await;
            if let Payload::ReqBlockByIndex { start, count } = msg.payload {
                assert_eq!((start, count), (2, 4));
                break;
            }
        }
    }

    #[tokio::test]
    async fn discontinuous_peer_sits_out() {
        let h = harness(Duty::Peer, 2060);
        let genesis = with_genesis(&h.ctx);
        let (_seed, mut seed_inbox) = neighbor(&h, "seed", Duty::Seed, 2061);
        let producer = NodeId::derive(b"producer");
        let mut chain = vec![genesis];
        for i in 0..4 {
            let next = chain[i].child(producer, chain[i].timestamp_ms + 1, vec![]);
            chain.push(next);
        }
        // Heights 3 and 5 arrive without 2 and 4.
        h.ctx.ledger.add_new_block(chain[2].clone()).unwrap();
        h.ctx.ledger.add_block(chain[4].clone()).unwrap();
        assert!(h.ctx.ledger.discontinuous());
        let (mut engine, _stop) = engine(&h);

        engine.on_tick(tick(PotEvent::PotStart)).unwrap();
        assert_eq!(h.ctx.state(), State::Witness);
        assert!(h.ctx.proofs.is_empty());
        let request = next_message(&mut seed_inbox).await;
        assert!(matches!(request.payload, Payload::ReqBlockByIndex { start: 2, count: 1 }));
    }

    #[tokio::test]
    async fn majority_candidate_is_adopted_without_proofs() {
        let h = harness(Duty::Seed, 2040);
        let genesis = with_genesis(&h.ctx);
        let producer = NodeId::derive(b"producer");
        let block = genesis.child(producer, genesis.timestamp_ms + 1_000, vec![]);
        h.ctx.undecided.add(block.clone());
        let (mut engine, _stop) = engine(&h);

        engine.on_tick(tick(PotEvent::PotStart)).unwrap();
        assert_eq!(h.ctx.ledger.tip(), Some(block));
        assert_eq!(h.ctx.last_winner(), Some(producer));
    }

    #[tokio::test]
    async fn future_block_stops_the_node() {
        let h = harness(Duty::Seed, 2050);
        let genesis = with_genesis(&h.ctx);
        let producer = NodeId::derive(b"producer");
        let block = genesis.child(producer, now_millis() + 60_000, vec![]);
        h.ctx.proofs.add(Proof::for_block(&block, RoundAnchor::of(&genesis)));
        h.ctx.undecided.add(block);
        let (mut engine, _stop) = engine(&h);

        let err = engine.handle_or_stop(tick(PotEvent::PotStart)).unwrap_err();
        assert!(err.is_fatal());
        assert!(h.ctx.is_shutting_down());
    }

    #[tokio::test]
    async fn candidate_fits_one_frame() {
        let h = harness(Duty::Peer, 2070);
        with_genesis(&h.ctx);
        let client = NodeId::derive(b"client");
        for nonce in 0..300 {
            h.ctx.txpool.add(Transaction::new(client, nonce, vec![1u8; 1_000]));
        }
        let (mut engine, _stop) = engine(&h);

        engine.on_tick(tick(PotEvent::PotStart)).unwrap();
        let candidate = engine.candidate.clone().unwrap();
        assert!(candidate.tx_count() > 0);
        assert!(candidate.tx_count() < 300);
        assert!(encoded_len(&candidate).unwrap() <= MAX_PAYLOAD_LEN);
        assert!(h.ctx.frame(None, Payload::NewBlock(candidate)).is_ok());
    }

    #[tokio::test]
    async fn mismatched_winner_is_not_appended() {
        let h = harness(Duty::Seed, 2080);
        let genesis = with_genesis(&h.ctx);
        let producer = NodeId::derive(b"producer");
        let block = genesis.child(producer, genesis.timestamp_ms + 1_000, vec![]);
        let mut proof = Proof::for_block(&block, RoundAnchor::of(&genesis));
        proof.tx_count = 7;
        h.ctx.proofs.add(proof);
        h.ctx.undecided.add(block);
        let (mut engine, _stop) = engine(&h);

        engine.handle_or_stop(tick(PotEvent::PotStart)).unwrap();
        assert_eq!(h.ctx.ledger.tip_height(), 1);
        assert_eq!(h.ctx.last_winner(), None);
        assert!(!h.ctx.is_shutting_down());
        assert_eq!(h.ctx.stage(), Stage::InPot);
        assert_eq!(h.ctx.proofs.anchor().height, 1);
    }
}
