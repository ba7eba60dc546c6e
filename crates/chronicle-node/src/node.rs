//! A running node: its tasks and their lifecycle.

use std::sync::{Arc, Mutex, PoisonError};

use chronicle_clock::Clock;
use chronicle_directory::{MemoryStore, PeerDirectory, Store};
use chronicle_protocols::{Payload, Signer, Transport};
use chronicle_types::{NodeId, Transaction};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, info_span, warn, Instrument};

use crate::context::Audience;
use crate::engine::ConsensusEngine;
use crate::{dispatch, startup, NodeConfig, NodeContext, NodeError, NodeStatus, Outbox, Result};

/// A node that has joined its cluster and is running rounds.
pub struct Node {
    ctx: Arc<NodeContext>,
    clock: Arc<Clock>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    engine: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl Node {
    /// Start a node and wait until it has joined the cluster.
    ///
    /// `inbound` carries the raw frames addressed to this node; `transport`
    /// delivers everything it sends.
    pub async fn init(
        config: NodeConfig,
        signer: Arc<dyn Signer>,
        transport: Arc<dyn Transport>,
        inbound: mpsc::Receiver<Vec<u8>>,
    ) -> Result<Self> {
        config.validate()?;
        let span = info_span!("node", id = %signer.id(), duty = %config.duty);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let directory = open_directory(&config)?;
        let (outbox, outbox_task) = Outbox::spawn(
            transport,
            config.send_latency_ms,
            config.channel_capacity,
            shutdown_rx.clone(),
        );
        let (events_tx, events_rx) = mpsc::channel(config.channel_capacity);
        let clock = Arc::new(Clock::new(config.clock_config(), events_tx, shutdown_rx.clone()));
        let ctx = Arc::new(NodeContext::new(config, signer, directory, outbox, shutdown));

        let dispatch_task = tokio::spawn(
            dispatch::run(Arc::clone(&ctx), inbound, shutdown_rx.clone()).instrument(span.clone()),
        );
        let tasks = vec![outbox_task, dispatch_task];

        let mut engine = ConsensusEngine::new(Arc::clone(&ctx), Arc::clone(&clock), events_rx);
        let joined = startup::run(&ctx, &clock, engine.events_mut())
            .instrument(span.clone())
            .await;
        let pending = match joined {
            Ok(pending) => pending,
            Err(e) => {
                ctx.shutdown();
                clock.close().await;
                let _ = ctx.directory.close();
                for task in tasks {
                    let _ = task.await;
                }
                return Err(e);
            }
        };

        let engine_task = tokio::spawn(engine.run(pending, shutdown_rx).instrument(span.clone()));
        span.in_scope(|| {
            info!(
                addr = %ctx.config.listen_addr,
                tip = ctx.ledger.tip_height(),
                "Node running"
            )
        });
        Ok(Self {
            ctx,
            clock,
            tasks: Mutex::new(tasks),
            engine: Mutex::new(Some(engine_task)),
        })
    }

    pub fn id(&self) -> NodeId {
        self.ctx.id
    }

    pub fn context(&self) -> &Arc<NodeContext> {
        &self.ctx
    }

    pub fn status(&self) -> NodeStatus {
        self.ctx.status()
    }

    /// True once the node stopped, by request or after a fatal error.
    pub fn is_stopped(&self) -> bool {
        self.ctx.is_shutting_down()
    }

    /// Pool a transaction locally and gossip it to the peers.
    pub fn submit_tx(&self, tx: Transaction) -> bool {
        if !self.ctx.txpool.add(tx.clone()) {
            return false;
        }
        self.ctx.broadcast(Audience::Peers, Payload::Txs(vec![tx]));
        true
    }

    /// Stop every task and wait for them.
    ///
    /// Returns the engine's fatal error, if it stopped on one.
    pub async fn close(&self) -> Result<()> {
        self.ctx.shutdown();
        self.clock.close().await;
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Node task panicked");
            }
        }
        let engine = self.engine.lock().unwrap_or_else(PoisonError::into_inner).take();
        let outcome = match engine {
            Some(task) => task
                .await
                .map_err(|e| NodeError::Invariant(format!("engine task failed: {e}")))?,
            None => Ok(()),
        };
        if let Err(e) = self.ctx.directory.close() {
            warn!(error = %e, "Peer store did not close cleanly");
        }
        info!(id = %self.ctx.id, "Node closed");
        outcome
    }
}

fn open_directory(config: &NodeConfig) -> Result<PeerDirectory> {
    let store = match &config.peer_store_path {
        Some(path) => open_store(path)?,
        None => Arc::new(MemoryStore::open()) as Arc<dyn Store>,
    };
    Ok(PeerDirectory::with_store(store)?)
}

#[cfg(feature = "rocksdb")]
fn open_store(path: &std::path::Path) -> Result<Arc<dyn Store>> {
    let store = chronicle_directory::RocksStore::open(path, &[chronicle_directory::PEERS_CF])?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "rocksdb"))]
fn open_store(path: &std::path::Path) -> Result<Arc<dyn Store>> {
    warn!(path = %path.display(), "Built without rocksdb; peer directory kept in memory");
    Ok(Arc::new(MemoryStore::open()))
}

impl Drop for Node {
    fn drop(&mut self) {
        self.ctx.shutdown();
    }
}
