//! Outbound message queue with simulated link latency.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chronicle_protocols::Transport;
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::LatencyRange;

type Envelope = (SocketAddr, Vec<u8>);

/// Handle for queueing framed messages.
///
/// Sends never block the caller; a full queue drops the message.
#[derive(Clone)]
pub struct Outbox {
    queue: mpsc::Sender<Envelope>,
}

impl Outbox {
    /// Start the delivery task.
    ///
    /// Each message is delayed by a uniform draw from `latency` before it
    /// reaches `transport`, so deliveries may overtake each other.
    pub fn spawn(
        transport: Arc<dyn Transport>,
        latency: LatencyRange,
        capacity: usize,
        mut shutdown: watch::Receiver<bool>,
    ) -> (Self, JoinHandle<()>) {
        let (queue, mut rx) = mpsc::channel::<Envelope>(capacity.max(1));
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    next = rx.recv() => {
                        let Some((addr, bytes)) = next else { break };
                        let transport = Arc::clone(&transport);
                        let delay = draw(latency);
                        tokio::spawn(async move {
                            if !delay.is_zero() {
                                tokio::time::sleep(delay).await;
                            }
                            if let Err(e) = transport.send(addr, bytes).await {
                                if e.is_transient() {
                                    trace!(%addr, error = %e, "Delivery failed");
                                } else {
                                    warn!(%addr, error = %e, "Delivery failed");
                                }
                            }
                        });
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Outbox stopped");
        });
        (Self { queue }, handle)
    }

    /// Queue `bytes` for `addr`. Returns false if the message was dropped.
    pub fn send(&self, addr: SocketAddr, bytes: Vec<u8>) -> bool {
        match self.queue.try_send((addr, bytes)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(%addr, "Outbox full, message dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

fn draw(latency: LatencyRange) -> Duration {
    if latency.max_ms == 0 {
        return Duration::ZERO;
    }
    let ms = rand::thread_rng().gen_range(latency.min_ms..=latency.max_ms);
    Duration::from_millis(ms)
}
