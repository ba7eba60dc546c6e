//! Byte transports.
//!
//! A transport only sends. Inbound bytes are pushed into a queue handed to
//! the node at construction, so the node never depends on how they arrived.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock};

use futures::future::BoxFuture;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::{ProtocolError, Result, MAX_FRAME_LEN};

/// Outbound byte delivery.
pub trait Transport: Send + Sync {
    fn send(&self, addr: SocketAddr, bytes: Vec<u8>) -> BoxFuture<'_, Result<()>>;
}

/// In-process network: one inbox per registered address.
pub struct LocalNetwork {
    inboxes: RwLock<HashMap<SocketAddr, mpsc::Sender<Vec<u8>>>>,
    capacity: usize,
}

impl LocalNetwork {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            inboxes: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        })
    }

    /// Create the inbox for `addr`, replacing any previous one.
    pub fn register(&self, addr: SocketAddr) -> mpsc::Receiver<Vec<u8>> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.inboxes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(addr, tx);
        debug!(%addr, "Local inbox registered");
        rx
    }

    /// Drop the inbox for `addr`; later sends to it fail as unreachable.
    pub fn disconnect(&self, addr: &SocketAddr) -> bool {
        self.inboxes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(addr)
            .is_some()
    }

    pub fn is_registered(&self, addr: &SocketAddr) -> bool {
        self.inboxes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(addr)
    }
}

impl Transport for LocalNetwork {
    fn send(&self, addr: SocketAddr, bytes: Vec<u8>) -> BoxFuture<'_, Result<()>> {
        let inbox = self
            .inboxes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&addr)
            .cloned();
        Box::pin(async move {
            let inbox = inbox.ok_or(ProtocolError::Unreachable(addr))?;
            inbox.send(bytes).await.map_err(|_| ProtocolError::Closed)
        })
    }
}

/// UDP transport; each datagram is one length-prefixed frame.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl UdpTransport {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        info!(addr = %socket.local_addr()?, "UDP transport bound");
        Ok(Self {
            socket: Arc::new(socket),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Forward every received datagram into `inbound` until shutdown.
    pub fn spawn_receiver(
        &self,
        inbound: mpsc::Sender<Vec<u8>>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let socket = Arc::clone(&self.socket);
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_FRAME_LEN + 4];
            loop {
                tokio::select! {
                    received = socket.recv_from(&mut buf) => match received {
                        Ok((len, from)) => {
                            trace!(%from, len, "Datagram received");
                            if inbound.send(buf[..len].to_vec()).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(error = %e, "UDP receive failed"),
                    },
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("UDP receiver stopped");
        })
    }
}

impl Transport for UdpTransport {
    fn send(&self, addr: SocketAddr, bytes: Vec<u8>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if bytes.len() > MAX_FRAME_LEN + 4 {
                return Err(ProtocolError::Frame(format!("{} bytes exceed a datagram", bytes.len())));
            }
            self.socket.send_to(&bytes, addr).await?;
            Ok(())
        })
    }
}
