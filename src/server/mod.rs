//! Server implementation
//!
//! TCP listeners, live-connection tracking, and graceful shutdown.

mod handler;
mod relay;

pub use handler::handle;
pub use relay::relay;

use anyhow::{Context, Result};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::config::Config;

/// One listening socket plus the handlers it spawns. The plain listener
/// sniffs by first byte; the TLS listener goes straight to the ClientHello
/// sniffer.
pub struct Server {
    listen: String,
    is_tls: bool,
    config: Arc<Config>,
    conns: Arc<ConnTracker>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Server {
    pub fn new(listen: String, is_tls: bool, config: Arc<Config>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            listen,
            is_tls,
            config,
            conns: ConnTracker::new(),
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Bind and serve until shutdown.
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.listen)
            .await
            .with_context(|| format!("failed to bind {}", self.listen))?;
        info!(listen = %self.listen, tls = self.is_tls, "listening");

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    self.spawn_handler(stream, peer);
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!(listen = %self.listen, "listener shutting down");
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    fn spawn_handler(&self, stream: tokio::net::TcpStream, peer: SocketAddr) {
        let (id, mut close_rx) = self.conns.register(peer);
        let conns = self.conns.clone();
        let config = self.config.clone();
        let is_tls = self.is_tls;
        tokio::spawn(async move {
            tokio::select! {
                result = handler::handle(stream, peer, is_tls, &config) => {
                    if let Err(e) = result {
                        debug!(client = %peer, error = %e, "connection error");
                    }
                }
                _ = close_rx.recv() => {
                    debug!(client = %peer, "connection force-closed by shutdown");
                }
            }
            conns.unregister(id);
        });
    }

    /// Stop accepting and force-close every live connection.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        self.conns.close_all();
    }

    /// Live connections on this listener.
    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }
}

/// Registry of live connections. Registration hands out a receiver the
/// handler races against its own work; `close_all` fires it for everyone.
struct ConnTracker {
    conns: DashMap<u64, SocketAddr>,
    next_id: AtomicU64,
    close_tx: broadcast::Sender<()>,
}

impl ConnTracker {
    fn new() -> Arc<Self> {
        let (close_tx, _) = broadcast::channel(1);
        Arc::new(Self {
            conns: DashMap::new(),
            next_id: AtomicU64::new(1),
            close_tx,
        })
    }

    fn register(&self, peer: SocketAddr) -> (u64, broadcast::Receiver<()>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.conns.insert(id, peer);
        debug!(conn_id = id, client = %peer, "connection accepted");
        (id, self.close_tx.subscribe())
    }

    fn unregister(&self, id: u64) {
        if let Some((_, peer)) = self.conns.remove(&id) {
            debug!(conn_id = id, client = %peer, "connection closed");
        }
    }

    fn len(&self) -> usize {
        self.conns.len()
    }

    fn close_all(&self) {
        let live = self.len();
        if live > 0 {
            info!(connections = live, "force-closing live connections");
        }
        let _ = self.close_tx.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_registers_and_unregisters() {
        let tracker = ConnTracker::new();
        let addr: SocketAddr = "127.0.0.1:12345".parse().unwrap();
        let (id, _rx) = tracker.register(addr);
        assert_eq!(tracker.len(), 1);
        tracker.unregister(id);
        assert_eq!(tracker.len(), 0);
    }

    #[tokio::test]
    async fn close_all_reaches_every_subscriber() {
        let tracker = ConnTracker::new();
        let addr: SocketAddr = "127.0.0.1:12345".parse().unwrap();
        let (_, mut rx1) = tracker.register(addr);
        let (_, mut rx2) = tracker.register(addr);
        tracker.close_all();
        assert!(rx1.recv().await.is_ok());
        assert!(rx2.recv().await.is_ok());
    }
}
