//! File server implementation - high-level orchestrator
//!
//! The [`FileServer`] is the primary entry point for HOARD applications. It
//! owns the transport, the peer registry, the local store, and the network
//! key, and runs the loops that serve peer requests.
//!
//! # Tasks
//!
//! ```text
//! read loops (one per peer) ─▶ rpc channel ─▶ dispatch loop ─┬─ Ack: resolve tracker
//!                                                             └─▶ handler worker (one at a time)
//! ```

use crate::message::OperationId;
use crate::node::config::NodeConfig;
use crate::node::error::{NodeError, Result};
use crate::node::registry::PeerRegistry;
use crate::tracker::CompletionTracker;
use hoard_crypto::EncryptionKey;
use hoard_store::{Store, StoreConfig};
use hoard_transport::{
    OnPeer, OnPeerClosed, Peer, TcpTransport, TcpTransportOpts, Transport, TransportStats,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::time::Instant;

/// File server inner state
pub(crate) struct ServerInner {
    /// Server configuration
    pub(crate) config: NodeConfig,
    /// Local object store, keyed by network key
    pub(crate) store: Store,
    /// Peer transport
    pub(crate) transport: TcpTransport,
    /// Live peers (remote addr -> peer)
    pub(crate) peers: Arc<PeerRegistry>,
    /// Operations waiting on acknowledgements
    pub(crate) tracker: CompletionTracker,
    /// Pre-shared network key
    pub(crate) key: EncryptionKey,
    /// Server running state
    pub(crate) running: AtomicBool,
    /// Quit signal for the dispatch loop and handler worker
    pub(crate) quit: watch::Sender<bool>,
    /// Next operation id
    pub(crate) next_op: AtomicU64,
    /// Ciphertext bytes streamed to peers
    pub(crate) bytes_sent: AtomicU64,
    /// Ciphertext bytes streamed from peers
    pub(crate) bytes_received: AtomicU64,
    /// Serializes network fetches, so two gets never race for the same
    /// peers' answers
    pub(crate) fetch_lock: Mutex<()>,
}

/// HOARD file server
///
/// Stores files locally, replicates them to connected peers, and fetches
/// missing files from the network. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct FileServer {
    pub(crate) inner: Arc<ServerInner>,
}

/// File server statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    /// Ciphertext bytes streamed to peers
    pub bytes_sent: u64,
    /// Ciphertext bytes streamed from peers
    pub bytes_received: u64,
    /// Connected peers
    pub peers: usize,
    /// Transport counters
    pub transport: TransportStats,
}

// ═══════════════════════════════════════════════════════════════════════════
// Constructors
// ═══════════════════════════════════════════════════════════════════════════

impl FileServer {
    /// Create a server with the default transport options (no handshake,
    /// length-prefixed codec).
    ///
    /// # Errors
    /// Returns `NodeError::InvalidConfig` for invalid configuration, or
    /// `NodeError::Crypto` if a network key has to be generated and the OS
    /// random source fails.
    pub fn new(config: NodeConfig) -> Result<Self> {
        Self::with_transport_opts(config, TcpTransportOpts::default())
    }

    /// Create a server with custom transport options.
    ///
    /// The listen address and channel capacity always come from `config`.
    /// Hooks already set in `opts` run before the server's own registry
    /// hooks; an `on_peer` error rejects the peer.
    ///
    /// # Errors
    /// See [`FileServer::new`].
    pub fn with_transport_opts(config: NodeConfig, mut opts: TcpTransportOpts) -> Result<Self> {
        config.validate()?;

        let key = match &config.encryption_key {
            Some(key) => key.clone(),
            None => {
                tracing::warn!(
                    listen_addr = %config.listen_addr,
                    "no network key configured, generated a random one; peers will not be able to read this node's transfers"
                );
                EncryptionKey::generate()?
            }
        };

        let store = Store::new(StoreConfig {
            root: config.resolved_storage_root(),
            path_transform: config.path_transform,
        });

        let peers = Arc::new(PeerRegistry::new());
        opts.listen_addr = config.listen_addr.clone();
        opts.channel_capacity = config.channel_capacity;
        opts.on_peer = Some(registering_hook(Arc::clone(&peers), opts.on_peer.take()));
        opts.on_peer_closed = Some(unregistering_hook(
            Arc::clone(&peers),
            opts.on_peer_closed.take(),
        ));

        let (quit, _) = watch::channel(false);
        let inner = ServerInner {
            transport: TcpTransport::new(opts),
            config,
            store,
            peers,
            tracker: CompletionTracker::new(),
            key,
            running: AtomicBool::new(false),
            quit,
            next_op: AtomicU64::new(1),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            fetch_lock: Mutex::new(()),
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }
}

fn registering_hook(peers: Arc<PeerRegistry>, chained: Option<OnPeer>) -> OnPeer {
    Arc::new(move |peer: Arc<dyn Peer>| {
        if let Some(hook) = &chained {
            hook(Arc::clone(&peer))?;
        }
        tracing::info!(
            remote = peer.remote_addr(),
            outbound = peer.is_outbound(),
            "peer connected"
        );
        peers.insert(peer);
        Ok(())
    })
}

fn unregistering_hook(peers: Arc<PeerRegistry>, chained: Option<OnPeerClosed>) -> OnPeerClosed {
    Arc::new(move |addr: &str| {
        if peers.remove(addr).is_some() {
            tracing::info!(remote = addr, "peer disconnected");
        }
        if let Some(hook) = &chained {
            hook(addr);
        }
    })
}

// ═══════════════════════════════════════════════════════════════════════════
// Lifecycle
// ═══════════════════════════════════════════════════════════════════════════

impl FileServer {
    /// Start listening, dial the bootstrap nodes, and start serving peers.
    ///
    /// Bootstrap dials run in the background; failures are logged.
    ///
    /// # Errors
    /// Returns `NodeError::InvalidState` if the server is running or was
    /// stopped, or `NodeError::Transport` if the listen address cannot be
    /// bound.
    pub async fn start(&self) -> Result<()> {
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(NodeError::invalid_state("File server already running"));
        }

        let started = self.bring_up().await;
        if started.is_err() {
            self.inner.running.store(false, Ordering::SeqCst);
        }
        started
    }

    async fn bring_up(&self) -> Result<()> {
        if self.inner.transport.is_closed() {
            return Err(NodeError::invalid_state(
                "File server cannot be restarted after stop",
            ));
        }

        let local = self.inner.transport.listen_and_accept().await?;
        let rpcs = self.inner.transport.consume()?;

        let (work_tx, work_rx) = mpsc::channel(self.inner.config.channel_capacity);
        tokio::spawn(self.clone().handler_loop(work_rx));
        tokio::spawn(self.clone().dispatch_loop(rpcs, work_tx));

        tracing::info!(
            addr = %local,
            root = %self.inner.store.root().display(),
            "file server listening"
        );

        self.bootstrap();
        Ok(())
    }

    fn bootstrap(&self) {
        for addr in &self.inner.config.bootstrap_nodes {
            if addr.is_empty() {
                continue;
            }
            let transport = self.inner.transport.clone();
            let addr = addr.clone();
            tokio::spawn(async move {
                tracing::debug!(remote = %addr, "dialing bootstrap node");
                if let Err(e) = transport.dial(&addr).await {
                    tracing::warn!(remote = %addr, error = %e, "bootstrap dial failed");
                }
            });
        }
    }

    /// Stop serving: ends the dispatch loop, closes the transport, and drops
    /// every peer.
    ///
    /// # Errors
    /// Returns `NodeError::InvalidState` if the server is not running.
    pub async fn stop(&self) -> Result<()> {
        if self
            .inner
            .running
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(NodeError::invalid_state("File server not running"));
        }

        self.inner.quit.send_replace(true);

        if let Err(e) = self.inner.transport.close().await {
            tracing::warn!(error = %e, "error closing transport");
        }

        for peer in self.inner.peers.drain() {
            if let Err(e) = peer.close().await {
                tracing::debug!(remote = peer.remote_addr(), error = %e, "error closing peer");
            }
        }

        tracing::info!("file server stopped");
        Ok(())
    }

    /// Check if the server is running
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Dial a peer and wait until it is registered.
    ///
    /// # Errors
    /// Returns `NodeError` if the connection or its handshake fails.
    pub async fn connect(&self, addr: &str) -> Result<()> {
        self.inner.transport.dial(addr).await?;
        Ok(())
    }

    /// Wait until at least `count` peers are registered.
    ///
    /// # Errors
    /// Returns `NodeError::Timeout` if that does not happen within `timeout`.
    pub async fn wait_for_peers(&self, count: usize, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        while self.inner.peers.len() < count {
            if Instant::now() >= deadline {
                return Err(NodeError::timeout("waiting for peers to connect"));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Accessors
// ═══════════════════════════════════════════════════════════════════════════

impl FileServer {
    /// Bound listen address
    ///
    /// # Errors
    /// Returns `NodeError::InvalidState` before [`FileServer::start`].
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.inner
            .transport
            .local_addr()
            .map_err(|_| NodeError::invalid_state("File server not started"))
    }

    /// Server configuration
    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    /// Local object store
    pub fn storage(&self) -> &Store {
        &self.inner.store
    }

    /// Remote addresses of connected peers, sorted
    pub fn peers(&self) -> Vec<String> {
        self.inner.peers.addrs()
    }

    /// Statistics snapshot
    pub fn stats(&self) -> ServerStats {
        ServerStats {
            bytes_sent: self.inner.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.inner.bytes_received.load(Ordering::Relaxed),
            peers: self.inner.peers.len(),
            transport: self.inner.transport.stats(),
        }
    }

    pub(crate) fn next_op(&self) -> OperationId {
        self.inner.next_op.fetch_add(1, Ordering::Relaxed)
    }
}

impl std::fmt::Debug for FileServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileServer")
            .field("listen_addr", &self.inner.config.listen_addr)
            .field("root", &self.inner.store.root())
            .field("running", &self.is_running())
            .field("peers", &self.inner.peers)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &tempfile::TempDir) -> NodeConfig {
        NodeConfig::default()
            .with_storage_root(dir.path().join("store"))
            .with_encryption_key(EncryptionKey::new([7u8; 32]))
    }

    #[tokio::test]
    async fn test_start_stop() {
        let dir = tempfile::tempdir().unwrap();
        let server = FileServer::new(test_config(&dir)).unwrap();
        assert!(server.listen_addr().is_err());

        server.start().await.unwrap();
        assert!(server.is_running());
        assert_ne!(server.listen_addr().unwrap().port(), 0);

        // double start
        assert!(matches!(
            server.start().await,
            Err(NodeError::InvalidState(_))
        ));

        server.stop().await.unwrap();
        assert!(!server.is_running());
        assert!(matches!(server.stop().await, Err(NodeError::InvalidState(_))));

        // no restart after stop
        assert!(matches!(
            server.start().await,
            Err(NodeError::InvalidState(_))
        ));
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let config = NodeConfig {
            channel_capacity: 0,
            ..NodeConfig::default()
        };
        assert!(matches!(
            FileServer::new(config),
            Err(NodeError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_registers_both_sides() {
        let dir = tempfile::tempdir().unwrap();
        let a = FileServer::new(test_config(&dir).with_storage_root(dir.path().join("a"))).unwrap();
        let b = FileServer::new(test_config(&dir).with_storage_root(dir.path().join("b"))).unwrap();
        a.start().await.unwrap();
        b.start().await.unwrap();

        b.connect(&a.listen_addr().unwrap().to_string()).await.unwrap();
        a.wait_for_peers(1, Duration::from_secs(5)).await.unwrap();

        assert_eq!(b.peers(), vec![a.listen_addr().unwrap().to_string()]);
        assert_eq!(a.stats().peers, 1);

        b.stop().await.unwrap();
        a.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_bootstrap_dials_in_background() {
        let dir = tempfile::tempdir().unwrap();
        let a = FileServer::new(test_config(&dir).with_storage_root(dir.path().join("a"))).unwrap();
        a.start().await.unwrap();

        let b = FileServer::new(
            test_config(&dir)
                .with_storage_root(dir.path().join("b"))
                .with_bootstrap([String::new(), a.listen_addr().unwrap().to_string()]),
        )
        .unwrap();
        b.start().await.unwrap();

        b.wait_for_peers(1, Duration::from_secs(5)).await.unwrap();
        a.wait_for_peers(1, Duration::from_secs(5)).await.unwrap();

        b.stop().await.unwrap();
        a.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_peers_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let server = FileServer::new(test_config(&dir)).unwrap();
        let err = server
            .wait_for_peers(1, Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::Timeout(_)));
    }
}
