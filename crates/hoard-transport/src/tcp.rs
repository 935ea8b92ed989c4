//! TCP transport implementation.
//!
//! One task accepts connections; each connection then gets its own task that
//! runs the handshake, announces the peer, and loops decoding frames into the
//! shared RPC channel until the connection fails or is closed.

use crate::codec::{self, Decoder, Encoder, LengthPrefixedCodec};
use crate::handshake::{Handshake, HandshakeInfo, NopHandshake};
use crate::peer::{ConnPeer, InboundStream, Peer};
use crate::rpc::Rpc;
use crate::transport::{
    Transport, TransportCounters, TransportError, TransportResult, TransportStats,
};
use crate::{BoxReader, BoxWriter, DEFAULT_CHANNEL_CAPACITY};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock, PoisonError};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};

/// Called for every connection that passed the handshake. Returning an error
/// closes the connection.
pub type OnPeer = Arc<dyn Fn(Arc<dyn Peer>) -> TransportResult<()> + Send + Sync>;

/// Called with the remote address once a connection's read loop has ended.
pub type OnPeerClosed = Arc<dyn Fn(&str) + Send + Sync>;

/// TCP transport options
#[derive(Clone)]
pub struct TcpTransportOpts {
    /// Address to listen on; `":3000"` binds every interface
    pub listen_addr: String,
    /// Admission check run on every new connection
    pub handshake: Arc<dyn Handshake>,
    /// Frame decoder
    pub decoder: Arc<dyn Decoder>,
    /// Frame encoder
    pub encoder: Arc<dyn Encoder>,
    /// New peer hook
    pub on_peer: Option<OnPeer>,
    /// Closed peer hook
    pub on_peer_closed: Option<OnPeerClosed>,
    /// Capacity of the shared RPC channel
    pub channel_capacity: usize,
    /// Upper bound on the handshake
    pub handshake_timeout: Duration,
}

impl Default for TcpTransportOpts {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:0".to_string(),
            handshake: Arc::new(NopHandshake),
            decoder: Arc::new(LengthPrefixedCodec),
            encoder: Arc::new(LengthPrefixedCodec),
            on_peer: None,
            on_peer_closed: None,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

impl TcpTransportOpts {
    /// Default options listening on `listen_addr`
    #[must_use]
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            ..Self::default()
        }
    }

    /// Set the handshake
    #[must_use]
    pub fn with_handshake(mut self, handshake: impl Handshake + 'static) -> Self {
        self.handshake = Arc::new(handshake);
        self
    }

    /// Use `codec` for both directions
    #[must_use]
    pub fn with_codec<C>(mut self, codec: C) -> Self
    where
        C: Decoder + Encoder + Clone + 'static,
    {
        self.decoder = Arc::new(codec.clone());
        self.encoder = Arc::new(codec);
        self
    }

    /// Set the new peer hook
    #[must_use]
    pub fn with_on_peer<F>(mut self, f: F) -> Self
    where
        F: Fn(Arc<dyn Peer>) -> TransportResult<()> + Send + Sync + 'static,
    {
        self.on_peer = Some(Arc::new(f));
        self
    }

    /// Set the closed peer hook
    #[must_use]
    pub fn with_on_peer_closed<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_peer_closed = Some(Arc::new(f));
        self
    }
}

/// `":3000"` → `"0.0.0.0:3000"`
fn bind_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

/// `":3000"` → `"127.0.0.1:3000"`
fn dial_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("127.0.0.1{addr}")
    } else {
        addr.to_string()
    }
}

struct TcpInner {
    opts: TcpTransportOpts,
    rpc_tx: mpsc::Sender<Rpc>,
    rpc_rx: std::sync::Mutex<Option<mpsc::Receiver<Rpc>>>,
    shutdown: watch::Sender<bool>,
    local_addr: OnceLock<SocketAddr>,
    counters: Arc<TransportCounters>,
}

/// TCP peer transport.
///
/// Cheap to clone; clones share listener, peers, and RPC channel.
#[derive(Clone)]
pub struct TcpTransport {
    inner: Arc<TcpInner>,
}

impl TcpTransport {
    /// Create a transport. Nothing is bound until
    /// [`Transport::listen_and_accept`].
    #[must_use]
    pub fn new(opts: TcpTransportOpts) -> Self {
        let (rpc_tx, rpc_rx) = mpsc::channel(opts.channel_capacity.max(1));
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(TcpInner {
                opts,
                rpc_tx,
                rpc_rx: std::sync::Mutex::new(Some(rpc_rx)),
                shutdown,
                local_addr: OnceLock::new(),
                counters: Arc::new(TransportCounters::default()),
            }),
        }
    }

    /// Run an already established byte pipe as a peer connection.
    ///
    /// Performs the handshake and the `on_peer` hook, then starts the read
    /// loop in the background. TCP connections go through here too.
    ///
    /// # Errors
    /// Returns `TransportError` if the handshake or `on_peer` rejects the
    /// connection; the pipe is closed in that case.
    pub async fn adopt(
        &self,
        mut reader: BoxReader,
        mut writer: BoxWriter,
        remote_addr: String,
        outbound: bool,
    ) -> TransportResult<()> {
        let opts = &self.inner.opts;

        let info = HandshakeInfo {
            remote_addr: &remote_addr,
            outbound,
        };
        let handshake = opts.handshake.handshake(info, &mut *reader, &mut *writer);
        match tokio::time::timeout(opts.handshake_timeout, handshake).await {
            Ok(res) => res?,
            Err(_) => {
                return Err(TransportError::Handshake(format!(
                    "no handshake from {remote_addr} within {:?}",
                    opts.handshake_timeout
                )));
            }
        }

        let (peer, slot) = ConnPeer::new(
            remote_addr.clone(),
            outbound,
            writer,
            Arc::clone(&opts.encoder),
            Arc::clone(&self.inner.counters),
        );

        if let Some(on_peer) = &opts.on_peer {
            let handle: Arc<dyn Peer> = peer.clone();
            if let Err(e) = on_peer(handle) {
                if let Err(close_err) = peer.close().await {
                    tracing::trace!(remote = %remote_addr, error = %close_err, "close after on_peer failure");
                }
                return Err(e);
            }
        }

        self.inner.counters.record_connection();
        tracing::debug!(remote = %remote_addr, outbound, "peer connected");

        let transport = self.clone();
        tokio::spawn(async move {
            transport.run_peer(peer, reader, slot).await;
        });
        Ok(())
    }

    async fn handle_stream(&self, stream: TcpStream, outbound: bool) -> TransportResult<()> {
        let remote_addr = stream.peer_addr()?.to_string();
        if let Err(e) = stream.set_nodelay(true) {
            tracing::trace!(remote = %remote_addr, error = %e, "set_nodelay failed");
        }
        let (reader, writer) = stream.into_split();
        self.adopt(Box::new(reader), Box::new(writer), remote_addr, outbound)
            .await
    }

    async fn accept_loop(self, listener: TcpListener) {
        let mut shutdown = self.inner.shutdown.subscribe();
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let transport = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = transport.handle_stream(stream, false).await {
                                tracing::debug!(remote = %addr, error = %e, "rejected inbound connection");
                            }
                        });
                    }
                    Err(e) => tracing::warn!(error = %e, "accept failed"),
                },
            }
        }
        tracing::debug!(addr = %self.inner.opts.listen_addr, "accept loop stopped");
    }

    async fn run_peer(
        &self,
        peer: Arc<ConnPeer>,
        reader: BoxReader,
        slot: mpsc::Sender<InboundStream>,
    ) {
        match self.read_loop(&peer, reader, slot).await {
            Ok(()) => tracing::debug!(remote = peer.remote_addr(), "connection closed"),
            Err(e) if codec::is_truncated_frame(&e) => {
                self.inner.counters.record_connection_error();
                tracing::debug!(remote = peer.remote_addr(), "peer hung up mid-frame");
            }
            Err(e) if e.is_connection_local() => {
                self.inner.counters.record_connection_error();
                tracing::debug!(remote = peer.remote_addr(), error = %e, "dropping connection");
            }
            // the consumer went away, nothing wrong with the connection itself
            Err(e) => tracing::debug!(remote = peer.remote_addr(), error = %e, "read loop ended"),
        }

        if let Err(e) = peer.close().await {
            tracing::trace!(remote = peer.remote_addr(), error = %e, "close failed");
        }
        if let Some(on_closed) = &self.inner.opts.on_peer_closed {
            on_closed(peer.remote_addr());
        }
    }

    async fn read_loop(
        &self,
        peer: &ConnPeer,
        mut reader: BoxReader,
        slot: mpsc::Sender<InboundStream>,
    ) -> TransportResult<()> {
        let decoder = Arc::clone(&self.inner.opts.decoder);
        let mut peer_closed = peer.closed_signal();
        let mut shutdown = self.inner.shutdown.subscribe();
        if *shutdown.borrow() || *peer_closed.borrow() {
            return Ok(());
        }

        loop {
            let decoded = tokio::select! {
                res = decoder.decode(&mut *reader) => res?,
                _ = peer_closed.changed() => return Ok(()),
                _ = shutdown.changed() => return Ok(()),
            };
            let Some(mut rpc) = decoded else {
                return Ok(());
            };
            rpc.from = peer.remote_addr().to_string();

            if rpc.stream {
                self.inner.counters.record_stream_received();
                tracing::debug!(remote = %rpc.from, "incoming stream, read loop paused");

                let (resume_tx, resume_rx) = oneshot::channel();
                let stream = InboundStream::new(reader, resume_tx, rpc.from.clone());
                tokio::select! {
                    sent = slot.send(stream) => {
                        if sent.is_err() {
                            return Err(TransportError::Closed);
                        }
                    }
                    _ = peer_closed.changed() => return Ok(()),
                    _ = shutdown.changed() => return Ok(()),
                }
                reader = tokio::select! {
                    back = resume_rx => back.map_err(|_| TransportError::Closed)?,
                    _ = peer_closed.changed() => return Ok(()),
                    _ = shutdown.changed() => return Ok(()),
                };

                tracing::debug!(remote = %rpc.from, "stream finished, read loop resumed");
                continue;
            }

            self.inner.counters.record_recv(rpc.payload.len());
            if self.inner.rpc_tx.send(rpc).await.is_err() {
                return Err(TransportError::Closed);
            }
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn addr(&self) -> &str {
        &self.inner.opts.listen_addr
    }

    async fn listen_and_accept(&self) -> TransportResult<SocketAddr> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let bind = bind_addr(&self.inner.opts.listen_addr);
        let listener = TcpListener::bind(&bind)
            .await
            .map_err(|e| TransportError::BindFailed(format!("{bind}: {e}")))?;
        let local = listener.local_addr()?;
        if self.inner.local_addr.set(local).is_err() {
            return Err(TransportError::InvalidConfig(
                "transport is already listening".to_string(),
            ));
        }

        tokio::spawn(self.clone().accept_loop(listener));
        tracing::info!(addr = %local, "TCP transport listening");
        Ok(local)
    }

    fn consume(&self) -> TransportResult<mpsc::Receiver<Rpc>> {
        self.inner
            .rpc_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| TransportError::Other("rpc channel already consumed".to_string()))
    }

    async fn dial(&self, addr: &str) -> TransportResult<()> {
        if addr.is_empty() {
            return Ok(());
        }
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let target = dial_addr(addr);
        let stream = TcpStream::connect(&target)
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("{target}: {e}")))?;
        self.handle_stream(stream, true).await
    }

    async fn close(&self) -> TransportResult<()> {
        if self.inner.shutdown.send_replace(true) {
            return Ok(());
        }
        tracing::info!(addr = %self.inner.opts.listen_addr, "TCP transport closed");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    fn local_addr(&self) -> TransportResult<SocketAddr> {
        self.inner
            .local_addr
            .get()
            .copied()
            .ok_or(TransportError::Closed)
    }

    fn stats(&self) -> TransportStats {
        self.inner.counters.snapshot()
    }
}
