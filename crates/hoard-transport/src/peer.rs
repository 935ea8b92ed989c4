//! Remote peers and raw stream hand-off.
//!
//! Every connection has exactly one reader at a time. Normally that is the
//! connection's read loop. When the loop decodes a stream-begin marker it
//! moves the read half into an [`InboundStream`], parks it in the peer's
//! single-slot rendezvous, and waits. Whoever calls
//! [`Peer::accept_stream`] owns the socket until the stream is finished or
//! dropped, at which point the read half travels back and decoding resumes.
//!
//! ```text
//!  read loop ──StreamBegin──▶ slot(1) ──accept_stream──▶ consumer
//!      ▲                                                   │
//!      └────────────── oneshot (read half) ◀── finish/drop ┘
//! ```

use crate::codec::Encoder;
use crate::transport::{TransportCounters, TransportError, TransportResult};
use crate::{BoxReader, BoxWriter};
use async_trait::async_trait;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::{Mutex, OwnedMutexGuard, mpsc, oneshot, watch};

/// Capability set of a connected remote node.
#[async_trait]
pub trait Peer: Send + Sync {
    /// Remote address, also the peer's registry key
    fn remote_addr(&self) -> &str;

    /// We dialed this connection
    fn is_outbound(&self) -> bool;

    /// Send one framed control message.
    ///
    /// # Errors
    /// Returns `TransportError` if the connection is closed or the write fails.
    async fn send(&self, payload: &[u8]) -> TransportResult<()>;

    /// Write bytes as-is, bypassing the codec.
    ///
    /// # Errors
    /// Returns `TransportError` if the connection is closed or the write fails.
    async fn send_raw(&self, bytes: &[u8]) -> TransportResult<()>;

    /// Write a stream-begin marker and return a writer that owns the
    /// connection until dropped. Other sends on this peer wait meanwhile.
    ///
    /// # Errors
    /// Returns `TransportError` if the connection is closed or the write fails.
    async fn open_stream(&self) -> TransportResult<OutboundStream>;

    /// Take exclusive use of this peer's inbound streams until the returned
    /// slot is dropped.
    async fn reserve_streams(&self) -> StreamSlot;

    /// Wait for the peer's next raw stream.
    ///
    /// # Errors
    /// Returns `TransportError::Closed` if the connection ended first.
    async fn accept_stream(&self) -> TransportResult<InboundStream> {
        self.reserve_streams().await.accept().await
    }

    /// Close the connection.
    ///
    /// # Errors
    /// Returns `TransportError` if shutting down the write half fails.
    async fn close(&self) -> TransportResult<()>;
}

/// Connection-backed [`Peer`] over any async byte pipe.
pub struct ConnPeer {
    remote_addr: String,
    outbound: bool,
    writer: Arc<Mutex<BoxWriter>>,
    encoder: Arc<dyn Encoder>,
    streams: Arc<Mutex<mpsc::Receiver<InboundStream>>>,
    closed: watch::Sender<bool>,
    counters: Arc<TransportCounters>,
}

impl ConnPeer {
    /// Build a peer around the write half of a connection.
    ///
    /// Returns the peer and the sending side of its stream slot, which belongs
    /// to the connection's read loop.
    pub(crate) fn new(
        remote_addr: String,
        outbound: bool,
        writer: BoxWriter,
        encoder: Arc<dyn Encoder>,
        counters: Arc<TransportCounters>,
    ) -> (Arc<Self>, mpsc::Sender<InboundStream>) {
        let (slot_tx, slot_rx) = mpsc::channel(1);
        let (closed, _) = watch::channel(false);
        let peer = Arc::new(Self {
            remote_addr,
            outbound,
            writer: Arc::new(Mutex::new(writer)),
            encoder,
            streams: Arc::new(Mutex::new(slot_rx)),
            closed,
            counters,
        });
        (peer, slot_tx)
    }

    /// Subscribe to the close signal.
    pub(crate) fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    /// Check if [`Peer::close`] was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn ensure_open(&self) -> TransportResult<()> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        Ok(())
    }
}

impl std::fmt::Debug for ConnPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnPeer")
            .field("remote_addr", &self.remote_addr)
            .field("outbound", &self.outbound)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[async_trait]
impl Peer for ConnPeer {
    fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    fn is_outbound(&self) -> bool {
        self.outbound
    }

    async fn send(&self, payload: &[u8]) -> TransportResult<()> {
        self.ensure_open()?;
        let mut writer = self.writer.lock().await;
        self.encoder.encode_message(&mut **writer, payload).await?;
        self.counters.record_send(payload.len());
        Ok(())
    }

    async fn send_raw(&self, bytes: &[u8]) -> TransportResult<()> {
        self.ensure_open()?;
        let mut writer = self.writer.lock().await;
        writer.write_all(bytes).await?;
        writer.flush().await?;
        self.counters.record_raw_send(bytes.len());
        Ok(())
    }

    async fn open_stream(&self) -> TransportResult<OutboundStream> {
        self.ensure_open()?;
        let mut writer = Arc::clone(&self.writer).lock_owned().await;
        self.encoder.encode_stream_begin(&mut **writer).await?;
        self.counters.record_stream_opened();
        Ok(OutboundStream {
            writer,
            written: 0,
        })
    }

    async fn reserve_streams(&self) -> StreamSlot {
        StreamSlot {
            streams: Arc::clone(&self.streams).lock_owned().await,
        }
    }

    async fn close(&self) -> TransportResult<()> {
        if self.closed.send_replace(true) {
            return Ok(());
        }
        let mut writer = self.writer.lock().await;
        match writer.shutdown().await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Exclusive right to accept a peer's inbound streams.
pub struct StreamSlot {
    streams: OwnedMutexGuard<mpsc::Receiver<InboundStream>>,
}

impl StreamSlot {
    /// Build a slot around a stream receiver, for [`Peer`] implementations
    /// outside this crate.
    pub async fn new(streams: mpsc::Receiver<InboundStream>) -> Self {
        Self {
            streams: Arc::new(Mutex::new(streams)).lock_owned().await,
        }
    }

    /// Wait for the peer's next raw stream.
    ///
    /// # Errors
    /// Returns `TransportError::Closed` if the connection ended first.
    pub async fn accept(&mut self) -> TransportResult<InboundStream> {
        self.streams.recv().await.ok_or(TransportError::Closed)
    }
}

impl std::fmt::Debug for StreamSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StreamSlot(..)")
    }
}

/// Exclusive writer for one outbound raw stream.
///
/// Holds the peer's write lock; dropping it lets queued control messages go
/// out again.
pub struct OutboundStream {
    writer: OwnedMutexGuard<BoxWriter>,
    written: u64,
}

impl OutboundStream {
    /// Raw bytes written so far
    #[must_use]
    pub fn bytes_written(&self) -> u64 {
        self.written
    }
}

impl AsyncWrite for OutboundStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let res = Pin::new(&mut *this.writer).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &res {
            this.written += *n as u64;
        }
        res
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.get_mut().writer).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // ending a stream must not end the connection
        Pin::new(&mut *self.get_mut().writer).poll_flush(cx)
    }
}

/// Exclusive reader for one inbound raw stream.
///
/// The stream has no length of its own; callers bound their reads with a size
/// learned from the control plane, e.g. `(&mut stream).take(n)`.
pub struct InboundStream {
    reader: Option<BoxReader>,
    resume: Option<oneshot::Sender<BoxReader>>,
    remote_addr: String,
    read: u64,
}

impl InboundStream {
    pub(crate) fn new(
        reader: BoxReader,
        resume: oneshot::Sender<BoxReader>,
        remote_addr: String,
    ) -> Self {
        Self {
            reader: Some(reader),
            resume: Some(resume),
            remote_addr,
            read: 0,
        }
    }

    /// Peer the stream came from
    #[must_use]
    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    /// Raw bytes consumed so far
    #[must_use]
    pub fn bytes_read(&self) -> u64 {
        self.read
    }

    /// Hand the connection back to its read loop.
    pub fn finish(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let (Some(reader), Some(resume)) = (self.reader.take(), self.resume.take()) {
            if resume.send(reader).is_err() {
                tracing::trace!(remote = %self.remote_addr, "read loop gone before stream finished");
            }
        }
    }
}

impl Drop for InboundStream {
    fn drop(&mut self) {
        self.release();
    }
}

impl AsyncRead for InboundStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let Some(reader) = this.reader.as_mut() else {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "stream already finished",
            )));
        };
        let before = buf.filled().len();
        let res = Pin::new(reader).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &res {
            this.read += (buf.filled().len() - before) as u64;
        }
        res
    }
}

impl std::fmt::Debug for InboundStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundStream")
            .field("remote_addr", &self.remote_addr)
            .field("read", &self.read)
            .finish()
    }
}
