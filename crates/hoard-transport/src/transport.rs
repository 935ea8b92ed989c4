//! Transport trait abstraction.
//!
//! This module defines the `Transport` trait the file server drives: listen,
//! dial, hand out the inbound RPC channel, and shut down. `TcpTransport` is the
//! production implementation.

use crate::rpc::Rpc;
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

/// Transport layer errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// I/O error from underlying transport
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Transport or connection is closed
    #[error("Transport is closed")]
    Closed,

    /// Address binding failed
    #[error("Failed to bind to address: {0}")]
    BindFailed(String),

    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Handshake rejected the connection
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// Bytes on the wire did not form a valid frame
    #[error("Decode error: {0}")]
    Decode(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Transport-specific error
    #[error("Transport error: {0}")]
    Other(String),
}

impl TransportError {
    /// Returns true for errors that end only the offending connection
    #[must_use]
    pub fn is_connection_local(&self) -> bool {
        matches!(
            self,
            TransportError::Io(_) | TransportError::Handshake(_) | TransportError::Decode(_)
        )
    }
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Async transport trait for peer-to-peer communication.
///
/// Implementations own every live connection. Control messages from all peers
/// are funneled into one bounded channel handed out by [`Transport::consume`];
/// raw streams are claimed per peer through [`crate::Peer::accept_stream`].
///
/// # Examples
///
/// ```no_run
/// use hoard_transport::{TcpTransport, TcpTransportOpts, Transport};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let transport = TcpTransport::new(TcpTransportOpts::new("127.0.0.1:0"));
/// let addr = transport.listen_and_accept().await?;
/// let mut rpcs = transport.consume()?;
///
/// while let Some(rpc) = rpcs.recv().await {
///     println!("{} sent {} bytes to {}", rpc.from, rpc.payload.len(), addr);
/// }
/// # Ok(())
/// # }
/// ```
#[async_trait]
pub trait Transport: Send + Sync {
    /// Address this transport was configured to listen on.
    fn addr(&self) -> &str;

    /// Bind the listener and start accepting connections in the background.
    ///
    /// Returns the bound address.
    ///
    /// # Errors
    /// Returns `TransportError::BindFailed` if the address cannot be bound
    async fn listen_and_accept(&self) -> TransportResult<SocketAddr>;

    /// Take the receiving end of the shared RPC channel.
    ///
    /// # Errors
    /// Returns `TransportError::Other` if the channel was already taken
    fn consume(&self) -> TransportResult<mpsc::Receiver<Rpc>>;

    /// Open an outbound connection to `addr`.
    ///
    /// Returns once the handshake passed and the peer was handed to the
    /// `on_peer` hook. An empty address is a no-op.
    ///
    /// # Errors
    /// Returns `TransportError` if connecting, the handshake or `on_peer` fails
    async fn dial(&self, addr: &str) -> TransportResult<()>;

    /// Stop accepting, end every read loop, and release resources.
    ///
    /// # Errors
    /// Returns `TransportError` if closing fails
    async fn close(&self) -> TransportResult<()>;

    /// Check if the transport is closed.
    fn is_closed(&self) -> bool;

    /// Get the bound listen address.
    ///
    /// # Errors
    /// Returns `TransportError::Closed` if the transport is not listening
    fn local_addr(&self) -> TransportResult<SocketAddr>;

    /// Get transport statistics.
    fn stats(&self) -> TransportStats {
        TransportStats::default()
    }
}

/// Transport statistics snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Payload bytes sent in control frames and raw writes
    pub bytes_sent: u64,
    /// Payload bytes received in control frames
    pub bytes_received: u64,
    /// Control frames sent
    pub frames_sent: u64,
    /// Control frames received
    pub frames_received: u64,
    /// Raw streams opened towards peers
    pub streams_opened: u64,
    /// Raw streams received from peers
    pub streams_received: u64,
    /// Connections that passed the handshake
    pub connections: u64,
    /// Connections dropped because of an error
    pub connection_errors: u64,
}

/// Live counters shared between a transport and its peers.
#[derive(Debug, Default)]
pub struct TransportCounters {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    streams_opened: AtomicU64,
    streams_received: AtomicU64,
    connections: AtomicU64,
    connection_errors: AtomicU64,
}

impl TransportCounters {
    /// Record a sent control frame
    pub fn record_send(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Record raw bytes written outside any frame
    pub fn record_raw_send(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Record a received control frame
    pub fn record_recv(&self, bytes: usize) {
        self.bytes_received
            .fetch_add(bytes as u64, Ordering::Relaxed);
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an outbound stream
    pub fn record_stream_opened(&self) {
        self.streams_opened.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an inbound stream
    pub fn record_stream_received(&self) {
        self.streams_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an established connection
    pub fn record_connection(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection dropped on error
    pub fn record_connection_error(&self) {
        self.connection_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a consistent-enough snapshot of all counters
    #[must_use]
    pub fn snapshot(&self) -> TransportStats {
        TransportStats {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            streams_opened: self.streams_opened.load(Ordering::Relaxed),
            streams_received: self.streams_received.load(Ordering::Relaxed),
            connections: self.connections.load(Ordering::Relaxed),
            connection_errors: self.connection_errors.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_counters() {
        let counters = TransportCounters::default();
        assert_eq!(counters.snapshot(), TransportStats::default());

        counters.record_send(100);
        counters.record_recv(200);
        counters.record_stream_opened();
        counters.record_stream_received();
        counters.record_connection();
        counters.record_connection_error();

        let stats = counters.snapshot();
        assert_eq!(stats.bytes_sent, 100);
        assert_eq!(stats.frames_sent, 1);
        assert_eq!(stats.bytes_received, 200);
        assert_eq!(stats.frames_received, 1);
        assert_eq!(stats.streams_opened, 1);
        assert_eq!(stats.streams_received, 1);
        assert_eq!(stats.connections, 1);
        assert_eq!(stats.connection_errors, 1);
    }

    #[test]
    fn test_transport_counters_multiple_operations() {
        let counters = TransportCounters::default();

        for i in 1..=10 {
            counters.record_send(100);
            let stats = counters.snapshot();
            assert_eq!(stats.frames_sent, i);
            assert_eq!(stats.bytes_sent, i * 100);
        }

        for i in 1..=5 {
            counters.record_recv(50);
            let stats = counters.snapshot();
            assert_eq!(stats.frames_received, i);
            assert_eq!(stats.bytes_received, i * 50);
        }
    }

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::Closed;
        assert_eq!(err.to_string(), "Transport is closed");

        let err = TransportError::BindFailed("test".to_string());
        assert!(err.to_string().contains("Failed to bind"));

        let err = TransportError::ConnectionFailed("test".to_string());
        assert!(err.to_string().contains("Connection failed"));

        let err = TransportError::Decode("unknown tag 0x07".to_string());
        assert_eq!(err.to_string(), "Decode error: unknown tag 0x07");

        let err = TransportError::Other("test error".to_string());
        assert_eq!(err.to_string(), "Transport error: test error");
    }

    #[test]
    fn test_transport_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::Other, "test");
        let transport_err = TransportError::from(io_err);

        assert!(matches!(transport_err, TransportError::Io(_)));
        assert!(transport_err.is_connection_local());
        assert!(!TransportError::Closed.is_connection_local());
    }
}
