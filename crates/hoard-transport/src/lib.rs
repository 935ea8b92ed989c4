//! # HOARD Transport
//!
//! Peer transport layer for the HOARD network.
//!
//! This crate provides:
//! - A TCP transport that accepts and dials long-lived peer connections
//! - Pluggable frame codecs and connection handshakes
//! - Multiplexing of framed control messages and raw byte streams on one
//!   connection, with the read loop paused while a stream is consumed
//!
//! ## Connection Lifecycle
//!
//! ```text
//! Connecting ─▶ Handshaking ─▶ Active ◀──▶ Paused (raw stream) ─▶ Closed
//! ```
//!
//! Any decode or I/O error ends only the offending connection.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod handshake;
pub mod peer;
pub mod rpc;
pub mod tcp;
pub mod transport;

use tokio::io::{AsyncRead, AsyncWrite};

pub use codec::{Decoder, Encoder, LengthPrefixedCodec, ObjectCodec};
pub use handshake::{Handshake, HandshakeInfo, NopHandshake, PresharedKeyHandshake};
pub use peer::{ConnPeer, InboundStream, OutboundStream, Peer, StreamSlot};
pub use rpc::{INCOMING_MESSAGE, INCOMING_STREAM, MAX_FRAME_SIZE, Rpc};
pub use tcp::{OnPeer, OnPeerClosed, TcpTransport, TcpTransportOpts};
pub use transport::{Transport, TransportError, TransportResult, TransportStats};

/// Read half of a connection
pub type DynReader = dyn AsyncRead + Send + Unpin;

/// Write half of a connection
pub type DynWriter = dyn AsyncWrite + Send + Unpin;

/// Owned read half of a connection
pub type BoxReader = Box<DynReader>;

/// Owned write half of a connection
pub type BoxWriter = Box<DynWriter>;

/// Default capacity of the shared inbound RPC channel
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;
