//! # HOARD Core
//!
//! Distributed file server for the HOARD content store.
//!
//! This crate provides:
//! - The control protocol exchanged between nodes ([`Message`])
//! - The [`FileServer`] that owns the peer registry, the local store, and the
//!   dispatch loop serving peer requests
//! - Completion tracking for operations that wait on peer acknowledgements
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         FileServer                               │
//! │   store / get / remove, dispatch loop, peer registry             │
//! ├────────────────────────────────┬────────────────────────────────┤
//! │        hoard-transport         │          hoard-store           │
//! │  framed control + raw streams  │   content-addressed files      │
//! ├────────────────────────────────┴────────────────────────────────┤
//! │                         hoard-crypto                             │
//! │   AES-256-CTR transfer encryption, key names                     │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod message;
pub mod node;
pub mod reader;
pub mod tracker;

pub use message::{Message, OperationId};
pub use node::{FileServer, NodeConfig, NodeError, PeerRegistry, Result, ServerStats};
pub use reader::{ExactReader, TeeReader};
pub use tracker::CompletionTracker;

/// Default wait for peer acknowledgements
pub const DEFAULT_ACK_TIMEOUT_MS: u64 = 5_000;

/// Default wait for an inbound raw stream
pub const DEFAULT_STREAM_TIMEOUT_MS: u64 = 10_000;
