//! File server orchestration layer for HOARD
//!
//! This module provides the [`FileServer`], which coordinates:
//! - Peer connections (TCP via hoard-transport)
//! - Local content-addressed storage (hoard-store)
//! - Transfer encryption with the pre-shared network key (hoard-crypto)
//!
//! # Example
//!
//! ```no_run
//! use hoard_core::{FileServer, NodeConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = FileServer::new(NodeConfig::new(":3000"))?;
//!     server.start().await?;
//!
//!     server.store("notes.txt", &b"remember the milk"[..]).await?;
//!     let (size, _file) = server.get("notes.txt").await?;
//!     assert_eq!(size, 17);
//!
//!     server.stop().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
mod handlers;
mod operations;
pub mod registry;
pub mod server;

pub use config::{NodeConfig, default_storage_root};
pub use error::{NodeError, Result};
pub use registry::PeerRegistry;
pub use server::{FileServer, ServerStats};
