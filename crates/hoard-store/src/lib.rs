//! # HOARD Store
//!
//! Content-addressed storage engine for the HOARD network.
//!
//! This crate provides:
//! - Key to path transforms (SHA-1 sharded CAS layout, identity layout)
//! - An async on-disk store with atomic write-then-rename semantics
//! - Decrypting writes for objects that arrive encrypted from peers
//!
//! ## On-disk Layout
//!
//! ```text
//! {root}/
//! └── db8ac/1c259/eb89d/4a131/b253b/acfca/5f319/d54f2/
//!     └── db8ac1c259eb89d4a131b253bacfca5f319d54f2
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod path;
pub mod store;

pub use error::{Result, StoreError};
pub use path::{PathKey, PathTransform, cas_path_transform, default_path_transform};
pub use store::{Store, StoreConfig};

/// Width of each directory segment produced by [`cas_path_transform`]
pub const SHARD_WIDTH: usize = 5;

/// Root folder used when no storage root is configured
pub const DEFAULT_ROOT_FOLDER: &str = "hoard_network";
