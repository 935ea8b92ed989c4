//! Error types for the file server
//!
//! Errors are categorized so callers can tell a flaky peer from a real failure.
//!
//! # Error Categories
//!
//! - **Transient**: Temporary failures that may succeed on retry (timeouts, dropped connections)
//! - **Permanent**: Failures that will not succeed without intervention (missing keys, bad config)
//!
//! # Example
//!
//! ```no_run
//! use hoard_core::NodeError;
//!
//! fn handle_error(err: NodeError) {
//!     if err.is_transient() {
//!         println!("Transient error, may retry: {}", err);
//!     } else {
//!         println!("Permanent error: {}", err);
//!     }
//! }
//! ```

use hoard_store::StoreError;
use hoard_transport::TransportError;
use std::borrow::Cow;
use thiserror::Error;

/// Errors that can occur in file server operations
#[derive(Debug, Error, Clone)]
pub enum NodeError {
    // ============ Storage Errors ============
    /// Key is neither stored locally nor held by any peer
    #[error("Key not found: {0}")]
    NotFound(String),

    /// File I/O error
    #[error("File I/O error: {0}")]
    Io(String),

    /// Cryptographic operation failed
    #[error("Crypto error: {0}")]
    Crypto(String),

    // ============ Peer Errors ============
    /// Message from an address that is not in the peer registry
    #[error("Peer not registered: {0}")]
    PeerNotRegistered(String),

    /// Transport operation failed
    #[error("Transport error: {0}")]
    Transport(Cow<'static, str>),

    /// Handshake failed
    #[error("Handshake failed: {0}")]
    Handshake(Cow<'static, str>),

    /// Malformed control message or frame
    #[error("Decode error: {0}")]
    Decode(Cow<'static, str>),

    // ============ Configuration & State Errors ============
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),

    /// Invalid state transition
    #[error("Invalid state: {0}")]
    InvalidState(Cow<'static, str>),

    // ============ Operational Errors ============
    /// Operation timed out
    #[error("Operation timed out: {0}")]
    Timeout(Cow<'static, str>),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(Cow<'static, str>),
}

impl NodeError {
    /// Returns true if this error is transient and may succeed on retry
    ///
    /// Transient errors include:
    /// - Timeouts waiting on a peer
    /// - Transport failures (connection dropped mid-transfer)
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, NodeError::Timeout(_) | NodeError::Transport(_))
    }

    /// Returns true if this error is permanent and will not succeed on retry
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            NodeError::NotFound(_)
                | NodeError::PeerNotRegistered(_)
                | NodeError::InvalidConfig(_)
                | NodeError::InvalidState(_)
                | NodeError::Handshake(_)
                | NodeError::Decode(_)
        )
    }

    /// Check if this is a missing-key error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, NodeError::NotFound(_))
    }

    /// Create a timeout error with static context (zero allocation)
    #[must_use]
    pub const fn timeout(context: &'static str) -> Self {
        NodeError::Timeout(Cow::Borrowed(context))
    }

    /// Create an invalid state error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_state(context: &'static str) -> Self {
        NodeError::InvalidState(Cow::Borrowed(context))
    }

    /// Create an invalid config error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_config(context: &'static str) -> Self {
        NodeError::InvalidConfig(Cow::Borrowed(context))
    }
}

impl From<hoard_crypto::CryptoError> for NodeError {
    fn from(err: hoard_crypto::CryptoError) -> Self {
        NodeError::Crypto(err.to_string())
    }
}

impl From<StoreError> for NodeError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(key) => NodeError::NotFound(key),
            StoreError::Io(e) => NodeError::Io(e.to_string()),
            StoreError::Crypto(e) => e.into(),
        }
    }
}

impl From<TransportError> for NodeError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Handshake(msg) => NodeError::Handshake(Cow::Owned(msg)),
            TransportError::Decode(msg) => NodeError::Decode(Cow::Owned(msg)),
            TransportError::InvalidConfig(msg) => NodeError::InvalidConfig(Cow::Owned(msg)),
            other => NodeError::Transport(Cow::Owned(other.to_string())),
        }
    }
}

impl From<std::io::Error> for NodeError {
    fn from(err: std::io::Error) -> Self {
        NodeError::Io(err.to_string())
    }
}

/// Result type for file server operations
pub type Result<T> = std::result::Result<T, NodeError>;
