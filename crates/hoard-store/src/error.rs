//! Storage error types.

use hoard_crypto::CryptoError;
use std::io;
use thiserror::Error;

/// Storage errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// No object stored under this key
    #[error("key not found in store: {0}")]
    NotFound(String),

    /// Filesystem operation failed
    #[error("storage I/O error: {0}")]
    Io(#[from] io::Error),

    /// Decrypting or encrypting an object failed
    #[error("storage crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

impl StoreError {
    /// Returns true if the key was absent
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

/// Result type for storage operations
pub type Result<T> = std::result::Result<T, StoreError>;
