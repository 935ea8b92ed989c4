//! Cryptographic error types.

use std::io;
use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Invalid key length
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Key material could not be parsed
    #[error("invalid key material")]
    InvalidKeyMaterial,

    /// Ciphertext ended before the IV was complete
    #[error("ciphertext truncated: need {expected} IV bytes, got {actual}")]
    Truncated {
        /// IV length required
        expected: usize,
        /// Bytes available
        actual: usize,
    },

    /// Random number generation failed
    #[error("random number generation failed")]
    RandomFailed,

    /// Underlying reader or writer failed
    #[error("stream I/O error: {0}")]
    Io(#[from] io::Error),
}

impl CryptoError {
    /// Returns true if the input could not be decoded as a ciphertext stream
    #[must_use]
    pub fn is_decode_error(&self) -> bool {
        matches!(self, CryptoError::Truncated { .. })
    }
}

impl From<CryptoError> for io::Error {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::Io(e) => e,
            CryptoError::Truncated { .. } => io::Error::new(io::ErrorKind::UnexpectedEof, err),
            other => io::Error::other(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CryptoError::InvalidKeyLength {
            expected: 32,
            actual: 7,
        };
        assert_eq!(err.to_string(), "invalid key length: expected 32, got 7");

        let err = CryptoError::Truncated {
            expected: 16,
            actual: 3,
        };
        assert!(err.to_string().contains("truncated"));
        assert!(err.is_decode_error());
    }

    #[test]
    fn test_io_conversion() {
        let err: CryptoError = io::Error::new(io::ErrorKind::BrokenPipe, "gone").into();
        assert!(matches!(err, CryptoError::Io(_)));
        assert!(!err.is_decode_error());
    }
}
