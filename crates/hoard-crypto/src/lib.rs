//! # HOARD Crypto
//!
//! Cryptographic primitives for the HOARD content store.
//!
//! This crate provides:
//! - Streaming AES-256-CTR encryption with a random IV prefix
//! - Zeroizing network key handling
//! - Key-name hashing for network-visible identifiers
//! - Secure random number generation
//!
//! ## Cryptographic Suite
//!
//! | Function | Algorithm | Notes |
//! |----------|-----------|-------|
//! | Stream cipher | AES-256-CTR | 16-byte IV prefix, no tag |
//! | Key names | MD5 | identifier only, not a security boundary |
//! | Randomness | OS CSPRNG | via `getrandom` |

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod hash;
pub mod key;
pub mod random;
pub mod stream;

pub use error::CryptoError;
pub use hash::hash_key;
pub use key::EncryptionKey;
pub use stream::{decrypt_stream, encrypt_stream};

/// AES-256 key size
pub const KEY_SIZE: usize = 32;

/// CTR initialization vector size, also the ciphertext length overhead
pub const IV_SIZE: usize = 16;

/// Buffer size used when streaming through the cipher
pub const STREAM_BUFFER_SIZE: usize = 32 * 1024;
