//! Key-name hashing.
//!
//! User keys never travel in the clear: peers see the MD5 hex digest of the
//! key instead, and store replicas under that name.

use md5::{Digest, Md5};

/// Hash a user-supplied key into its network-visible name (32 hex chars).
#[must_use]
pub fn hash_key(key: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_key_known_value() {
        // RFC 1321 test suite
        assert_eq!(hash_key(""), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(hash_key("abc"), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn test_hash_key_deterministic() {
        assert_eq!(hash_key("secret"), hash_key("secret"));
        assert_ne!(hash_key("secret"), hash_key("Secret"));
        assert_eq!(hash_key("anything").len(), 32);
    }
}
