//! File server configuration

use crate::{DEFAULT_ACK_TIMEOUT_MS, DEFAULT_STREAM_TIMEOUT_MS};
use crate::node::error::{NodeError, Result};
use hoard_crypto::EncryptionKey;
use hoard_store::{PathTransform, cas_path_transform};
use hoard_transport::DEFAULT_CHANNEL_CAPACITY;
use std::path::PathBuf;
use std::time::Duration;

/// File server configuration
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Listen address for incoming connections (`":3000"` binds every interface)
    pub listen_addr: String,

    /// Peers dialed on start; empty entries are skipped
    pub bootstrap_nodes: Vec<String>,

    /// Storage root; derived from the listen address when unset
    pub storage_root: Option<PathBuf>,

    /// Key to on-disk path mapping
    pub path_transform: PathTransform,

    /// Pre-shared network key; a random one is generated when unset
    pub encryption_key: Option<EncryptionKey>,

    /// Wait for peer acknowledgements
    pub ack_timeout: Duration,

    /// Wait for an inbound raw stream
    pub stream_timeout: Duration,

    /// Capacity of the inbound RPC channel
    pub channel_capacity: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            // Use port 0 (auto-select) in tests to avoid port conflicts
            #[cfg(test)]
            listen_addr: "127.0.0.1:0".to_string(),
            #[cfg(not(test))]
            listen_addr: ":3000".to_string(),
            bootstrap_nodes: Vec::new(),
            storage_root: None,
            path_transform: cas_path_transform,
            encryption_key: None,
            ack_timeout: Duration::from_millis(DEFAULT_ACK_TIMEOUT_MS),
            stream_timeout: Duration::from_millis(DEFAULT_STREAM_TIMEOUT_MS),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl NodeConfig {
    /// Default configuration listening on `listen_addr`
    #[must_use]
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            ..Self::default()
        }
    }

    /// Set the bootstrap peers
    #[must_use]
    pub fn with_bootstrap<I, S>(mut self, nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.bootstrap_nodes = nodes.into_iter().map(Into::into).collect();
        self
    }

    /// Set the storage root
    #[must_use]
    pub fn with_storage_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.storage_root = Some(root.into());
        self
    }

    /// Set the network key
    #[must_use]
    pub fn with_encryption_key(mut self, key: EncryptionKey) -> Self {
        self.encryption_key = Some(key);
        self
    }

    /// Storage root in effect: the configured one, or
    /// [`default_storage_root`] of the listen address.
    #[must_use]
    pub fn resolved_storage_root(&self) -> PathBuf {
        self.storage_root
            .clone()
            .unwrap_or_else(|| default_storage_root(&self.listen_addr))
    }

    /// Validate configuration
    ///
    /// # Errors
    /// Returns `NodeError::InvalidConfig` for an empty listen address, zero
    /// timeouts, or a zero channel capacity.
    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.is_empty() {
            return Err(NodeError::invalid_config("listen address must not be empty"));
        }
        if self.ack_timeout.is_zero() {
            return Err(NodeError::invalid_config("ack timeout must be positive"));
        }
        if self.stream_timeout.is_zero() {
            return Err(NodeError::invalid_config("stream timeout must be positive"));
        }
        if self.channel_capacity == 0 {
            return Err(NodeError::invalid_config("channel capacity must be positive"));
        }
        Ok(())
    }
}

/// Storage root for a node listening on `listen_addr`.
///
/// `":3000"` → `3000_network`, `"127.0.0.1:4000"` → `127.0.0.1_4000_network`.
#[must_use]
pub fn default_storage_root(listen_addr: &str) -> PathBuf {
    let name = listen_addr.strip_prefix(':').unwrap_or(listen_addr);
    PathBuf::from(format!("{}_network", name.replace(':', "_")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.bootstrap_nodes.is_empty());
        assert!(config.encryption_key.is_none());
        assert_eq!(config.ack_timeout, Duration::from_secs(5));
        assert_eq!(config.stream_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_default_storage_root() {
        assert_eq!(default_storage_root(":3000"), PathBuf::from("3000_network"));
        assert_eq!(
            default_storage_root("127.0.0.1:4000"),
            PathBuf::from("127.0.0.1_4000_network")
        );
    }

    #[test]
    fn test_resolved_storage_root() {
        let config = NodeConfig::new(":5000");
        assert_eq!(config.resolved_storage_root(), PathBuf::from("5000_network"));

        let config = config.with_storage_root("/tmp/hoard");
        assert_eq!(config.resolved_storage_root(), PathBuf::from("/tmp/hoard"));
    }

    #[test]
    fn test_builder() {
        let config = NodeConfig::new(":3000").with_bootstrap([":4000", ""]);
        assert_eq!(config.bootstrap_nodes, vec![":4000".to_string(), String::new()]);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(NodeConfig::new("").validate().is_err());

        let config = NodeConfig {
            ack_timeout: Duration::ZERO,
            ..NodeConfig::default()
        };
        assert!(matches!(config.validate(), Err(NodeError::InvalidConfig(_))));

        let config = NodeConfig {
            channel_capacity: 0,
            ..NodeConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
