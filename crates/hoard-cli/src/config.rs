//! Configuration file handling

use hoard_core::{DEFAULT_ACK_TIMEOUT_MS, DEFAULT_STREAM_TIMEOUT_MS, NodeConfig};
use hoard_crypto::EncryptionKey;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// HOARD configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Node settings
    #[serde(default)]
    pub node: NodeSection,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    /// Listen address (`host:port` or `:port`)
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Peers dialed at startup
    #[serde(default)]
    pub bootstrap_nodes: Vec<String>,

    /// Storage root; derived from the listen address when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_root: Option<PathBuf>,

    /// Hex-encoded network key shared by every node in the network
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_key: Option<String>,

    /// Authenticate peers with the network key before exchanging messages
    #[serde(default = "default_true")]
    pub handshake: bool,

    /// How long a store waits for peers to acknowledge (milliseconds)
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,

    /// How long to wait for a peer's stream to begin (milliseconds)
    #[serde(default = "default_stream_timeout_ms")]
    pub stream_timeout_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen_addr() -> String {
    ":3000".to_string()
}

fn default_true() -> bool {
    true
}

fn default_ack_timeout_ms() -> u64 {
    DEFAULT_ACK_TIMEOUT_MS
}

fn default_stream_timeout_ms() -> u64 {
    DEFAULT_STREAM_TIMEOUT_MS
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            bootstrap_nodes: Vec::new(),
            storage_root: None,
            network_key: None,
            handshake: default_true(),
            ack_timeout_ms: default_ack_timeout_ms(),
            stream_timeout_ms: default_stream_timeout_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("hoard/config.toml")
    }

    /// Load config from default path, or create default if it doesn't exist
    ///
    /// # Errors
    ///
    /// Returns an error if reading or creating the config fails.
    pub fn load_or_default() -> anyhow::Result<Self> {
        let path = Self::default_path();

        if path.exists() {
            Self::load(&path)
        } else {
            let config = Self::default();
            config.save(&path)?;
            Ok(config)
        }
    }

    /// Parse the configured network key, if any
    ///
    /// # Errors
    ///
    /// Returns an error if the key is not 64 hex characters.
    pub fn network_key(&self) -> anyhow::Result<Option<EncryptionKey>> {
        self.node
            .network_key
            .as_deref()
            .map(|hex| {
                EncryptionKey::from_hex(hex)
                    .map_err(|e| anyhow::anyhow!("Invalid network key: {}", e))
            })
            .transpose()
    }

    /// Build the node configuration this file describes
    ///
    /// # Errors
    ///
    /// Returns an error if the network key is malformed.
    pub fn node_config(&self) -> anyhow::Result<NodeConfig> {
        let mut node = NodeConfig::new(self.node.listen_addr.clone())
            .with_bootstrap(self.node.bootstrap_nodes.iter().cloned());
        if let Some(root) = &self.node.storage_root {
            node = node.with_storage_root(root.clone());
        }
        if let Some(key) = self.network_key()? {
            node = node.with_encryption_key(key);
        }
        node.ack_timeout = Duration::from_millis(self.node.ack_timeout_ms);
        node.stream_timeout = Duration::from_millis(self.node.stream_timeout_ms);
        Ok(node)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        validate_listen_addr(&self.node.listen_addr)?;

        for node in &self.node.bootstrap_nodes {
            validate_host_port(node, "Bootstrap node")?;
        }

        self.network_key()?;

        if self.node.ack_timeout_ms == 0 || self.node.stream_timeout_ms == 0 {
            anyhow::bail!("Timeouts must be greater than zero");
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        Ok(())
    }
}

/// Validate a listen address; the host may be omitted (`:3000`) and port 0
/// asks the OS for one.
pub fn validate_listen_addr(addr: &str) -> anyhow::Result<()> {
    let Some((host, port)) = addr.rsplit_once(':') else {
        anyhow::bail!("Listen address '{}' missing port (expected [host]:port)", addr);
    };
    port.parse::<u16>()
        .map_err(|_| anyhow::anyhow!("Listen address '{}' has invalid port: {}", addr, port))?;
    if host.contains("..") || host.contains('/') || host.contains('\\') {
        anyhow::bail!("Listen address '{}' contains invalid characters", addr);
    }
    Ok(())
}

/// Validate host:port format
pub fn validate_host_port(addr: &str, name: &str) -> anyhow::Result<()> {
    let parts: Vec<&str> = addr.rsplitn(2, ':').collect();
    if parts.len() != 2 {
        anyhow::bail!(
            "{} '{}' missing port (expected format: host:port)",
            name,
            addr
        );
    }

    let port_str = parts[0];
    let host = parts[1];

    let port: u16 = port_str
        .parse()
        .map_err(|_| anyhow::anyhow!("{} '{}' has invalid port: {}", name, addr, port_str))?;

    if port == 0 {
        anyhow::bail!("{} '{}' has invalid port: 0", name, addr);
    }

    // ":port" dials localhost
    if host.contains("..") || host.contains('/') || host.contains('\\') {
        anyhow::bail!("{} '{}' contains invalid characters", name, addr);
    }

    Ok(())
}
