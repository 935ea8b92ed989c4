//! HOARD CLI
//!
//! Run a node, walk through a small in-process network, or mint a network key.

mod config;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use config::{Config, validate_host_port, validate_listen_addr};
use hoard_core::{FileServer, NodeConfig};
use hoard_crypto::{EncryptionKey, hash_key};
use hoard_transport::{PresharedKeyHandshake, TcpTransportOpts};
use tokio::io::AsyncReadExt;

/// HOARD - peer-to-peer content-addressed file store
#[derive(Parser)]
#[command(name = "hoard")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path (defaults to the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a node until Ctrl+C
    Node {
        /// Listen address, e.g. `:3000`
        #[arg(short, long)]
        listen: Option<String>,

        /// Peers to dial at startup (repeatable)
        #[arg(short, long)]
        bootstrap: Vec<String>,

        /// Storage root directory
        #[arg(short, long)]
        root: Option<PathBuf>,

        /// Hex-encoded network key
        #[arg(short, long)]
        key: Option<String>,
    },

    /// Store, fetch, and remove a file across three local nodes
    Demo {
        /// Comma-separated actions: write, read, remove
        #[arg(short, long, default_value = "write,read,remove")]
        actions: String,

        /// File key
        #[arg(short, long, default_value = "secret")]
        file: String,

        /// File content to write
        #[arg(long, default_value = "testing")]
        content: String,

        /// Directory holding the nodes' stores
        #[arg(short, long)]
        dir: Option<PathBuf>,

        /// Keep the stores after the demo finishes
        #[arg(long)]
        keep: bool,
    },

    /// Generate a new network key
    Keygen {
        /// Write the key to this file instead of only printing it
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

const DEMO_NODES: [&str; 3] = ["node1", "node2", "node3"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DemoAction {
    Write,
    Read,
    Remove,
}

fn parse_actions(actions: &str) -> anyhow::Result<Vec<DemoAction>> {
    actions
        .split(',')
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .map(|a| match a.to_lowercase().as_str() {
            "write" => Ok(DemoAction::Write),
            "read" => Ok(DemoAction::Read),
            "remove" => Ok(DemoAction::Remove),
            other => anyhow::bail!("Unknown action '{}' (expected write, read, remove)", other),
        })
        .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default()?,
    };
    config.validate()?;

    // RUST_LOG wins over the configured level
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(if cli.verbose {
            "debug"
        } else {
            config.logging.level.as_str()
        })
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Node {
            listen,
            bootstrap,
            root,
            key,
        } => {
            run_node(listen, bootstrap, root, key, &config).await?;
        }
        Commands::Demo {
            actions,
            file,
            content,
            dir,
            keep,
        } => {
            let actions = parse_actions(&actions)?;
            let dir = dir.unwrap_or_else(|| std::env::temp_dir().join("hoard-demo"));
            run_demo(&actions, &file, &content, &dir, &config).await?;
            if !keep {
                for name in DEMO_NODES {
                    let store = dir.join(name);
                    if store.exists() {
                        std::fs::remove_dir_all(&store)?;
                    }
                }
            }
        }
        Commands::Keygen { output } => {
            generate_key(output)?;
        }
    }

    Ok(())
}

/// Transport options for a node, authenticated with the network key when asked
fn transport_opts(key: Option<&EncryptionKey>, handshake: bool) -> TcpTransportOpts {
    let opts = TcpTransportOpts::default();
    match key {
        Some(key) if handshake => {
            opts.with_handshake(PresharedKeyHandshake::from_passphrase(&key.to_hex()))
        }
        _ => opts,
    }
}

/// Run a node until interrupted
async fn run_node(
    listen: Option<String>,
    bootstrap: Vec<String>,
    root: Option<PathBuf>,
    key: Option<String>,
    config: &Config,
) -> anyhow::Result<()> {
    let mut node_config = config.node_config()?;
    if let Some(listen) = listen {
        validate_listen_addr(&listen)?;
        node_config.listen_addr = listen;
    }
    for addr in &bootstrap {
        validate_host_port(addr, "Bootstrap node")?;
    }
    node_config.bootstrap_nodes.extend(bootstrap);
    if let Some(root) = root {
        node_config.storage_root = Some(root);
    }
    if let Some(hex) = key {
        node_config.encryption_key = Some(
            EncryptionKey::from_hex(&hex).map_err(|e| anyhow::anyhow!("Invalid key: {}", e))?,
        );
    }

    let opts = transport_opts(node_config.encryption_key.as_ref(), config.node.handshake);
    let storage_root = node_config.resolved_storage_root();
    let server = FileServer::with_transport_opts(node_config, opts)?;
    server.start().await?;

    println!("HOARD node listening on {}", server.listen_addr()?);
    println!("Storage root: {}", storage_root.display());
    println!("Press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    println!("\nShutting down...");

    let stats = server.stats();
    server.stop().await?;

    println!(
        "Peers: {}, sent: {} bytes, received: {} bytes",
        stats.peers, stats.bytes_sent, stats.bytes_received
    );
    Ok(())
}

async fn demo_node(
    name: &str,
    dir: &std::path::Path,
    key: &EncryptionKey,
    bootstrap: Vec<String>,
    config: &Config,
) -> anyhow::Result<FileServer> {
    let mut node_config = NodeConfig::new("127.0.0.1:0")
        .with_storage_root(dir.join(name))
        .with_encryption_key(key.clone())
        .with_bootstrap(bootstrap);
    node_config.ack_timeout = Duration::from_millis(config.node.ack_timeout_ms);
    node_config.stream_timeout = Duration::from_millis(config.node.stream_timeout_ms);

    let server = FileServer::with_transport_opts(node_config, transport_opts(Some(key), true))?;
    server.start().await?;
    println!("{} listening on {}", name, server.listen_addr()?);
    Ok(server)
}

/// Three nodes on loopback: the third bootstraps to the other two and runs
/// the requested actions against the network.
async fn run_demo(
    actions: &[DemoAction],
    file: &str,
    content: &str,
    dir: &std::path::Path,
    config: &Config,
) -> anyhow::Result<()> {
    let key = EncryptionKey::generate()?;

    let [n1, n2, n3] = DEMO_NODES;
    let first = demo_node(n1, dir, &key, Vec::new(), config).await?;
    let second = demo_node(n2, dir, &key, Vec::new(), config).await?;
    let bootstrap = vec![
        first.listen_addr()?.to_string(),
        second.listen_addr()?.to_string(),
    ];
    let third = demo_node(n3, dir, &key, bootstrap, config).await?;
    third.wait_for_peers(2, Duration::from_secs(5)).await?;

    let nodes = [(n1, &first), (n2, &second), (n3, &third)];
    let result = async {
        for action in actions {
            match action {
                DemoAction::Write => {
                    let size = third.store(file, content.as_bytes()).await?;
                    println!("node3 stored '{}' ({} bytes)", file, size);
                }
                DemoAction::Read => {
                    // force a network fetch
                    let local = hash_key(file);
                    if third.storage().has(&local).await {
                        third.storage().delete(&local).await?;
                        println!("node3 dropped its local copy of '{}'", file);
                    }
                    let (size, mut reader) = third.get(file).await?;
                    let mut fetched = String::with_capacity(size as usize);
                    reader.read_to_string(&mut fetched).await?;
                    println!("node3 fetched '{}': {}", file, fetched);
                }
                DemoAction::Remove => {
                    third.remove(file).await?;
                    println!("node3 removed '{}'", file);
                }
            }

            for (name, node) in &nodes {
                println!("  {}: has '{}' = {}", name, file, node.has(file).await);
            }
        }
        Ok::<_, anyhow::Error>(())
    }
    .await;

    for (name, node) in &nodes {
        if let Err(e) = node.stop().await {
            tracing::warn!(node = %name, error = %e, "failed to stop node");
        }
    }
    result
}

/// Generate a network key
fn generate_key(output: Option<PathBuf>) -> anyhow::Result<()> {
    let key = EncryptionKey::generate()?;
    let hex = key.to_hex();

    println!("Network key: {}", hex);

    if let Some(path) = output {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, format!("{hex}\n"))?;
        println!("Key saved to: {}", path.display());
        println!("\nShare it only with nodes that belong to this network.");
    }

    Ok(())
}
