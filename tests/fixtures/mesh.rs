//! Loopback mesh fixture for integration testing
//!
//! Starts a set of file servers on `127.0.0.1:0`, each with its own storage
//! root under one temporary directory, all sharing [`TEST_NETWORK_KEY`].
//!
//! # Example
//!
//! ```no_run
//! use hoard_integration_tests::fixtures::Mesh;
//!
//! #[tokio::test]
//! async fn test_replication() {
//!     let mesh = Mesh::linked(3).await.unwrap();
//!     mesh.node(0).store("k", &b"v"[..]).await.unwrap();
//!     // ... assert on mesh.node(1), mesh.node(2) ...
//!     mesh.shutdown().await.unwrap();
//! }
//! ```

use hoard_core::{FileServer, NodeConfig, NodeError};
use hoard_crypto::EncryptionKey;
use hoard_transport::TcpTransportOpts;
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::AsyncReadExt;

/// Network key shared by every mesh node
pub const TEST_NETWORK_KEY: [u8; 32] = [0x5A; 32];

/// How long fixtures wait for connections to settle
const LINK_TIMEOUT: Duration = Duration::from_secs(5);

/// A set of running file servers
pub struct Mesh {
    nodes: Vec<FileServer>,
    dir: TempDir,
}

impl Mesh {
    /// Start `size` nodes that are not connected to each other.
    ///
    /// # Errors
    ///
    /// Returns `NodeError` if a node cannot be created or bound.
    pub async fn unlinked(size: usize) -> Result<Self, NodeError> {
        Self::start_with(size, |_| TcpTransportOpts::default(), |_, config| config).await
    }

    /// Start `size` nodes and connect every pair.
    ///
    /// # Errors
    ///
    /// Returns `NodeError` if a node cannot start or a link does not settle.
    pub async fn linked(size: usize) -> Result<Self, NodeError> {
        let mesh = Self::unlinked(size).await?;
        mesh.link_all().await?;
        Ok(mesh)
    }

    /// Start `size` unlinked nodes with per-node transport options and
    /// configuration tweaks.
    ///
    /// # Errors
    ///
    /// Returns `NodeError` if a node cannot be created or bound.
    pub async fn start_with<O, C>(size: usize, opts: O, configure: C) -> Result<Self, NodeError>
    where
        O: Fn(usize) -> TcpTransportOpts,
        C: Fn(usize, NodeConfig) -> NodeConfig,
    {
        let dir = TempDir::new()?;
        let mut nodes = Vec::with_capacity(size);
        for i in 0..size {
            let config = NodeConfig::new("127.0.0.1:0")
                .with_storage_root(dir.path().join(format!("node{i}")))
                .with_encryption_key(EncryptionKey::new(TEST_NETWORK_KEY));
            let server = FileServer::with_transport_opts(configure(i, config), opts(i))?;
            server.start().await?;
            nodes.push(server);
        }
        Ok(Self { nodes, dir })
    }

    /// Node `i`
    ///
    /// # Panics
    ///
    /// Panics if `i` is out of range.
    pub fn node(&self, i: usize) -> &FileServer {
        &self.nodes[i]
    }

    /// All nodes
    pub fn nodes(&self) -> &[FileServer] {
        &self.nodes
    }

    /// Directory holding every node's storage root
    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Dial node `to` from node `from` and wait until both sides see the link.
    ///
    /// # Errors
    ///
    /// Returns `NodeError` if the dial fails or the link does not settle.
    pub async fn link(&self, from: usize, to: usize) -> Result<(), NodeError> {
        let (a, b) = (&self.nodes[from], &self.nodes[to]);
        let expected_a = a.peers().len() + 1;
        let expected_b = b.peers().len() + 1;
        a.connect(&b.listen_addr()?.to_string()).await?;
        a.wait_for_peers(expected_a, LINK_TIMEOUT).await?;
        b.wait_for_peers(expected_b, LINK_TIMEOUT).await
    }

    /// Connect every pair of nodes once.
    ///
    /// # Errors
    ///
    /// See [`Mesh::link`].
    pub async fn link_all(&self) -> Result<(), NodeError> {
        for from in 1..self.nodes.len() {
            for to in 0..from {
                self.link(from, to).await?;
            }
        }
        Ok(())
    }

    /// Stop every node still running. The storage roots are removed when the mesh drops.
    ///
    /// # Errors
    ///
    /// Returns the first error a node reported while stopping.
    pub async fn shutdown(self) -> Result<(), NodeError> {
        let mut first_err = None;
        for node in self.nodes.iter().filter(|n| n.is_running()) {
            if let Err(e) = node.stop().await {
                tracing::warn!(error = %e, "failed to stop node");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

/// Poll `check` until it holds, for up to five seconds.
pub async fn wait_until<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Read an opened object to the end.
///
/// # Panics
///
/// Panics if the read fails.
pub async fn read_all(mut file: tokio::fs::File) -> Vec<u8> {
    let mut out = Vec::new();
    file.read_to_end(&mut out).await.expect("read stored object");
    out
}
