//! End-to-end tests across hoard-core, hoard-store, hoard-crypto, and
//! hoard-transport.
//!
//! Every scenario runs real file servers over loopback TCP with on-disk
//! storage roots.

use hoard_core::{FileServer, NodeConfig};
use hoard_crypto::{EncryptionKey, IV_SIZE, hash_key};
use hoard_integration_tests::fixtures::{Mesh, TEST_NETWORK_KEY, read_all, wait_until};
use hoard_store::cas_path_transform;
use std::time::Duration;

// ============================================================================
// Fetching
// ============================================================================

/// A node that bootstraps to a peer fetches a file it never stored.
#[tokio::test]
async fn test_bootstrapped_node_fetches_file() {
    let mesh = Mesh::unlinked(1).await.unwrap();
    let a = mesh.node(0);
    a.store("secret", &b"testing"[..]).await.unwrap();

    let b_config = NodeConfig::new("127.0.0.1:0")
        .with_storage_root(mesh.root().join("late"))
        .with_encryption_key(EncryptionKey::new(TEST_NETWORK_KEY))
        .with_bootstrap([a.listen_addr().unwrap().to_string()]);
    let b = FileServer::new(b_config).unwrap();
    b.start().await.unwrap();
    b.wait_for_peers(1, Duration::from_secs(5)).await.unwrap();
    assert!(wait_until(|| async { a.peers().len() == 1 }).await);

    assert!(!b.has("secret").await);
    let (size, file) = b.get("secret").await.unwrap();
    assert_eq!(size, 7);
    assert_eq!(read_all(file).await, b"testing");

    // only the ciphertext and its IV crossed the wire
    assert_eq!(b.stats().bytes_received, 7 + IV_SIZE as u64);
    assert!(b.has("secret").await);

    b.stop().await.unwrap();
    mesh.shutdown().await.unwrap();
}

/// Fetched copies land at the content-addressed path, in plaintext.
#[tokio::test]
async fn test_fetched_copy_is_plaintext_at_cas_path() {
    let mesh = Mesh::unlinked(2).await.unwrap();
    mesh.node(0).store("report.pdf", &b"quarterly"[..]).await.unwrap();
    mesh.link(1, 0).await.unwrap();

    mesh.node(1).get("report.pdf").await.unwrap();

    let net_key = hash_key("report.pdf");
    let path = mesh
        .root()
        .join("node1")
        .join(cas_path_transform(&net_key).full_path());
    assert_eq!(path, mesh.node(1).storage().full_path(&net_key));
    assert_eq!(tokio::fs::read(&path).await.unwrap(), b"quarterly");

    mesh.shutdown().await.unwrap();
}

/// A file held locally is served without touching the network.
#[tokio::test]
async fn test_local_copy_served_without_network() {
    let mesh = Mesh::linked(2).await.unwrap();
    let a = mesh.node(0);

    a.store("local", &b"here"[..]).await.unwrap();
    let received = a.stats().bytes_received;
    let (size, file) = a.get("local").await.unwrap();
    assert_eq!(size, 4);
    assert_eq!(read_all(file).await, b"here");
    assert_eq!(a.stats().bytes_received, received);

    mesh.shutdown().await.unwrap();
}

/// Fetching a file nobody holds reports not found.
#[tokio::test]
async fn test_get_unknown_key_everywhere() {
    let mesh = Mesh::linked(3).await.unwrap();

    let err = mesh.node(2).get("ghost").await.unwrap_err();
    assert!(err.is_not_found());
    for node in mesh.nodes() {
        assert!(!node.has("ghost").await);
    }

    mesh.shutdown().await.unwrap();
}

// ============================================================================
// Replication
// ============================================================================

/// A store reaches every connected peer.
#[tokio::test]
async fn test_store_replicates_to_all_peers() {
    let mesh = Mesh::linked(3).await.unwrap();

    let written = mesh.node(0).store("shared", &b"everyone"[..]).await.unwrap();
    assert_eq!(written, 8);

    for node in &mesh.nodes()[1..] {
        assert!(wait_until(|| node.has("shared")).await);
        let (size, file) = node.storage().read(&hash_key("shared")).await.unwrap();
        assert_eq!(size, 8);
        assert_eq!(read_all(file).await, b"everyone");
    }
    assert!(mesh.node(0).stats().bytes_sent >= 2 * (8 + IV_SIZE as u64));

    mesh.shutdown().await.unwrap();
}

/// Replicating a multi-buffer object keeps it byte for byte.
#[tokio::test]
async fn test_large_object_replication() {
    let mesh = Mesh::linked(2).await.unwrap();
    let payload: Vec<u8> = (0..300_000u32).map(|i| (i * 31 % 251) as u8).collect();

    mesh.node(0).store("blob", payload.as_slice()).await.unwrap();
    let b = mesh.node(1);
    assert!(wait_until(|| b.has("blob")).await);

    let (size, file) = b.get("blob").await.unwrap();
    assert_eq!(size, payload.len() as u64);
    assert_eq!(read_all(file).await, payload);

    mesh.shutdown().await.unwrap();
}

/// Storing again replaces the replicas too.
#[tokio::test]
async fn test_overwrite_replaces_replicas() {
    let mesh = Mesh::linked(2).await.unwrap();
    let (a, b) = (mesh.node(0), mesh.node(1));

    a.store("draft", &b"first version"[..]).await.unwrap();
    assert!(wait_until(|| b.has("draft")).await);
    a.store("draft", &b"second"[..]).await.unwrap();

    let replaced = wait_until(|| async {
        match b.storage().read(&hash_key("draft")).await {
            Ok((_, file)) => read_all(file).await == b"second",
            Err(_) => false,
        }
    })
    .await;
    assert!(replaced);

    mesh.shutdown().await.unwrap();
}

// ============================================================================
// Removal
// ============================================================================

/// Removing on one node of a three-node mesh clears every copy.
#[tokio::test]
async fn test_remove_across_three_nodes() {
    let mesh = Mesh::linked(3).await.unwrap();
    mesh.node(0).store("old-logs", &b"noise"[..]).await.unwrap();
    for node in mesh.nodes() {
        assert!(wait_until(|| node.has("old-logs")).await);
    }

    mesh.node(2).remove("old-logs").await.unwrap();

    for node in mesh.nodes() {
        assert!(!node.has("old-logs").await);
    }
    assert!(mesh.node(1).get("old-logs").await.unwrap_err().is_not_found());

    mesh.shutdown().await.unwrap();
}

/// Removing a key nobody holds still succeeds.
#[tokio::test]
async fn test_remove_missing_key() {
    let mesh = Mesh::linked(3).await.unwrap();
    mesh.node(1).remove("never-stored").await.unwrap();
    mesh.shutdown().await.unwrap();
}
