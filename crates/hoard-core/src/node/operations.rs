//! Store, get, and remove across the network.
//!
//! Every caller key is translated once into its network key with
//! [`hash_key`]; the local store, control messages, and peers' stores all use
//! that name.

use crate::message::{Message, OperationId};
use crate::node::error::{NodeError, Result};
use crate::node::server::FileServer;
use crate::reader::{ExactReader, TeeReader};
use hoard_crypto::stream::encrypt_to_vec;
use hoard_crypto::{IV_SIZE, hash_key};
use hoard_transport::{InboundStream, Peer, StreamSlot};
use std::borrow::Cow;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinSet;

/// What an inbound stream is expected to carry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Awaiting {
    /// Answer to our `GetFile`; the peer always sends one
    Response,
    /// Replica we invited with an ack; the storer may have given up on us
    Replica,
}

// ═══════════════════════════════════════════════════════════════════════════
// File Operations
// ═══════════════════════════════════════════════════════════════════════════

impl FileServer {
    /// Store `reader` under `key` and replicate it to every connected peer.
    ///
    /// The local write completes first and does not depend on peers. Each
    /// peer gets the encrypted content once it acknowledged the announcement.
    /// Peers that do not answer within the ack timeout are logged and served
    /// in the background if their ack still arrives within the stream
    /// timeout; peers that fail are logged and skipped.
    ///
    /// Returns the number of bytes written locally.
    ///
    /// # Errors
    /// Returns `NodeError` if the local write fails.
    pub async fn store<R>(&self, key: &str, reader: R) -> Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        let net_key = hash_key(key);
        let mut tee = TeeReader::new(reader);
        let size = self.inner.store.write(&net_key, &mut tee).await?;
        tracing::info!(key, net_key = %net_key, size, "stored locally");

        let peers = self.inner.peers.snapshot();
        if peers.is_empty() {
            return Ok(size);
        }

        let ciphertext: Arc<[u8]> = encrypt_to_vec(&self.inner.key, &tee.into_captured())
            .await?
            .into();

        let op = self.next_op();
        let announce = Message::StoreFile {
            op,
            key: net_key,
            size: size + IV_SIZE as u64,
        }
        .encode()?;

        self.inner
            .tracker
            .register(op, peers.iter().map(|p| p.remote_addr().to_string()));
        let reached = self.broadcast(&announce, &peers).await;
        self.forgive_unreached(op, &peers, &reached);

        let (ready, late): (Vec<Arc<dyn Peer>>, Vec<Arc<dyn Peer>>) = match self
            .inner
            .tracker
            .wait_retaining(op, self.inner.config.ack_timeout)
            .await
        {
            Ok(()) => (reached, Vec::new()),
            Err(missing) => {
                tracing::warn!(op, ?missing, "peers did not acknowledge store in time");
                reached
                    .into_iter()
                    .partition(|p| !missing.iter().any(|m| m == p.remote_addr()))
            }
        };

        if late.is_empty() {
            self.inner.tracker.forget(op);
        } else {
            self.replicate_late(op, late, Arc::clone(&ciphertext));
        }
        self.replicate(op, ready, &ciphertext).await;

        Ok(size)
    }

    /// Open the file stored under `key`, fetching it from peers if it is not
    /// held locally.
    ///
    /// Returns the file size and a handle positioned at its start.
    ///
    /// # Errors
    /// Returns `NodeError::NotFound` if neither this node nor any peer holds
    /// the key.
    pub async fn get(&self, key: &str) -> Result<(u64, File)> {
        let net_key = hash_key(key);
        if self.inner.store.has(&net_key).await {
            tracing::debug!(key, "serving from local store");
            return Ok(self.inner.store.read(&net_key).await?);
        }

        let _fetching = self.inner.fetch_lock.lock().await;
        // a concurrent get may have fetched it meanwhile
        if self.inner.store.has(&net_key).await {
            return Ok(self.inner.store.read(&net_key).await?);
        }

        let peers = self.inner.peers.snapshot();
        if peers.is_empty() {
            return Err(NodeError::NotFound(key.to_string()));
        }
        tracing::info!(key, peers = peers.len(), "not held locally, fetching from network");

        let op = self.next_op();
        let request = Message::GetFile {
            op,
            key: net_key.clone(),
        }
        .encode()?;

        let mut answers = JoinSet::new();
        for peer in peers {
            // reserved before asking, so a replica receiver cannot take the answer
            let slot = peer.reserve_streams().await;
            if let Err(e) = peer.send(&request).await {
                tracing::warn!(remote = peer.remote_addr(), op, error = %e, "fetch request failed");
                continue;
            }
            let server = self.clone();
            answers.spawn(async move {
                let answer = server.await_answer(peer.as_ref(), slot).await;
                (peer, answer)
            });
        }

        // answers are drained as they arrive; a slow peer does not hold up the rest
        while let Some(joined) = answers.join_next().await {
            let (peer, answer) = match joined {
                Ok(done) => done,
                Err(e) => {
                    tracing::warn!(op, error = %e, "fetch task failed");
                    continue;
                }
            };
            let remote = peer.remote_addr();
            match answer {
                Ok(Some((stream, size))) => {
                    match self.persist_stream(peer.as_ref(), stream, &net_key, size).await {
                        Ok(written) => tracing::info!(remote, op, written, "fetched from peer"),
                        Err(e) => tracing::warn!(remote, op, error = %e, "fetch failed"),
                    }
                }
                Ok(None) => tracing::debug!(remote, op, "peer does not hold key"),
                Err(e) => tracing::warn!(remote, op, error = %e, "fetch failed"),
            }
        }

        match self.inner.store.read(&net_key).await {
            Ok(found) => Ok(found),
            Err(e) if e.is_not_found() => Err(NodeError::NotFound(key.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete `key` here and on every connected peer.
    ///
    /// A missing local copy is not an error.
    ///
    /// # Errors
    /// Returns `NodeError::Timeout` if some peer did not confirm its deletion
    /// within the ack timeout, or `NodeError::Transport` if the request could
    /// not be delivered to some peer.
    pub async fn remove(&self, key: &str) -> Result<()> {
        let net_key = hash_key(key);
        match self.inner.store.delete(&net_key).await {
            Ok(()) => tracing::info!(key, "deleted local copy"),
            Err(e) if e.is_not_found() => tracing::debug!(key, "no local copy to delete"),
            Err(e) => return Err(e.into()),
        }

        let peers = self.inner.peers.snapshot();
        if peers.is_empty() {
            return Ok(());
        }

        let op = self.next_op();
        let request = Message::RemoveFile { op, key: net_key }.encode()?;
        self.inner
            .tracker
            .register(op, peers.iter().map(|p| p.remote_addr().to_string()));
        let reached = self.broadcast(&request, &peers).await;
        let unreached = self.forgive_unreached(op, &peers, &reached);

        match self.inner.tracker.wait(op, self.inner.config.ack_timeout).await {
            Ok(()) if unreached.is_empty() => Ok(()),
            Ok(()) => Err(NodeError::Transport(Cow::Owned(format!(
                "removal not delivered to {}",
                unreached.join(", ")
            )))),
            Err(missing) => Err(NodeError::Timeout(Cow::Owned(format!(
                "removal not acknowledged by {}",
                missing.join(", ")
            )))),
        }
    }

    /// Check if `key` is held locally
    pub async fn has(&self, key: &str) -> bool {
        self.inner.store.has(&hash_key(key)).await
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Peer Helpers
// ═══════════════════════════════════════════════════════════════════════════

impl FileServer {
    /// Send `payload` to each of `peers`; returns the ones it reached.
    async fn broadcast(&self, payload: &[u8], peers: &[Arc<dyn Peer>]) -> Vec<Arc<dyn Peer>> {
        let mut reached = Vec::with_capacity(peers.len());
        for peer in peers {
            match peer.send(payload).await {
                Ok(()) => reached.push(Arc::clone(peer)),
                Err(e) => tracing::warn!(remote = peer.remote_addr(), error = %e, "broadcast failed"),
            }
        }
        reached
    }

    /// Stop waiting on peers a broadcast never reached; returns their
    /// addresses.
    fn forgive_unreached(
        &self,
        op: OperationId,
        peers: &[Arc<dyn Peer>],
        reached: &[Arc<dyn Peer>],
    ) -> Vec<String> {
        let mut unreached = Vec::new();
        for peer in peers {
            let addr = peer.remote_addr();
            if !reached.iter().any(|r| r.remote_addr() == addr) {
                self.inner.tracker.resolve(op, addr);
                unreached.push(addr.to_string());
            }
        }
        unreached
    }

    /// Stream `ciphertext` to each of `peers` concurrently.
    async fn replicate(&self, op: OperationId, peers: Vec<Arc<dyn Peer>>, ciphertext: &Arc<[u8]>) {
        let mut transfers = JoinSet::new();
        for peer in peers {
            let data = Arc::clone(ciphertext);
            transfers.spawn(async move {
                let mut stream = peer.open_stream().await?;
                stream.write_all(&data).await?;
                stream.flush().await?;
                Ok::<_, NodeError>((peer.remote_addr().to_string(), stream.bytes_written()))
            });
        }

        while let Some(joined) = transfers.join_next().await {
            match joined {
                Ok(Ok((remote, sent))) => {
                    self.inner.bytes_sent.fetch_add(sent, Ordering::Relaxed);
                    tracing::debug!(remote = %remote, op, sent, "replicated");
                }
                Ok(Err(e)) => tracing::warn!(op, error = %e, "replication to peer failed"),
                Err(e) => tracing::warn!(op, error = %e, "replication task failed"),
            }
        }
    }

    /// Keep listening for acknowledgements that missed the ack timeout, for
    /// up to the stream timeout, and replicate to those peers once they
    /// arrive. A receiver that acked late is waiting for this stream.
    fn replicate_late(&self, op: OperationId, late: Vec<Arc<dyn Peer>>, ciphertext: Arc<[u8]>) {
        let server = self.clone();
        tokio::spawn(async move {
            let missing = server
                .inner
                .tracker
                .wait(op, server.inner.config.stream_timeout)
                .await
                .err()
                .unwrap_or_default();
            if !missing.is_empty() {
                tracing::warn!(op, ?missing, "giving up on unacknowledged store");
            }

            let acked: Vec<Arc<dyn Peer>> = late
                .into_iter()
                .filter(|p| !missing.iter().any(|m| m == p.remote_addr()))
                .collect();
            if !acked.is_empty() {
                tracing::info!(op, peers = acked.len(), "replicating after late acknowledgement");
                server.replicate(op, acked, &ciphertext).await;
            }
        });
    }

    /// Wait for `peer`'s answer to a `GetFile` on the reserved `slot`.
    ///
    /// Returns the stream and its announced size, or `None` if the peer
    /// announced a zero length (does not hold it).
    async fn await_answer(
        &self,
        peer: &dyn Peer,
        mut slot: StreamSlot,
    ) -> Result<Option<(InboundStream, u64)>> {
        let mut stream = self.accept_stream(peer, &mut slot, Awaiting::Response).await?;
        drop(slot);

        let size = match stream.read_u64_le().await {
            Ok(size) => size,
            Err(e) => {
                drop(stream);
                self.drop_peer(peer).await;
                return Err(e.into());
            }
        };
        if size == 0 {
            stream.finish();
            return Ok(None);
        }
        Ok(Some((stream, size)))
    }

    /// Wait for `peer`'s next raw stream on a reserved slot, bounded by the
    /// stream timeout.
    ///
    /// A peer that owes an answer and misses the deadline is disconnected: its
    /// late stream would otherwise be taken by whoever accepts next. An
    /// invited replica may never begin because the storer gave up waiting for
    /// our ack; no stream started, so the connection is still framed and the
    /// peer is kept.
    pub(crate) async fn accept_stream(
        &self,
        peer: &dyn Peer,
        slot: &mut StreamSlot,
        awaiting: Awaiting,
    ) -> Result<InboundStream> {
        let limit = self.inner.config.stream_timeout;
        match tokio::time::timeout(limit, slot.accept()).await {
            Ok(stream) => Ok(stream?),
            Err(_) => {
                match awaiting {
                    Awaiting::Response => {
                        tracing::warn!(
                            remote = peer.remote_addr(),
                            timeout = ?limit,
                            "no answer stream, disconnecting"
                        );
                        self.drop_peer(peer).await;
                    }
                    Awaiting::Replica => {
                        tracing::warn!(
                            remote = peer.remote_addr(),
                            timeout = ?limit,
                            "invited replica never began"
                        );
                    }
                }
                Err(NodeError::timeout("waiting for peer stream"))
            }
        }
    }

    /// Persist exactly `size` bytes of ciphertext from `stream` under `key`,
    /// then hand the connection back to its read loop.
    pub(crate) async fn persist_stream(
        &self,
        peer: &dyn Peer,
        mut stream: InboundStream,
        key: &str,
        size: u64,
    ) -> Result<u64> {
        let written = {
            let mut body = ExactReader::new(&mut stream, size);
            self.inner
                .store
                .write_decrypted(key, &self.inner.key, &mut body)
                .await
        };

        match written {
            Ok(written) => {
                stream.finish();
                self.inner.bytes_received.fetch_add(size, Ordering::Relaxed);
                Ok(written)
            }
            Err(e) => {
                // unknown amount left on the wire
                drop(stream);
                self.drop_peer(peer).await;
                Err(e.into())
            }
        }
    }

    pub(crate) async fn drop_peer(&self, peer: &dyn Peer) {
        self.inner.peers.remove(peer.remote_addr());
        if let Err(e) = peer.close().await {
            tracing::debug!(remote = peer.remote_addr(), error = %e, "error closing peer");
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::node::{FileServer, NodeConfig, NodeError};
    use hoard_crypto::{EncryptionKey, hash_key};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    const NETWORK_KEY: [u8; 32] = [0x42; 32];

    async fn started(dir: &TempDir, name: &str) -> FileServer {
        let config = NodeConfig::default()
            .with_storage_root(dir.path().join(name))
            .with_encryption_key(EncryptionKey::new(NETWORK_KEY));
        let server = FileServer::new(config).unwrap();
        server.start().await.unwrap();
        server
    }

    async fn link(from: &FileServer, to: &FileServer) {
        let expected = to.peers().len() + 1;
        from.connect(&to.listen_addr().unwrap().to_string())
            .await
            .unwrap();
        to.wait_for_peers(expected, Duration::from_secs(5))
            .await
            .unwrap();
    }

    async fn wait_until_held(server: &FileServer, key: &str) {
        for _ in 0..500 {
            if server.has(key).await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{key} never arrived");
    }

    async fn read_all(mut file: tokio::fs::File) -> Vec<u8> {
        let mut out = Vec::new();
        file.read_to_end(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_store_and_get_without_peers() {
        let dir = TempDir::new().unwrap();
        let server = started(&dir, "solo").await;

        let n = server.store("notes", &b"milk, eggs"[..]).await.unwrap();
        assert_eq!(n, 10);
        assert!(server.has("notes").await);
        assert!(server.storage().has(&hash_key("notes")).await);

        let (size, file) = server.get("notes").await.unwrap();
        assert_eq!(size, 10);
        assert_eq!(read_all(file).await, b"milk, eggs");

        assert!(matches!(
            server.get("missing").await,
            Err(NodeError::NotFound(_))
        ));
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_get_fetches_from_peer() {
        let dir = TempDir::new().unwrap();
        let a = started(&dir, "a").await;
        let b = started(&dir, "b").await;

        a.store("secret", &b"testing"[..]).await.unwrap();
        link(&b, &a).await;
        assert!(!b.has("secret").await);

        let (size, file) = b.get("secret").await.unwrap();
        assert_eq!(size, 7);
        assert_eq!(read_all(file).await, b"testing");
        assert!(b.has("secret").await);
        assert_eq!(b.stats().bytes_received, 7 + 16);

        b.stop().await.unwrap();
        a.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_get_miss_everywhere() {
        let dir = TempDir::new().unwrap();
        let a = started(&dir, "a").await;
        let b = started(&dir, "b").await;
        a.store("later", &b"x"[..]).await.unwrap();
        link(&b, &a).await;

        let err = b.get("nobody-has-this").await.unwrap_err();
        assert!(err.is_not_found());
        assert!(!b.has("nobody-has-this").await);

        // the zero-length answer leaves the connection usable
        let (size, _) = b.get("later").await.unwrap();
        assert_eq!(size, 1);

        b.stop().await.unwrap();
        a.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_store_replicates_to_peer() {
        let dir = TempDir::new().unwrap();
        let a = started(&dir, "a").await;
        let b = started(&dir, "b").await;
        link(&a, &b).await;

        a.store("photo", &b"\x89PNG not really"[..]).await.unwrap();
        wait_until_held(&b, "photo").await;

        let (_, file) = b.storage().read(&hash_key("photo")).await.unwrap();
        assert_eq!(read_all(file).await, b"\x89PNG not really");

        b.stop().await.unwrap();
        a.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_propagates() {
        let dir = TempDir::new().unwrap();
        let a = started(&dir, "a").await;
        let b = started(&dir, "b").await;
        link(&a, &b).await;

        a.store("doomed", &b"bye"[..]).await.unwrap();
        wait_until_held(&b, "doomed").await;

        a.remove("doomed").await.unwrap();
        assert!(!a.has("doomed").await);
        assert!(!b.has("doomed").await);

        // removing again is fine
        a.remove("doomed").await.unwrap();

        b.stop().await.unwrap();
        a.stop().await.unwrap();
    }
}
