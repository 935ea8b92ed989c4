//! Control message handling for file servers
//!
//! # Message Flow
//!
//! ```text
//! rpc channel → dispatch_loop → decode → Ack ──────────→ CompletionTracker
//!                                   └──→ work queue → handler_loop → handle_*
//! ```
//!
//! Acknowledgements are resolved inline so they never wait behind a handler
//! that is itself blocked on a peer's stream. Every other message is handled
//! by a single worker, one at a time, in arrival order.

use crate::message::{Message, OperationId};
use crate::node::error::{NodeError, Result};
use crate::node::operations::Awaiting;
use crate::node::server::FileServer;
use hoard_crypto::{IV_SIZE, encrypt_stream};
use hoard_transport::{Peer, Rpc, Transport};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

impl FileServer {
    /// Dispatch loop - drains the transport's RPC channel until quit.
    pub(crate) async fn dispatch_loop(
        self,
        mut rpcs: mpsc::Receiver<Rpc>,
        work: mpsc::Sender<(String, Message)>,
    ) {
        let mut quit = self.inner.quit.subscribe();
        loop {
            if *quit.borrow() {
                break;
            }
            tokio::select! {
                _ = quit.changed() => break,
                rpc = rpcs.recv() => match rpc {
                    Some(rpc) => self.dispatch(rpc, &work).await,
                    None => break,
                },
            }
        }

        if let Err(e) = self.inner.transport.close().await {
            tracing::warn!(error = %e, "error closing transport");
        }
        tracing::debug!("dispatch loop stopped");
    }

    async fn dispatch(&self, rpc: Rpc, work: &mpsc::Sender<(String, Message)>) {
        let msg = match Message::decode(&rpc.payload) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(from = %rpc.from, error = %e, "dropping undecodable message");
                return;
            }
        };
        tracing::trace!(from = %rpc.from, kind = msg.kind(), op = msg.op(), "received message");

        match msg {
            Message::Ack { op } => self.handle_ack(&rpc.from, op),
            other => {
                if work.send((rpc.from, other)).await.is_err() {
                    tracing::debug!("handler worker gone, dropping message");
                }
            }
        }
    }

    /// Handler worker - runs one handler at a time.
    pub(crate) async fn handler_loop(self, mut work: mpsc::Receiver<(String, Message)>) {
        let mut quit = self.inner.quit.subscribe();
        loop {
            if *quit.borrow() {
                break;
            }
            tokio::select! {
                _ = quit.changed() => break,
                next = work.recv() => match next {
                    Some((from, msg)) => {
                        let kind = msg.kind();
                        match self.handle_message(&from, msg).await {
                            Ok(()) => {}
                            Err(e) if e.is_not_found() => {
                                tracing::debug!(from = %from, kind, error = %e, "nothing to serve");
                            }
                            Err(e) => {
                                tracing::warn!(from = %from, kind, error = %e, "handler failed");
                            }
                        }
                    }
                    None => break,
                },
            }
        }
        tracing::debug!("handler loop stopped");
    }

    async fn handle_message(&self, from: &str, msg: Message) -> Result<()> {
        match msg {
            Message::StoreFile { op, key, size } => {
                self.handle_store_file(from, op, &key, size).await
            }
            Message::GetFile { op, key } => self.handle_get_file(from, op, &key).await,
            Message::RemoveFile { op, key } => self.handle_remove_file(from, op, &key).await,
            Message::Ack { op } => {
                self.handle_ack(from, op);
                Ok(())
            }
        }
    }

    fn registered(&self, from: &str) -> Result<Arc<dyn Peer>> {
        self.inner
            .peers
            .get(from)
            .ok_or_else(|| NodeError::PeerNotRegistered(from.to_string()))
    }

    /// Peer is about to stream `size` bytes of ciphertext for `key`.
    async fn handle_store_file(
        &self,
        from: &str,
        op: OperationId,
        key: &str,
        size: u64,
    ) -> Result<()> {
        let peer = self.registered(from)?;
        // the ack invites the stream, so no one else may be accepting it
        let mut slot = peer.reserve_streams().await;
        peer.send(&Message::Ack { op }.encode()?).await?;

        let stream = self
            .accept_stream(peer.as_ref(), &mut slot, Awaiting::Replica)
            .await?;
        drop(slot);
        let written = self.persist_stream(peer.as_ref(), stream, key, size).await?;
        tracing::info!(from = %from, op, key = %key, written, "stored replica");
        Ok(())
    }

    /// Stream `key` back to the peer, or a zero length if it is not held.
    async fn handle_get_file(&self, from: &str, op: OperationId, key: &str) -> Result<()> {
        let peer = self.registered(from)?;

        let (size, mut file) = match self.inner.store.read(key).await {
            Ok(found) => found,
            Err(e) => {
                // the requester is waiting on a stream either way
                let mut stream = peer.open_stream().await?;
                stream.write_u64_le(0).await?;
                stream.flush().await?;
                return Err(e.into());
            }
        };

        let mut stream = peer.open_stream().await?;
        let served = async {
            stream.write_u64_le(size + IV_SIZE as u64).await?;
            let sent = encrypt_stream(&self.inner.key, &mut file, &mut stream).await?;
            stream.flush().await?;
            Ok::<_, NodeError>(sent)
        }
        .await;

        match served {
            Ok(sent) => {
                self.inner.bytes_sent.fetch_add(sent, Ordering::Relaxed);
                tracing::info!(from = %from, op, key = %key, sent, "served file");
                Ok(())
            }
            Err(e) => {
                // the requester can no longer tell where the stream ends
                drop(stream);
                self.drop_peer(peer.as_ref()).await;
                Err(e)
            }
        }
    }

    async fn handle_remove_file(&self, from: &str, op: OperationId, key: &str) -> Result<()> {
        let peer = self.registered(from)?;

        match self.inner.store.delete(key).await {
            Ok(()) => tracing::info!(from = %from, op, key = %key, "deleted on request"),
            Err(e) if e.is_not_found() => {
                tracing::debug!(from = %from, op, key = %key, "nothing to delete");
            }
            Err(e) => return Err(e.into()),
        }

        peer.send(&Message::Ack { op }.encode()?).await?;
        Ok(())
    }

    fn handle_ack(&self, from: &str, op: OperationId) {
        if !self.inner.tracker.resolve(op, from) {
            tracing::debug!(from = %from, op, "ack for no pending operation");
        }
    }
}
