//! Completion tracking for operations that wait on peers.
//!
//! An operation registers the set of peers it expects an acknowledgement
//! from; the dispatch loop resolves entries as `Ack` messages arrive, and the
//! operation waits until its set is empty or its deadline passes. Entries are
//! keyed by [`OperationId`], so concurrent operations never see each other's
//! acknowledgements.

use crate::message::OperationId;
use dashmap::DashMap;
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Pending acknowledgements per operation.
#[derive(Debug, Default)]
pub struct CompletionTracker {
    pending: DashMap<OperationId, HashSet<String>>,
    notify: Notify,
}

impl CompletionTracker {
    /// Create an empty tracker
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Expect one acknowledgement from each of `peers` for `op`.
    pub fn register<I>(&self, op: OperationId, peers: I)
    where
        I: IntoIterator<Item = String>,
    {
        self.pending.insert(op, peers.into_iter().collect());
    }

    /// Record `peer`'s acknowledgement of `op`.
    ///
    /// Returns false if the operation is unknown or was not waiting on `peer`.
    pub fn resolve(&self, op: OperationId, peer: &str) -> bool {
        let removed = match self.pending.get_mut(&op) {
            Some(mut waiting) => waiting.remove(peer),
            None => false,
        };
        if removed {
            self.notify.notify_waiters();
        }
        removed
    }

    /// Peers that still owe an acknowledgement for `op`
    #[must_use]
    pub fn outstanding(&self, op: OperationId) -> Vec<String> {
        self.pending
            .get(&op)
            .map(|waiting| waiting.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Stop tracking `op`
    pub fn forget(&self, op: OperationId) {
        self.pending.remove(&op);
    }

    /// Number of operations being tracked
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Check if no operation is being tracked
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn is_complete(&self, op: OperationId) -> bool {
        self.pending.get(&op).is_none_or(|waiting| waiting.is_empty())
    }

    /// Wait until every peer acknowledged `op`, or `timeout` elapses.
    ///
    /// The operation is forgotten either way. On timeout the peers that never
    /// answered are returned.
    pub async fn wait(&self, op: OperationId, timeout: Duration) -> Result<(), Vec<String>> {
        let waited = self.wait_retaining(op, timeout).await;
        self.forget(op);
        waited
    }

    /// Like [`CompletionTracker::wait`], but a timed out operation stays
    /// registered, so acknowledgements that arrive later are still recorded
    /// for a follow-up wait.
    pub async fn wait_retaining(
        &self,
        op: OperationId,
        timeout: Duration,
    ) -> Result<(), Vec<String>> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // register interest before checking, so a resolve in between is not lost
            notified.as_mut().enable();

            if self.is_complete(op) {
                self.pending.remove(&op);
                return Ok(());
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(self.outstanding(op));
            }
        }
    }
}
