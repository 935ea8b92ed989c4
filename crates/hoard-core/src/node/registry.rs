//! Registry of connected peers, keyed by remote address.

use hoard_transport::Peer;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Mutex-guarded map of live peers.
///
/// Entries are inserted when a connection passes the handshake and removed
/// when its read loop ends. They are never mutated in place.
#[derive(Default)]
pub struct PeerRegistry {
    peers: Mutex<HashMap<String, Arc<dyn Peer>>>,
}

impl PeerRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<dyn Peer>>> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a peer under its remote address, replacing any previous entry
    pub fn insert(&self, peer: Arc<dyn Peer>) {
        let addr = peer.remote_addr().to_string();
        if self.lock().insert(addr.clone(), peer).is_some() {
            tracing::debug!(remote = %addr, "replaced existing peer entry");
        }
    }

    /// Look up a peer
    #[must_use]
    pub fn get(&self, addr: &str) -> Option<Arc<dyn Peer>> {
        self.lock().get(addr).cloned()
    }

    /// Remove a peer
    pub fn remove(&self, addr: &str) -> Option<Arc<dyn Peer>> {
        self.lock().remove(addr)
    }

    /// All peers at this instant
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<dyn Peer>> {
        self.lock().values().cloned().collect()
    }

    /// Sorted remote addresses
    #[must_use]
    pub fn addrs(&self) -> Vec<String> {
        let mut addrs: Vec<String> = self.lock().keys().cloned().collect();
        addrs.sort();
        addrs
    }

    /// Remove and return every peer
    pub fn drain(&self) -> Vec<Arc<dyn Peer>> {
        self.lock().drain().map(|(_, peer)| peer).collect()
    }

    /// Number of peers
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Check if there are no peers
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl std::fmt::Debug for PeerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerRegistry")
            .field("peers", &self.addrs())
            .finish()
    }
}
