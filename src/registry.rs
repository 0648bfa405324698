//! Concurrent peer registry
//!
//! Maps node identity to the active [`Peer`] for that connection. Iteration
//! for fan-out takes a snapshot so per-peer writes never hold the map lock.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::identity::NodeId;
use crate::peer::Peer;

/// Registry of currently connected peers, keyed by node id.
#[derive(Default)]
pub struct Registry {
    peers: RwLock<HashMap<NodeId, Arc<Peer>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a peer. Fails (returning the peer back) when the identity is
    /// already registered, so redundant mesh edges are rejected.
    pub async fn insert(&self, id: NodeId, peer: Arc<Peer>) -> Result<(), Arc<Peer>> {
        let mut peers = self.peers.write().await;
        if peers.contains_key(&id) {
            return Err(peer);
        }
        peers.insert(id, peer);
        Ok(())
    }

    /// Remove and return the peer for `id`, if registered.
    pub async fn remove(&self, id: NodeId) -> Option<Arc<Peer>> {
        self.peers.write().await.remove(&id)
    }

    /// Look up the peer for `id`.
    pub async fn get(&self, id: NodeId) -> Option<Arc<Peer>> {
        self.peers.read().await.get(&id).cloned()
    }

    /// Whether `id` is currently registered.
    pub async fn contains(&self, id: NodeId) -> bool {
        self.peers.read().await.contains_key(&id)
    }

    /// Snapshot of all peers for lock-free iteration during broadcast.
    pub async fn snapshot(&self) -> Vec<(NodeId, Arc<Peer>)> {
        self.peers
            .read()
            .await
            .iter()
            .map(|(id, peer)| (*id, Arc::clone(peer)))
            .collect()
    }

    /// Number of connected peers.
    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }
}
