//! In-memory hot view of the store.
//!
//! Warmed from the active-and-passive set at startup; reads consult the
//! cache before the store, writes go through the store first and land in
//! the cache on commit. Pointers are followed transparently with the same
//! hop bound as the store.

use std::collections::HashMap;

use tokio::sync::RwLock;
use tracing::debug;

use crate::model::{MAX_POINTER_HOPS, Node, NodeId, StoredNode};
use crate::store::{Store, StoreError, StoreResult};

/// Node cache keyed by id.
#[derive(Default)]
pub struct NodeCache {
    slots: RwLock<HashMap<NodeId, StoredNode>>,
}

impl NodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the live set from the store.
    pub async fn warm(&self, store: &Store) -> StoreResult<usize> {
        let live = store.all_active_and_passive().await?;
        let mut slots = self.slots.write().await;
        let count = live.len();
        for node in live {
            slots.insert(node.id.clone(), StoredNode::Inline(node));
        }
        debug!(count, "cache warmed");
        Ok(count)
    }

    pub async fn len(&self) -> usize {
        self.slots.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.slots.read().await.is_empty()
    }

    async fn lookup(&self, id: &NodeId) -> Option<StoredNode> {
        self.slots.read().await.get(id).cloned()
    }

    /// Drop one slot (e.g. after an external overwrite).
    pub async fn evict(&self, id: &NodeId) {
        self.slots.write().await.remove(id);
    }

    /// Remember a stored form without touching the store.
    pub async fn put(&self, stored: StoredNode) {
        self.slots
            .write()
            .await
            .insert(stored.id().clone(), stored);
    }

    /// Fetch a node, consulting the cache first and following pointers
    /// transparently. Misses are filled from the store.
    pub async fn get(&self, store: &Store, id: &NodeId) -> StoreResult<Node> {
        let mut current = id.clone();
        for _ in 0..MAX_POINTER_HOPS {
            let stored = match self.lookup(&current).await {
                Some(stored) => stored,
                None => {
                    let stored = store
                        .get_stored(&current)
                        .await?
                        .ok_or_else(|| StoreError::NotFound(current.clone()))?;
                    self.put(stored.clone()).await;
                    stored
                }
            };
            match stored {
                StoredNode::Inline(node) => return Ok(node),
                StoredNode::Pointer { points_to, .. } => current = points_to,
            }
        }
        Err(StoreError::PointerChain { id: id.clone() })
    }

    /// Write-through update: store first, cache on commit.
    pub async fn update(&self, store: &Store, node: &Node) -> StoreResult<()> {
        store.update(node).await?;
        self.put(StoredNode::Inline(node.clone())).await;
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
