//! Known nodes
//!
//! Lookups read a published list without locking. Inserts take a narrow
//! mutex so two threads discovering the same address agree on one handle.
//! Nodes are only removed on shutdown.

use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use super::handle::NodeHandle;
use crate::config::ServerAddress;

pub struct NodeRegistry {
    nodes: ArcSwap<Vec<Arc<NodeHandle>>>,
    insert_lock: Mutex<()>,
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            nodes: ArcSwap::from_pointee(Vec::new()),
            insert_lock: Mutex::new(()),
        }
    }

    pub fn get(&self, address: &ServerAddress) -> Option<Arc<NodeHandle>> {
        self.nodes
            .load()
            .iter()
            .find(|n| n.address() == address)
            .cloned()
    }

    /// Existing handle for `address`, or a new one; the flag is true if created
    pub fn get_or_insert(&self, address: &ServerAddress) -> (Arc<NodeHandle>, bool) {
        if let Some(node) = self.get(address) {
            return (node, false);
        }

        let _guard = self.insert_lock.lock();
        // re-check under the lock
        if let Some(node) = self.get(address) {
            return (node, false);
        }
        let node = Arc::new(NodeHandle::new(address.clone()));
        let mut next = Vec::clone(&self.nodes.load());
        next.push(Arc::clone(&node));
        self.nodes.store(Arc::new(next));
        (node, true)
    }

    /// All nodes in insertion order
    pub fn all(&self) -> Arc<Vec<Arc<NodeHandle>>> {
        self.nodes.load_full()
    }

    pub fn len(&self) -> usize {
        self.nodes.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every node, returning them for teardown
    pub fn clear(&self) -> Vec<Arc<NodeHandle>> {
        let _guard = self.insert_lock.lock();
        let old = self.nodes.swap(Arc::new(Vec::new()));
        Vec::clone(&old)
    }
}
