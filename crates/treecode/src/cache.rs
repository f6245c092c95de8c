//! Per-branch cache of remote nodes, with request coalescing.

use std::collections::HashMap;
use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::node::{CentroidData, NodeType};
use crate::types::morton::Key;
use crate::types::point::Particle;

/// Serialized node shipped between branches: the reply to a node
/// request or an entry of the starter pack.
#[derive(Clone, Debug)]
pub struct WireNode {
    pub key: Key,
    pub kind: WireKind,
    pub data: CentroidData,
    /// Index of the tree piece that served the node.
    pub owner_tp: i64,
    /// Bucket contents, attached for leaves only.
    pub particles: Vec<Particle>,
}

/// Node classification on the wire, coerced to a resident type on
/// install.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WireKind {
    /// Aggregate served by a tree element.
    Boundary,
    /// Interior node whose children ride along in the same reply.
    Internal,
    /// Bucket with its particles attached.
    Leaf,
    /// Known-empty cell.
    EmptyLeaf,
    /// Bottom of the shipped slab; its children stay with the owner.
    Remote,
}

/// A materialized remote node. Owned by the cache, looked up by key;
/// child links are implicit in the key arithmetic.
#[derive(Clone, Debug)]
pub struct CachedNode {
    pub key: Key,
    pub node_type: NodeType,
    pub data: CentroidData,
    pub owner_tp: i64,
    pub particles: Vec<Particle>,
}

/// Fetch and resumption counters, reduced over branches for the
/// per-iteration log line.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct CacheStats {
    /// Upstream fetches issued (one per distinct missing key).
    pub requests_issued: u64,
    /// Traversal suspensions that latched onto an in-flight fetch
    /// instead of issuing their own.
    pub coalesced_waits: u64,
    /// Node-reply messages installed.
    pub replies_installed: u64,
    pub nodes_installed: u64,
    pub particles_installed: u64,
}

impl CacheStats {
    pub fn merge(&mut self, other: &CacheStats) {
        self.requests_issued += other.requests_issued;
        self.coalesced_waits += other.coalesced_waits;
        self.replies_installed += other.replies_installed;
        self.nodes_installed += other.nodes_installed;
        self.particles_installed += other.particles_installed;
    }
}

/// Branch-local cache: key to materialized node, plus the map of keys
/// with an outstanding fetch and the tree pieces waiting on each.
#[derive(Debug, Default)]
pub struct CacheManager {
    store: HashMap<Key, CachedNode>,
    starter: HashSet<Key>,
    curr_waiting: HashMap<Key, Vec<usize>>,
    pub stats: CacheStats,
}

impl CacheManager {
    pub fn get(&self, key: Key) -> Option<&CachedNode> {
        self.store.get(&key)
    }

    /// Whether a fetch for this key is already in flight.
    pub fn is_waiting(&self, key: Key) -> bool {
        self.curr_waiting.contains_key(&key)
    }

    /// Record the first waiter for a key; the caller must issue the
    /// upstream fetch exactly when this is called.
    pub fn insert_waiting(&mut self, key: Key, tp: usize) {
        debug_assert!(!self.curr_waiting.contains_key(&key));
        self.curr_waiting.insert(key, vec![tp]);
        self.stats.requests_issued += 1;
    }

    /// Append a waiter to an in-flight fetch without re-issuing it.
    pub fn add_waiter(&mut self, key: Key, tp: usize) {
        let waiters = self
            .curr_waiting
            .get_mut(&key)
            .expect("waiter appended to a key with no fetch in flight");
        if !waiters.contains(&tp) {
            waiters.push(tp);
            self.stats.coalesced_waits += 1;
        }
    }

    /// Resolve a key: remove and return its waiter list.
    pub fn take_waiters(&mut self, key: Key) -> Vec<usize> {
        self.curr_waiting.remove(&key).unwrap_or_default()
    }

    /// Install the top levels of the global tree; available to every
    /// traversal from the start of the iteration. The pack replaces
    /// whatever the cache held, so entries from the previous tree
    /// cannot leak into the new one.
    pub fn recv_starter_pack(&mut self, pack: &[(Key, CentroidData)]) {
        self.store.clear();
        self.starter.clear();
        for &(key, data) in pack {
            self.starter.insert(key);
            self.store.insert(
                key,
                CachedNode {
                    key,
                    node_type: NodeType::CachedBoundary,
                    data,
                    owner_tp: -1,
                    particles: Vec::new(),
                },
            );
        }
    }

    /// Install a reply, coercing wire types to their resident forms.
    pub fn install(&mut self, nodes: Vec<WireNode>) {
        self.stats.replies_installed += 1;
        for wire in nodes {
            let node_type = match wire.kind {
                WireKind::Boundary => NodeType::CachedBoundary,
                WireKind::Internal => NodeType::CachedRemote,
                WireKind::Leaf => NodeType::CachedRemoteLeaf,
                WireKind::EmptyLeaf => NodeType::RemoteEmptyLeaf,
                WireKind::Remote => NodeType::Remote,
            };
            self.stats.nodes_installed += 1;
            self.stats.particles_installed += wire.particles.len() as u64;
            self.store.insert(
                wire.key,
                CachedNode {
                    key: wire.key,
                    node_type,
                    data: wire.data,
                    owner_tp: wire.owner_tp,
                    particles: wire.particles,
                },
            );
        }
    }

    /// Drop cached entries at the iteration boundary so stale nodes
    /// from the previous tree cannot be consulted. Starter entries may
    /// be kept; the next starter pack overwrites them wholesale.
    pub fn destroy(&mut self, keep_starter: bool) {
        assert!(
            self.curr_waiting.is_empty(),
            "cache destroyed with fetches in flight"
        );
        if keep_starter {
            let starter = &self.starter;
            self.store.retain(|key, _| starter.contains(key));
        } else {
            self.store.clear();
            self.starter.clear();
        }
    }

    /// Per-iteration counters, reset on read.
    pub fn take_stats(&mut self) -> CacheStats {
        std::mem::take(&mut self.stats)
    }
}
