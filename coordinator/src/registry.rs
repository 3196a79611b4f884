use chrono::{DateTime, Utc};
use network::NodeLink;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

use crate::NodeId;

/// Identity of a node that has registered at some point. Persisted; never
/// holds a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownNode {
    pub id: NodeId,
    pub address: String,
    pub capacity: u64,
    pub last_registered: DateTime<Utc>,
}

/// A live registration. The link is the only way to reach the node's
/// connection.
#[derive(Debug)]
pub struct NodeRecord {
    pub id: NodeId,
    pub address: String,
    pub capacity: u64,
    /// Bytes pushed to this node since it registered. Not reconciled with
    /// the node's disk.
    pub usage: u64,
    pub session: Uuid,
    pub registered_at: DateTime<Utc>,
    link: NodeLink,
}

impl NodeRecord {
    pub fn link(&self) -> &NodeLink {
        &self.link
    }
}

#[derive(Debug, Default)]
pub struct NodeRegistry {
    nodes: HashMap<NodeId, NodeRecord>,
    known: BTreeMap<NodeId, KnownNode>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a fresh record with a new session. A record already under
    /// `id` is replaced, and dropping its link closes the old connection.
    pub fn register(&mut self, id: NodeId, address: String, capacity: u64, link: NodeLink) -> &NodeRecord {
        let now = Utc::now();
        let record = NodeRecord {
            id: id.clone(),
            address: address.clone(),
            capacity,
            usage: 0,
            session: Uuid::new_v4(),
            registered_at: now,
            link,
        };

        if let Some(stale) = self.nodes.insert(id.clone(), record) {
            tracing::info!(
                "Node {} re-registered; closing previous connection from {}",
                id,
                stale.address
            );
        }

        self.known.insert(
            id.clone(),
            KnownNode {
                id: id.clone(),
                address,
                capacity,
                last_registered: now,
            },
        );

        &self.nodes[&id]
    }

    /// Up to `k` distinct registered ids, uniformly at random, skipping
    /// `exclude`. Ignores capacity and locality.
    pub fn select(&self, k: usize, exclude: &[NodeId]) -> Vec<NodeId> {
        let candidates: Vec<&NodeId> = self
            .nodes
            .keys()
            .filter(|id| !exclude.contains(id))
            .collect();

        candidates
            .choose_multiple(&mut rand::thread_rng(), k)
            .map(|id| (*id).clone())
            .collect()
    }

    pub fn evict(&mut self, id: &NodeId) -> Option<NodeRecord> {
        self.nodes.remove(id)
    }

    pub fn is_online(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn get(&self, id: &NodeId) -> Option<&NodeRecord> {
        self.nodes.get(id)
    }

    pub fn record_usage(&mut self, id: &NodeId, bytes: u64) {
        if let Some(record) = self.nodes.get_mut(id) {
            record.usage = record.usage.saturating_add(bytes);
        }
    }

    pub fn online_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.nodes.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn known_nodes(&self) -> Vec<KnownNode> {
        self.known.values().cloned().collect()
    }

    pub fn restore_known(&mut self, nodes: Vec<KnownNode>) {
        self.known = nodes.into_iter().map(|node| (node.id.clone(), node)).collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tokio::io::{duplex, BufReader};

    fn idle_link(id: &str) -> NodeLink {
        let (coordinator_side, _node_side) = duplex(1024);
        NodeLink::spawn(id, BufReader::new(coordinator_side), &network::Config::default())
    }

    fn registry_with(ids: &[&str]) -> NodeRegistry {
        let mut registry = NodeRegistry::new();
        for id in ids {
            registry.register(NodeId::new(*id), format!("{}:6000", id), 1000, idle_link(id));
        }
        registry
    }

    #[tokio::test]
    async fn test_select_distinct_and_bounded() {
        let registry = registry_with(&["a", "b", "c"]);

        for _ in 0..50 {
            let picked = registry.select(2, &[]);
            assert_eq!(picked.len(), 2);
            let unique: HashSet<_> = picked.iter().collect();
            assert_eq!(unique.len(), 2);
        }

        assert_eq!(registry.select(10, &[]).len(), 3);
        assert!(NodeRegistry::new().select(2, &[]).is_empty());
    }

    #[tokio::test]
    async fn test_select_honours_exclude() {
        let registry = registry_with(&["a", "b", "c"]);
        let exclude = vec![NodeId::new("a"), NodeId::new("b")];

        for _ in 0..20 {
            assert_eq!(registry.select(2, &exclude), vec![NodeId::new("c")]);
        }
    }

    #[tokio::test]
    async fn test_select_reaches_every_node() {
        let registry = registry_with(&["a", "b", "c", "d"]);
        let mut seen = HashSet::new();
        for _ in 0..200 {
            seen.extend(registry.select(1, &[]));
        }
        assert_eq!(seen.len(), 4);
    }

    #[tokio::test]
    async fn test_reregister_replaces_record_and_session() {
        let mut registry = registry_with(&["a"]);
        let first_session = registry.get(&NodeId::new("a")).unwrap().session;

        let record = registry.register(NodeId::new("a"), "elsewhere:6001".to_string(), 2000, idle_link("a"));
        assert_ne!(record.session, first_session);
        assert_eq!(record.address, "elsewhere:6001");
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.known_nodes().len(), 1);
        assert_eq!(registry.known_nodes()[0].capacity, 2000);
    }

    #[tokio::test]
    async fn test_evict_keeps_known_identity() {
        let mut registry = registry_with(&["a", "b"]);
        registry.record_usage(&NodeId::new("a"), 10);
        assert_eq!(registry.get(&NodeId::new("a")).unwrap().usage, 10);

        assert!(registry.evict(&NodeId::new("a")).is_some());
        assert!(!registry.is_online(&NodeId::new("a")));
        assert!(registry.is_online(&NodeId::new("b")));
        assert_eq!(registry.online_ids(), vec![NodeId::new("b")]);
        assert_eq!(registry.known_nodes().len(), 2);
        assert!(registry.evict(&NodeId::new("a")).is_none());
    }
}
