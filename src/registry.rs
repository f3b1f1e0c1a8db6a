//! Authoritative node identity and mutable liveness state.
//!
//! Mirrors the locking discipline the teacher uses in `cache.rs`
//! (`parking_lot::RwLock`, never held across an `.await`).

use crate::types::{Network, Node, NodeId};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::SystemTime;

pub struct NodeRegistry {
    startup: Vec<Node>,
    nodes: RwLock<HashMap<NodeId, Node>>,
}

impl NodeRegistry {
    pub fn new(nodes: Vec<Node>) -> Self {
        let startup = nodes.clone();
        let map = nodes.into_iter().map(|n| (n.id.clone(), n)).collect();
        Self {
            startup,
            nodes: RwLock::new(map),
        }
    }

    pub fn list_all(&self) -> Vec<Node> {
        self.nodes.read().values().cloned().collect()
    }

    pub fn list_by_network(&self, network: &Network) -> Vec<Node> {
        self.nodes
            .read()
            .values()
            .filter(|n| &n.network == network)
            .cloned()
            .collect()
    }

    pub fn list_healthy(&self) -> Vec<Node> {
        self.nodes
            .read()
            .values()
            .filter(|n| n.healthy)
            .cloned()
            .collect()
    }

    pub fn list_healthy_by_network(&self, network: &Network) -> Vec<Node> {
        self.nodes
            .read()
            .values()
            .filter(|n| n.healthy && &n.network == network)
            .cloned()
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<Node> {
        self.nodes.read().get(id).cloned()
    }

    /// No-op if `id` is unknown, per spec.
    pub fn set_health(&self, id: &str, healthy: bool) {
        if let Some(node) = self.nodes.write().get_mut(id) {
            node.healthy = healthy;
            node.last_checked_at = Some(SystemTime::now());
        }
    }

    pub fn set_weight(&self, id: &str, weight: u32) {
        if let Some(node) = self.nodes.write().get_mut(id) {
            node.weight = weight.max(1);
        }
    }

    /// Fails (returns `false`) if the id already exists.
    pub fn add(&self, node: Node) -> bool {
        let mut nodes = self.nodes.write();
        if nodes.contains_key(&node.id) {
            return false;
        }
        nodes.insert(node.id.clone(), node);
        true
    }

    pub fn remove(&self, id: &str) -> Option<Node> {
        self.nodes.write().remove(id)
    }

    /// Reinstates the startup configuration, discarding dynamic
    /// additions/removals and liveness flips.
    pub fn reset(&self) {
        let mut nodes = self.nodes.write();
        nodes.clear();
        for node in &self.startup {
            nodes.insert(node.id.clone(), node.clone());
        }
    }

    pub fn has_capability(&self, id: &str, cap: &str) -> bool {
        self.nodes
            .read()
            .get(id)
            .map(|n| n.has_capability(cap))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str) -> Node {
        Node::new(id, format!("http://{id}"), Network::AvalancheMainnet)
    }

    #[test]
    fn unknown_set_health_is_noop() {
        let reg = NodeRegistry::new(vec![node("a")]);
        reg.set_health("does-not-exist", false);
        assert!(reg.get("a").unwrap().healthy);
    }

    #[test]
    fn add_fails_on_duplicate_id() {
        let reg = NodeRegistry::new(vec![node("a")]);
        assert!(!reg.add(node("a")));
        assert_eq!(reg.list_all().len(), 1);
    }

    #[test]
    fn reset_discards_dynamic_changes() {
        let reg = NodeRegistry::new(vec![node("a"), node("b")]);
        reg.remove("b");
        reg.set_health("a", false);
        reg.add(node("c"));
        reg.reset();

        let mut ids: Vec<_> = reg.list_all().into_iter().map(|n| n.id).collect();
        ids.sort();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
        assert!(reg.get("a").unwrap().healthy);
    }

    #[test]
    fn list_healthy_by_network_filters_both() {
        let mut b = node("b");
        b.network = Network::AvalancheFuji;
        let reg = NodeRegistry::new(vec![node("a"), b]);
        reg.set_health("a", false);
        let result = reg.list_healthy_by_network(&Network::AvalancheMainnet);
        assert!(result.is_empty());
    }
}
