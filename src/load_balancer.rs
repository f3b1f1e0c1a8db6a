//! Strategy-driven node selection over the health/circuit-filtered
//! candidate set, plus sticky-session bookkeeping.
//!
//! Generalizes the teacher's single round-robin `AtomicUsize` index
//! (`load_balancer.rs`) into five selectable strategies and an emergency
//! fallback, grounded in the weighted/health-score selection shown across
//! the example pack's load-balancer modules.

use crate::circuit::CircuitBreaker;
use crate::health::HealthChecker;
use crate::registry::NodeRegistry;
use crate::types::{Network, Node, NodeId, StickySession};
use parking_lot::RwLock;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    RoundRobin,
    Random,
    Weighted,
    HealthBased,
    Sticky,
}

impl Strategy {
    pub fn parse(s: &str) -> Self {
        match s {
            "round-robin" => Strategy::RoundRobin,
            "random" => Strategy::Random,
            "weighted" => Strategy::Weighted,
            "sticky" => Strategy::Sticky,
            _ => Strategy::HealthBased,
        }
    }
}

pub struct LoadBalancer {
    registry: Arc<NodeRegistry>,
    circuit_breaker: Arc<CircuitBreaker>,
    health_checker: Arc<HealthChecker>,
    round_robin_index: AtomicUsize,
    sessions: RwLock<HashMap<String, StickySession>>,
    session_ttl: Duration,
}

impl LoadBalancer {
    pub fn new(
        registry: Arc<NodeRegistry>,
        circuit_breaker: Arc<CircuitBreaker>,
        health_checker: Arc<HealthChecker>,
        session_ttl: Duration,
    ) -> Self {
        Self {
            registry,
            circuit_breaker,
            health_checker,
            round_robin_index: AtomicUsize::new(0),
            sessions: RwLock::new(HashMap::new()),
            session_ttl,
        }
    }

    fn candidates(&self, network: &Network, capability: Option<&str>) -> Vec<Node> {
        self.registry
            .list_healthy_by_network(network)
            .into_iter()
            .filter(|n| capability.map(|c| n.has_capability(c)).unwrap_or(true))
            .filter(|n| self.circuit_breaker.is_allowed(&n.id))
            .collect()
    }

    /// Healthy node with the fewest lifetime (cumulative) failures,
    /// regardless of circuit state. Only consulted when no capability was
    /// required (spec.md §9 open question, resolved "no" for the
    /// capability-constrained case).
    fn emergency_fallback(&self, network: &Network) -> Option<Node> {
        let healthy = self.registry.list_healthy_by_network(network);
        healthy
            .into_iter()
            .min_by_key(|n| self.circuit_breaker.stats(&n.id).cumulative_failure)
    }

    pub fn select(
        &self,
        network: &Network,
        strategy: Strategy,
        capability: Option<&str>,
        session_id: Option<&str>,
    ) -> Option<Node> {
        if strategy == Strategy::Sticky {
            return self.select_sticky(network, capability, session_id);
        }

        let candidates = self.candidates(network, capability);
        if candidates.is_empty() {
            if capability.is_none() {
                return self.emergency_fallback(network);
            }
            return None;
        }

        match strategy {
            Strategy::RoundRobin => self.select_round_robin(&candidates),
            Strategy::Random => self.select_random(&candidates),
            Strategy::Weighted => self.select_weighted(&candidates),
            Strategy::HealthBased => self.select_health_based(&candidates),
            Strategy::Sticky => unreachable!(),
        }
    }

    fn select_round_robin(&self, candidates: &[Node]) -> Option<Node> {
        if candidates.is_empty() {
            return None;
        }
        let idx = self.round_robin_index.fetch_add(1, Ordering::SeqCst) % candidates.len();
        Some(candidates[idx].clone())
    }

    fn select_random(&self, candidates: &[Node]) -> Option<Node> {
        if candidates.is_empty() {
            return None;
        }
        let idx = rand::thread_rng().gen_range(0..candidates.len());
        Some(candidates[idx].clone())
    }

    /// Samples proportionally to `node.weight` via interval inversion over
    /// cumulative weights.
    fn select_weighted(&self, candidates: &[Node]) -> Option<Node> {
        let total_weight: u64 = candidates.iter().map(|n| n.weight as u64).sum();
        if total_weight == 0 {
            return self.select_random(candidates);
        }
        let mut pick = rand::thread_rng().gen_range(0..total_weight);
        for node in candidates {
            if pick < node.weight as u64 {
                return Some(node.clone());
            }
            pick -= node.weight as u64;
        }
        candidates.last().cloned()
    }

    /// argmax(score), tie-break by priority (lower wins), then stable id
    /// order.
    fn select_health_based(&self, candidates: &[Node]) -> Option<Node> {
        candidates
            .iter()
            .max_by(|a, b| {
                let score_a = self.health_checker.metrics(&a.id).map(|m| m.score).unwrap_or(50);
                let score_b = self.health_checker.metrics(&b.id).map(|m| m.score).unwrap_or(50);
                score_a
                    .cmp(&score_b)
                    .then_with(|| b.priority.cmp(&a.priority))
                    .then_with(|| b.id.cmp(&a.id))
            })
            .cloned()
    }

    fn select_sticky(
        &self,
        network: &Network,
        capability: Option<&str>,
        session_id: Option<&str>,
    ) -> Option<Node> {
        let candidates = self.candidates(network, capability);

        if let Some(sid) = session_id {
            let now = SystemTime::now();
            let pinned = {
                let sessions = self.sessions.read();
                sessions.get(sid).cloned()
            };

            if let Some(session) = pinned {
                if session.expires_at > now {
                    if let Some(node) = candidates.iter().find(|n| n.id == session.node_id) {
                        self.refresh_session(sid, &session.node_id);
                        return Some(node.clone());
                    }
                }
            }
        }

        let selected = if candidates.is_empty() {
            if capability.is_none() {
                self.emergency_fallback(network)
            } else {
                None
            }
        } else {
            self.select_health_based(&candidates)
        };

        if let (Some(sid), Some(node)) = (session_id, &selected) {
            self.pin_session(sid, &node.id);
        }

        selected
    }

    fn pin_session(&self, session_id: &str, node_id: &NodeId) {
        let now = SystemTime::now();
        self.sessions.write().insert(
            session_id.to_string(),
            StickySession {
                session_id: session_id.to_string(),
                node_id: node_id.clone(),
                last_used_at: now,
                expires_at: now + self.session_ttl,
            },
        );
    }

    fn refresh_session(&self, session_id: &str, node_id: &NodeId) {
        self.pin_session(session_id, node_id);
    }

    /// Periodic sweep removing expired sticky sessions.
    pub fn sweep_expired_sessions(&self) {
        let now = SystemTime::now();
        self.sessions.write().retain(|_, s| s.expires_at > now);
    }

    pub fn spawn_session_sweep(self: Arc<Self>, interval: Duration) {
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            loop {
                timer.tick().await;
                self.sweep_expired_sessions();
            }
        });
    }

    pub fn record_successful_request(&self, id: &str) {
        self.circuit_breaker.record_success(id);
    }

    pub fn record_failed_request(&self, id: &str) {
        self.circuit_breaker.record_failure(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CircuitBreakerConfig, HealthCheckConfig};

    fn make_lb(nodes: Vec<Node>) -> (Arc<LoadBalancer>, Arc<CircuitBreaker>, Arc<HealthChecker>) {
        let registry = Arc::new(NodeRegistry::new(nodes));
        let circuit = Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default()));
        let health = Arc::new(HealthChecker::new(HealthCheckConfig::default(), Arc::clone(&registry)));
        let lb = Arc::new(LoadBalancer::new(
            Arc::clone(&registry),
            Arc::clone(&circuit),
            Arc::clone(&health),
            Duration::from_secs(600),
        ));
        (lb, circuit, health)
    }

    fn node(id: &str) -> Node {
        Node::new(id, format!("http://{id}"), Network::AvalancheMainnet)
    }

    #[test]
    fn round_robin_visits_healthy_nodes_only() {
        let mut c = node("c");
        c.healthy = false;
        let registry_nodes = vec![node("a"), node("b"), c];
        let (lb, _circuit, _health) = make_lb(registry_nodes);
        lb.registry.set_health("c", false);

        let mut seen = std::collections::HashSet::new();
        for _ in 0..10 {
            let n = lb
                .select(&Network::AvalancheMainnet, Strategy::RoundRobin, None, None)
                .unwrap();
            assert_ne!(n.id, "c");
            seen.insert(n.id);
        }
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn round_robin_cycles_exactly_once_per_k() {
        let (lb, _circuit, _health) = make_lb(vec![node("a"), node("b"), node("c")]);
        let mut counts: HashMap<String, u32> = HashMap::new();
        for _ in 0..3 {
            let n = lb
                .select(&Network::AvalancheMainnet, Strategy::RoundRobin, None, None)
                .unwrap();
            *counts.entry(n.id).or_default() += 1;
        }
        assert_eq!(counts.len(), 3);
        assert!(counts.values().all(|&c| c == 1));
    }

    #[test]
    fn sticky_session_pins_then_fails_over() {
        let (lb, _circuit, _health) = make_lb(vec![node("a"), node("b")]);
        let sid = "session-1";

        let first = lb
            .select(&Network::AvalancheMainnet, Strategy::Sticky, None, Some(sid))
            .unwrap();
        for _ in 0..9 {
            let n = lb
                .select(&Network::AvalancheMainnet, Strategy::Sticky, None, Some(sid))
                .unwrap();
            assert_eq!(n.id, first.id);
        }

        lb.registry.set_health(&first.id, false);
        let after = lb
            .select(&Network::AvalancheMainnet, Strategy::Sticky, None, Some(sid))
            .unwrap();
        assert_ne!(after.id, first.id);
    }

    #[test]
    fn emergency_fallback_only_without_capability() {
        let (lb, circuit, _health) = make_lb(vec![node("a"), node("b")]);
        for _ in 0..10 {
            circuit.record_failure("a");
            circuit.record_failure("b");
        }
        // both circuits open: no capability required -> fallback picks one
        let fallback = lb.select(&Network::AvalancheMainnet, Strategy::HealthBased, None, None);
        assert!(fallback.is_some());

        // capability required -> no fallback, selection fails
        let none = lb.select(&Network::AvalancheMainnet, Strategy::HealthBased, Some("archive"), None);
        assert!(none.is_none());
    }

    #[test]
    fn weighted_on_empty_registry_returns_none() {
        let (lb, _circuit, _health) = make_lb(vec![]);
        assert!(lb
            .select(&Network::AvalancheMainnet, Strategy::Weighted, None, None)
            .is_none());
    }
}
