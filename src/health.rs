//! Active probing, rolling response-time statistics and the [0,100] health
//! score used by the load balancer's health-based strategy.
//!
//! Generalizes the teacher's `UpstreamNode::check_health` single boolean
//! probe into per-node `HealthMetrics` with scoring, and the teacher's
//! `start_health_checker` single timer into the two independent probe /
//! recovery timers spec.md §4.2 calls for.

use crate::config::HealthCheckConfig;
use crate::registry::NodeRegistry;
use crate::types::{HealthMetrics, Node, NodeId};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

const RING_CAPACITY: usize = 10;

pub struct HealthChecker {
    config: HealthCheckConfig,
    registry: Arc<NodeRegistry>,
    client: reqwest::Client,
    metrics: RwLock<HashMap<NodeId, HealthMetrics>>,
    probe_in_flight: RwLock<HashMap<NodeId, Arc<AtomicBool>>>,
}

#[derive(Debug, Serialize)]
pub struct NodeHealthReport {
    pub id: NodeId,
    pub url: String,
    pub network: String,
    pub healthy: bool,
    pub last_response_time: f64,
    pub avg_response_time: f64,
    pub success_rate: f64,
    pub score: u8,
    pub last_checked_at: Option<SystemTime>,
    pub last_status_changed_at: Option<SystemTime>,
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub total_nodes: usize,
    pub healthy_nodes: usize,
    pub nodes: Vec<NodeHealthReport>,
}

impl HealthChecker {
    pub fn new(config: HealthCheckConfig, registry: Arc<NodeRegistry>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .expect("failed to build health-check HTTP client");

        Self {
            config,
            registry,
            client,
            metrics: RwLock::new(HashMap::new()),
            probe_in_flight: RwLock::new(HashMap::new()),
        }
    }

    fn in_flight_flag(&self, id: &str) -> Arc<AtomicBool> {
        self.probe_in_flight
            .write()
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(AtomicBool::new(false)))
            .clone()
    }

    fn with_metrics_mut<R>(&self, id: &str, f: impl FnOnce(&mut HealthMetrics) -> R) -> R {
        let mut metrics = self.metrics.write();
        let m = metrics
            .entry(id.to_string())
            .or_insert_with(|| HealthMetrics::new(RING_CAPACITY));
        f(m)
    }

    pub fn metrics(&self, id: &str) -> Option<HealthMetrics> {
        self.metrics.read().get(id).cloned()
    }

    fn fleet_avg_response_time(&self) -> f64 {
        let metrics = self.metrics.read();
        let samples: Vec<f64> = metrics
            .values()
            .filter(|m| m.avg_response_time > 0.0)
            .map(|m| m.avg_response_time)
            .collect();
        if samples.is_empty() {
            0.0
        } else {
            samples.iter().sum::<f64>() / samples.len() as f64
        }
    }

    /// Score = clamp(successScore + responseTimeScore, 0, 100), each in
    /// [0, 50]. Nodes marked unhealthy are capped at 10.
    fn compute_score(&self, id: &str, healthy: bool) -> u8 {
        let fleet_avg = self.fleet_avg_response_time();
        let metrics = self.metrics.read();
        let m = match metrics.get(id) {
            Some(m) => m,
            None => return if healthy { 50 } else { 10 },
        };

        let total = m.cumulative_success + m.cumulative_failure;
        let success_score = if total == 0 {
            50.0
        } else {
            50.0 * (m.cumulative_success as f64 / total as f64)
        };

        let response_time_score = if fleet_avg <= 0.0 {
            50.0
        } else {
            let r = m.avg_response_time / fleet_avg;
            if r <= 0.5 {
                50.0
            } else if r >= 2.0 {
                10.0
            } else {
                // linear interpolation between (0.5 -> 50) and (2.0 -> 10)
                50.0 + (r - 0.5) * (10.0 - 50.0) / (2.0 - 0.5)
            }
        };

        let score = (success_score + response_time_score).clamp(0.0, 100.0) as u8;
        if healthy { score } else { score.min(10) }
    }

    fn record_outcome(&self, id: &str, response_time_ms: Option<f64>) {
        let (just_recovered, just_degraded, score);
        {
            let mut registry_update: Option<bool> = None;
            self.with_metrics_mut(id, |m| {
                if let Some(rt) = response_time_ms {
                    m.push_sample(rt);
                    m.cumulative_success += 1;
                    m.consecutive_successes += 1;
                    m.consecutive_failures = 0;
                } else {
                    m.cumulative_failure += 1;
                    m.consecutive_failures += 1;
                    m.consecutive_successes = 0;
                }

                let currently_healthy = self.registry.get(id).map(|n| n.healthy).unwrap_or(true);
                if !currently_healthy && m.consecutive_successes >= self.config.success_threshold {
                    registry_update = Some(true);
                    m.last_status_changed_at = Some(SystemTime::now());
                } else if currently_healthy && m.consecutive_failures >= self.config.failure_threshold {
                    registry_update = Some(false);
                    m.last_status_changed_at = Some(SystemTime::now());
                }
            });

            just_recovered = registry_update == Some(true);
            just_degraded = registry_update == Some(false);
            if let Some(new_health) = registry_update {
                self.registry.set_health(id, new_health);
            } else {
                self.registry.set_health(id, self.registry.get(id).map(|n| n.healthy).unwrap_or(true));
            }
        }

        let healthy = self.registry.get(id).map(|n| n.healthy).unwrap_or(true);
        score = self.compute_score(id, healthy);
        self.with_metrics_mut(id, |m| m.score = score);

        if just_recovered {
            tracing::info!("node {} recovered, marked healthy (score={})", id, score);
        } else if just_degraded {
            tracing::warn!("node {} degraded, marked unhealthy (score={})", id, score);
        }
    }

    /// Probes one node, guarding against overlapping runs of the same
    /// node's probe (at-most-one-in-flight, per spec §5).
    pub async fn probe_node(&self, node: &Node) {
        let flag = self.in_flight_flag(&node.id);
        if flag.swap(true, Ordering::SeqCst) {
            tracing::debug!("probe for node {} already in flight, skipping tick", node.id);
            return;
        }

        let outcome = self.do_probe(node).await;
        self.record_outcome(&node.id, outcome);
        flag.store(false, Ordering::SeqCst);
    }

    async fn do_probe(&self, node: &Node) -> Option<f64> {
        let url = format!("{}{}", node.url.trim_end_matches('/'), self.config.endpoint);
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "web3_clientVersion",
            "params": [],
            "id": "health-check",
        });

        let started = Instant::now();
        let result = self.client.post(&url).json(&body).send().await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        let response = match result {
            Ok(r) if r.status().is_success() => r,
            Ok(_) => {
                // fall back to eth_chainId before giving up on this node
                return self.do_probe_fallback(node, started).await;
            }
            Err(_) => return None,
        };

        match response.json::<serde_json::Value>().await {
            Ok(json) if json.get("error").is_none() && (json.get("result").is_some() || json.get("jsonrpc").is_some()) => {
                Some(elapsed_ms)
            }
            // a well-formed JSON-RPC error envelope means the method isn't
            // supported; fall back to eth_chainId instead of counting it as success
            Ok(_) => self.do_probe_fallback(node, started).await,
            Err(_) => None,
        }
    }

    async fn do_probe_fallback(&self, node: &Node, started: Instant) -> Option<f64> {
        let url = format!("{}{}", node.url.trim_end_matches('/'), self.config.endpoint);
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "eth_chainId",
            "params": [],
            "id": "health-check",
        });

        let result = self.client.post(&url).json(&body).send().await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        match result {
            Ok(r) if r.status().is_success() => Some(elapsed_ms),
            _ => None,
        }
    }

    /// Probes every registered node concurrently; one task per node.
    pub async fn run_probe_cycle(self: &Arc<Self>) {
        let nodes = self.registry.list_all();
        let mut handles = Vec::with_capacity(nodes.len());
        for node in nodes {
            let checker = Arc::clone(self);
            handles.push(tokio::spawn(async move { checker.probe_node(&node).await }));
        }
        for h in handles {
            let _ = h.await;
        }
    }

    /// Recovery timer: rescans only unhealthy nodes.
    pub async fn run_recovery_cycle(self: &Arc<Self>) {
        let nodes: Vec<Node> = self
            .registry
            .list_all()
            .into_iter()
            .filter(|n| !n.healthy)
            .collect();
        let mut handles = Vec::with_capacity(nodes.len());
        for node in nodes {
            let checker = Arc::clone(self);
            handles.push(tokio::spawn(async move { checker.probe_node(&node).await }));
        }
        for h in handles {
            let _ = h.await;
        }
    }

    pub fn spawn_background_loops(self: Arc<Self>) {
        let probe_checker = Arc::clone(&self);
        let interval = self.config.interval;
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            loop {
                timer.tick().await;
                probe_checker.run_probe_cycle().await;
            }
        });

        let recovery_checker = Arc::clone(&self);
        let recovery_interval = self.config.recovery_interval;
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(recovery_interval);
            loop {
                timer.tick().await;
                recovery_checker.run_recovery_cycle().await;
            }
        });
    }

    /// Sets liveness directly, priming the consecutive counters to the
    /// threshold of that direction and recomputing the score. Idempotent:
    /// calling twice with the same value leaves the same final state.
    pub fn force_update_health(&self, id: &str, healthy: bool) {
        self.registry.set_health(id, healthy);
        self.with_metrics_mut(id, |m| {
            if healthy {
                m.consecutive_successes = m.consecutive_successes.max(1);
                m.consecutive_failures = 0;
            } else {
                m.consecutive_failures = m.consecutive_failures.max(1);
                m.consecutive_successes = 0;
            }
            m.last_status_changed_at = Some(SystemTime::now());
        });
        let score = self.compute_score(id, healthy);
        self.with_metrics_mut(id, |m| m.score = score);
    }

    pub fn get_health_report(&self) -> HealthReport {
        let nodes = self.registry.list_all();
        let healthy_nodes = nodes.iter().filter(|n| n.healthy).count();
        let reports = nodes
            .into_iter()
            .map(|n| {
                let m = self.metrics.read().get(&n.id).cloned();
                NodeHealthReport {
                    id: n.id.clone(),
                    url: n.url,
                    network: n.network.as_str().to_string(),
                    healthy: n.healthy,
                    last_response_time: m.as_ref().map(|m| m.last_sample).unwrap_or(0.0),
                    avg_response_time: m.as_ref().map(|m| m.avg_response_time).unwrap_or(0.0),
                    success_rate: m.as_ref().map(|m| m.success_rate()).unwrap_or(1.0),
                    score: m.as_ref().map(|m| m.score).unwrap_or(50),
                    last_checked_at: n.last_checked_at,
                    last_status_changed_at: m.and_then(|m| m.last_status_changed_at),
                }
            })
            .collect::<Vec<_>>();

        HealthReport {
            total_nodes: reports.len(),
            healthy_nodes,
            nodes: reports,
        }
    }

    /// All nodes sorted by health score descending.
    pub fn get_nodes_by_score(&self) -> Vec<(NodeId, u8)> {
        let metrics = self.metrics.read();
        let mut scored: Vec<(NodeId, u8)> = self
            .registry
            .list_all()
            .into_iter()
            .map(|n| {
                let score = metrics.get(&n.id).map(|m| m.score).unwrap_or(50);
                (n.id, score)
            })
            .collect();
        scored.sort_by(|a, b| b.1.cmp(&a.1));
        scored
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Network;
    use std::time::Duration;

    fn checker() -> Arc<HealthChecker> {
        let registry = Arc::new(NodeRegistry::new(vec![Node::new(
            "a",
            "http://invalid-test-host:0",
            Network::AvalancheMainnet,
        )]));
        Arc::new(HealthChecker::new(
            HealthCheckConfig {
                interval: Duration::from_secs(10),
                timeout: Duration::from_millis(50),
                recovery_interval: Duration::from_secs(60),
                endpoint: "/".to_string(),
                failure_threshold: 3,
                success_threshold: 2,
            },
            registry,
        ))
    }

    #[test]
    fn force_update_health_is_idempotent() {
        let checker = checker();
        checker.force_update_health("a", true);
        let first = checker.metrics("a").unwrap();
        checker.force_update_health("a", true);
        let second = checker.metrics("a").unwrap();
        assert_eq!(first.consecutive_successes, second.consecutive_successes);
        assert_eq!(first.consecutive_failures, second.consecutive_failures);
        assert!(checker.registry.get("a").unwrap().healthy);
    }

    #[test]
    fn score_capped_at_ten_when_unhealthy() {
        let checker = checker();
        checker.force_update_health("a", false);
        let m = checker.metrics("a").unwrap();
        assert!(m.score <= 10);
    }

    #[tokio::test]
    async fn failing_probe_degrades_after_threshold() {
        let checker = checker();
        for _ in 0..3 {
            checker.record_outcome("a", None);
        }
        assert!(!checker.registry.get("a").unwrap().healthy);
        let m = checker.metrics("a").unwrap();
        assert_eq!(m.consecutive_failures, 3);
        assert_eq!(m.consecutive_successes, 0);
    }

    #[tokio::test]
    async fn recovers_after_success_threshold() {
        let checker = checker();
        for _ in 0..3 {
            checker.record_outcome("a", None);
        }
        assert!(!checker.registry.get("a").unwrap().healthy);
        checker.record_outcome("a", Some(5.0));
        assert!(!checker.registry.get("a").unwrap().healthy);
        checker.record_outcome("a", Some(5.0));
        assert!(checker.registry.get("a").unwrap().healthy);
    }
}
