//! Shared data model: nodes, health/circuit state, JSON-RPC envelopes,
//! cache entries and sticky sessions.
//!
//! Timestamps are stored as `SystemTime` rather than `Instant` because the
//! cache snapshot (see `cache.rs`) needs to survive a process restart; the
//! gateway never relies on wall-clock monotonicity for anything beyond
//! ordering TTL comparisons.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::SystemTime;

/// Stable backend identifier.
pub type NodeId = String;

/// Closed-ish set of chain network tags; `Other` keeps the gateway
/// extensible to EVM-compatible chains beyond Avalanche.
///
/// Serialized/deserialized as its plain tag string (`"avalanche-mainnet"`,
/// `"avalanche-fuji"`, or the custom tag) rather than as a tagged enum, so
/// it round-trips through query parameters and node config the same way.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Network {
    AvalancheMainnet,
    AvalancheFuji,
    Other(String),
}

impl Network {
    pub fn parse(tag: &str) -> Self {
        match tag {
            "avalanche-mainnet" => Network::AvalancheMainnet,
            "avalanche-fuji" => Network::AvalancheFuji,
            other => Network::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Network::AvalancheMainnet => "avalanche-mainnet",
            Network::AvalancheFuji => "avalanche-fuji",
            Network::Other(s) => s.as_str(),
        }
    }
}

impl Serialize for Network {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Network {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Network::parse(&s))
    }
}

/// Static configuration plus mutable liveness for one backend execution node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub url: String,
    pub network: Network,
    pub weight: u32,
    pub priority: u32,
    pub capabilities: HashSet<String>,
    pub rate_limit: Option<u32>,
    pub healthy: bool,
    pub last_checked_at: Option<SystemTime>,
}

impl Node {
    pub fn new(id: impl Into<String>, url: impl Into<String>, network: Network) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            network,
            weight: 1,
            priority: 0,
            capabilities: HashSet::new(),
            rate_limit: None,
            healthy: true,
            last_checked_at: None,
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight.max(1);
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_capabilities(mut self, caps: impl IntoIterator<Item = String>) -> Self {
        self.capabilities = caps.into_iter().collect();
        self
    }

    pub fn has_capability(&self, cap: &str) -> bool {
        self.capabilities.contains(cap)
    }
}

/// Bounded ring buffer plus running counters used to derive a node's health
/// score. `K` response-time samples are kept (spec recommends K=10).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthMetrics {
    pub response_times: std::collections::VecDeque<f64>,
    pub ring_capacity: usize,
    pub avg_response_time: f64,
    pub last_sample: f64,
    pub cumulative_success: u64,
    pub cumulative_failure: u64,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    pub last_status_changed_at: Option<SystemTime>,
    pub score: u8,
}

impl HealthMetrics {
    pub fn new(ring_capacity: usize) -> Self {
        Self {
            response_times: std::collections::VecDeque::with_capacity(ring_capacity),
            ring_capacity,
            avg_response_time: 0.0,
            last_sample: 0.0,
            cumulative_success: 0,
            cumulative_failure: 0,
            consecutive_successes: 0,
            consecutive_failures: 0,
            last_status_changed_at: None,
            score: 50,
        }
    }

    pub fn push_sample(&mut self, response_time_ms: f64) {
        self.last_sample = response_time_ms;
        if self.response_times.len() == self.ring_capacity {
            self.response_times.pop_front();
        }
        self.response_times.push_back(response_time_ms);
        self.avg_response_time =
            self.response_times.iter().sum::<f64>() / self.response_times.len() as f64;
    }

    pub fn success_rate(&self) -> f64 {
        let total = self.cumulative_success + self.cumulative_failure;
        if total == 0 {
            1.0
        } else {
            self.cumulative_success as f64 / total as f64
        }
    }
}

/// Per-node circuit-breaker admission state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitStats {
    pub state: CircuitState,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    pub last_success_at: Option<SystemTime>,
    pub last_failure_at: Option<SystemTime>,
    pub opened_at: Option<SystemTime>,
    pub cumulative_success: u64,
    pub cumulative_failure: u64,
}

impl CircuitStats {
    pub fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_successes: 0,
            consecutive_failures: 0,
            last_success_at: None,
            last_failure_at: None,
            opened_at: None,
            cumulative_success: 0,
            cumulative_failure: 0,
        }
    }
}

impl Default for CircuitStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Wire-level request before validation; `id` and `params` are optional
/// here because their absence is itself a validation error, not a parse
/// error, for anything but notifications (which this gateway rejects).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawRpcRequest {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Option<serde_json::Value>,
    #[serde(default)]
    pub id: Option<serde_json::Value>,
}

/// A validated JSON-RPC request: protocol version checked, method
/// non-empty, params normalized to an array, id present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub method: String,
    pub params: Vec<serde_json::Value>,
    pub id: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    pub id: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl RpcResponse {
    pub fn success(id: serde_json::Value, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn error(id: serde_json::Value, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
                data: None,
            }),
            id,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// A request or response body as received/sent over the wire: either a
/// single envelope or a batch.
#[derive(Debug, Clone)]
pub enum RpcBody<T> {
    Single(T),
    Batch(Vec<T>),
}

/// One entry in the response cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub payload: serde_json::Value,
    pub expires_at: SystemTime,
}

/// Client→node affinity pin for `strategy=sticky`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StickySession {
    pub session_id: String,
    pub node_id: NodeId,
    pub last_used_at: SystemTime,
    pub expires_at: SystemTime,
}
