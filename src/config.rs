//! Environment-driven configuration, generalizing the teacher's literal
//! `Vec<UpstreamConfig>` in `main.rs` into an env-loaded node list with
//! typed defaults for every tunable in spec.md §4.2 / §6.

use crate::types::Network;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    pub interval: Duration,
    pub timeout: Duration,
    pub recovery_interval: Duration,
    pub endpoint: String,
    pub failure_threshold: u32,
    pub success_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(2),
            recovery_interval: Duration::from_secs(60),
            endpoint: "/".to_string(),
            failure_threshold: 3,
            success_threshold: 2,
        }
    }
}

impl HealthCheckConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            interval: env_duration_ms("HEALTH_CHECK_INTERVAL", defaults.interval),
            timeout: env_duration_ms("HEALTH_CHECK_TIMEOUT", defaults.timeout),
            recovery_interval: env_duration_ms("HEALTH_RECOVERY_INTERVAL", defaults.recovery_interval),
            endpoint: std::env::var("HEALTH_CHECK_ENDPOINT").unwrap_or(defaults.endpoint),
            failure_threshold: env_u32("HEALTH_FAILURE_THRESHOLD", defaults.failure_threshold),
            success_threshold: env_u32("HEALTH_SUCCESS_THRESHOLD", defaults.success_threshold),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub reset_timeout: Duration,
    pub monitor_interval: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(30),
            monitor_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub timeout: Duration,
    pub retries: u32,
    pub retry_delay: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            retries: 2,
            retry_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub max_entries: usize,
    pub sweep_interval: Duration,
    pub snapshot_path: Option<String>,
    pub snapshot_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            sweep_interval: Duration::from_secs(60),
            snapshot_path: std::env::var("CACHE_SNAPSHOT_PATH").ok(),
            snapshot_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StickySessionConfig {
    pub ttl: Duration,
    pub sweep_interval: Duration,
}

impl Default for StickySessionConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub nodes: Vec<crate::types::Node>,
    pub default_network: Network,
    pub health_check: HealthCheckConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub proxy: ProxyConfig,
    pub cache: CacheConfig,
    pub sticky_sessions: StickySessionConfig,
}

impl GatewayConfig {
    /// Loads nodes and tunables from the environment, falling back to the
    /// teacher's three-local-node example so the gateway still runs with
    /// zero configuration.
    pub fn from_env() -> Self {
        let default_network = Network::parse(
            &std::env::var("DEFAULT_NETWORK").unwrap_or_else(|_| "avalanche-mainnet".to_string()),
        );

        let nodes = nodes_from_env(&default_network);

        Self {
            nodes,
            default_network,
            health_check: HealthCheckConfig::from_env(),
            circuit_breaker: CircuitBreakerConfig::default(),
            proxy: ProxyConfig::default(),
            cache: CacheConfig::default(),
            sticky_sessions: StickySessionConfig::default(),
        }
    }
}

/// Reads `NODE_<N>_ID` / `NODE_<N>_URL` / `NODE_<N>_NETWORK` triples for
/// `N = 1, 2, 3, ...` until one is missing. Falls back to the teacher's
/// three local nodes on `avalanche-mainnet` when none are set.
fn nodes_from_env(default_network: &Network) -> Vec<crate::types::Node> {
    let mut nodes = Vec::new();
    let mut i = 1;
    loop {
        let url = match std::env::var(format!("NODE_{i}_URL")) {
            Ok(url) => url,
            Err(_) => break,
        };
        let id = std::env::var(format!("NODE_{i}_ID")).unwrap_or_else(|_| format!("node-{i}"));
        let network = std::env::var(format!("NODE_{i}_NETWORK"))
            .map(|tag| Network::parse(&tag))
            .unwrap_or_else(|_| default_network.clone());
        nodes.push(crate::types::Node::new(id, url, network));
        i += 1;
    }

    if nodes.is_empty() {
        nodes = vec![
            crate::types::Node::new("node-1", "http://localhost:8545", default_network.clone()),
            crate::types::Node::new("node-2", "http://localhost:8546", default_network.clone()),
            crate::types::Node::new("node-3", "http://localhost:8547", default_network.clone()),
        ];
    }

    nodes
}

fn env_duration_ms(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
}
