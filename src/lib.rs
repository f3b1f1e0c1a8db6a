//! Core gateway library: wires the registry, health checker, circuit
//! breaker, load balancer, cache and proxy into one `Gateway` object owned
//! by the binary crate, per the no-singletons design note (spec.md §9).

pub mod cache;
pub mod circuit;
pub mod config;
pub mod error;
pub mod health;
pub mod load_balancer;
pub mod proxy;
pub mod registry;
pub mod types;

use cache::Cache;
use circuit::CircuitBreaker;
use config::GatewayConfig;
use health::HealthChecker;
use load_balancer::LoadBalancer;
use proxy::RpcProxy;
use registry::NodeRegistry;
use std::sync::Arc;

/// Owns every subsystem for the lifetime of the process. Constructed once
/// in `main`; tests construct their own fresh instances of the individual
/// components instead of reaching for a shared global.
pub struct Gateway {
    pub registry: Arc<NodeRegistry>,
    pub health_checker: Arc<HealthChecker>,
    pub circuit_breaker: Arc<CircuitBreaker>,
    pub load_balancer: Arc<LoadBalancer>,
    pub cache: Arc<Cache>,
    pub proxy: Arc<RpcProxy>,
    pub default_network: types::Network,
    circuit_monitor_interval: std::time::Duration,
}

impl Gateway {
    pub fn new(config: GatewayConfig) -> Self {
        let registry = Arc::new(NodeRegistry::new(config.nodes));
        let health_checker = Arc::new(HealthChecker::new(config.health_check, Arc::clone(&registry)));
        let circuit_monitor_interval = config.circuit_breaker.monitor_interval;
        let circuit_breaker = Arc::new(CircuitBreaker::new(config.circuit_breaker));
        let load_balancer = Arc::new(LoadBalancer::new(
            Arc::clone(&registry),
            Arc::clone(&circuit_breaker),
            Arc::clone(&health_checker),
            config.sticky_sessions.ttl,
        ));
        let cache = Arc::new(Cache::new(config.cache));
        let proxy = Arc::new(RpcProxy::new(config.proxy, Arc::clone(&load_balancer), Arc::clone(&cache)));

        Self {
            registry,
            health_checker,
            circuit_breaker,
            load_balancer,
            cache,
            proxy,
            default_network: config.default_network,
            circuit_monitor_interval,
        }
    }

    /// Starts every background loop: health probe/recovery, circuit
    /// monitor (interval from `CircuitBreakerConfig::monitor_interval`),
    /// cache sweep/snapshot, sticky-session sweep.
    pub fn spawn_background_loops(&self, session_sweep_interval: std::time::Duration) {
        Arc::clone(&self.health_checker).spawn_background_loops();
        Arc::clone(&self.cache).spawn_sweep_loop();
        Arc::clone(&self.cache).spawn_snapshot_loop();
        Arc::clone(&self.load_balancer).spawn_session_sweep(session_sweep_interval);

        let breaker = Arc::clone(&self.circuit_breaker);
        let circuit_monitor_interval = self.circuit_monitor_interval;
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(circuit_monitor_interval);
            loop {
                timer.tick().await;
                breaker.tick();
            }
        });
    }
}
