//! Per-node CLOSED/OPEN/HALF_OPEN circuit breaker.
//!
//! Generalizes the teacher's `UpstreamNode` Healthy/Unhealthy cooldown
//! logic (`upstream.rs`) into the full three-state machine, keeping the
//! same "lazily create state on first observation" lifecycle.

use crate::config::CircuitBreakerConfig;
use crate::types::{CircuitState, CircuitStats, NodeId};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::SystemTime;

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    stats: RwLock<HashMap<NodeId, CircuitStats>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            stats: RwLock::new(HashMap::new()),
        }
    }

    fn entry<'a>(
        stats: &'a mut HashMap<NodeId, CircuitStats>,
        id: &str,
    ) -> &'a mut CircuitStats {
        stats.entry(id.to_string()).or_default()
    }

    pub fn record_success(&self, id: &str) {
        let mut stats = self.stats.write();
        let s = Self::entry(&mut stats, id);
        s.consecutive_failures = 0;
        s.consecutive_successes += 1;
        s.cumulative_success += 1;
        s.last_success_at = Some(SystemTime::now());

        if s.state == CircuitState::HalfOpen && s.consecutive_successes >= self.config.success_threshold
        {
            s.state = CircuitState::Closed;
            s.opened_at = None;
            s.consecutive_failures = 0;
            tracing::info!("circuit for node {} closed after recovery", id);
        }
    }

    pub fn record_failure(&self, id: &str) {
        let mut stats = self.stats.write();
        let s = Self::entry(&mut stats, id);
        s.consecutive_successes = 0;
        s.consecutive_failures += 1;
        s.cumulative_failure += 1;
        s.last_failure_at = Some(SystemTime::now());

        match s.state {
            CircuitState::Closed if s.consecutive_failures >= self.config.failure_threshold => {
                s.state = CircuitState::Open;
                s.opened_at = Some(SystemTime::now());
                tracing::warn!("circuit for node {} opened after {} failures", id, s.consecutive_failures);
            }
            CircuitState::HalfOpen => {
                s.state = CircuitState::Open;
                s.opened_at = Some(SystemTime::now());
                tracing::warn!("circuit for node {} re-opened during half-open probe", id);
            }
            _ => {}
        }
    }

    /// Whether a request may be dispatched to `id` right now. Performs the
    /// eager OPEN → HALF_OPEN transition when `resetTimeout` has elapsed.
    pub fn is_allowed(&self, id: &str) -> bool {
        let mut stats = self.stats.write();
        let s = Self::entry(&mut stats, id);
        match s.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = s
                    .opened_at
                    .and_then(|t| SystemTime::now().duration_since(t).ok())
                    .unwrap_or_default();
                if elapsed >= self.config.reset_timeout {
                    s.state = CircuitState::HalfOpen;
                    s.consecutive_successes = 0;
                    tracing::info!("circuit for node {} half-open, admitting probe", id);
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => s.consecutive_successes < self.config.success_threshold,
        }
    }

    /// Periodic monitor tick: proactively moves eligible OPEN circuits to
    /// HALF_OPEN so the selector sees them even without an inbound request.
    pub fn tick(&self) {
        let mut stats = self.stats.write();
        for (id, s) in stats.iter_mut() {
            if s.state == CircuitState::Open {
                let elapsed = s
                    .opened_at
                    .and_then(|t| SystemTime::now().duration_since(t).ok())
                    .unwrap_or_default();
                if elapsed >= self.config.reset_timeout {
                    s.state = CircuitState::HalfOpen;
                    s.consecutive_successes = 0;
                    tracing::info!("circuit monitor moved node {} to half-open", id);
                }
            }
        }
    }

    /// Forces CLOSED, clearing transient counters but preserving lifetime
    /// totals.
    pub fn reset_circuit(&self, id: &str) {
        let mut stats = self.stats.write();
        let s = Self::entry(&mut stats, id);
        s.state = CircuitState::Closed;
        s.consecutive_failures = 0;
        s.consecutive_successes = 0;
        s.opened_at = None;
    }

    pub fn stats(&self, id: &str) -> CircuitStats {
        self.stats.read().get(id).cloned().unwrap_or_default()
    }

    pub fn state(&self, id: &str) -> CircuitState {
        self.stats.read().get(id).map(|s| s.state).unwrap_or(CircuitState::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn breaker(failure_threshold: u32, success_threshold: u32, reset_timeout: Duration) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold,
            success_threshold,
            reset_timeout,
            monitor_interval: Duration::from_secs(5),
        })
    }

    #[test]
    fn opens_at_exactly_failure_threshold() {
        let cb = breaker(3, 2, Duration::from_secs(30));
        cb.record_failure("a");
        cb.record_failure("a");
        assert_eq!(cb.state("a"), CircuitState::Closed);
        cb.record_failure("a");
        assert_eq!(cb.state("a"), CircuitState::Open);
    }

    #[test]
    fn full_round_trip() {
        let cb = breaker(3, 2, Duration::from_millis(50));
        cb.record_failure("a");
        cb.record_failure("a");
        cb.record_failure("a");
        assert_eq!(cb.state("a"), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(60));
        assert!(cb.is_allowed("a"));
        assert_eq!(cb.state("a"), CircuitState::HalfOpen);

        cb.record_success("a");
        assert_eq!(cb.state("a"), CircuitState::HalfOpen);
        cb.record_success("a");
        assert_eq!(cb.state("a"), CircuitState::Closed);

        let stats = cb.stats("a");
        assert_eq!(stats.consecutive_failures, 0);
        assert_eq!(stats.consecutive_successes, 0);
        assert!(stats.opened_at.is_none());

        cb.record_failure("a");
        cb.record_failure("a");
        cb.record_failure("a");
        assert_eq!(cb.state("a"), CircuitState::Open);
    }

    #[test]
    fn half_open_failure_reopens() {
        let cb = breaker(1, 2, Duration::from_millis(10));
        cb.record_failure("a");
        std::thread::sleep(Duration::from_millis(15));
        assert!(cb.is_allowed("a"));
        assert_eq!(cb.state("a"), CircuitState::HalfOpen);
        cb.record_failure("a");
        assert_eq!(cb.state("a"), CircuitState::Open);
    }

    #[test]
    fn one_less_than_success_threshold_stays_half_open() {
        let cb = breaker(1, 2, Duration::from_millis(10));
        cb.record_failure("a");
        std::thread::sleep(Duration::from_millis(15));
        cb.is_allowed("a");
        cb.record_success("a");
        assert_eq!(cb.state("a"), CircuitState::HalfOpen);
    }

    #[test]
    fn reset_preserves_lifetime_totals() {
        let cb = breaker(1, 2, Duration::from_secs(30));
        cb.record_failure("a");
        cb.record_success("a");
        cb.record_success("a");
        let before = cb.stats("a");
        cb.reset_circuit("a");
        let after = cb.stats("a");
        assert_eq!(after.state, CircuitState::Closed);
        assert_eq!(after.cumulative_failure, before.cumulative_failure);
        assert_eq!(after.cumulative_success, before.cumulative_success);
    }

    #[test]
    fn monitor_tick_transitions_without_inbound_request() {
        let cb = breaker(1, 2, Duration::from_millis(10));
        cb.record_failure("a");
        assert_eq!(cb.state("a"), CircuitState::Open);
        std::thread::sleep(Duration::from_millis(15));
        cb.tick();
        assert_eq!(cb.state("a"), CircuitState::HalfOpen);
    }

    /// Many threads hammering `record_failure`/`record_success` on the same
    /// node concurrently must not lose or double-count an update.
    #[test]
    fn concurrent_failure_and_success_tracking_loses_no_updates() {
        let cb = Arc::new(breaker(1_000_000, 2, Duration::from_secs(30)));
        let threads: u64 = 8;
        let ops_per_thread: u64 = 200;

        let handles: Vec<_> = (0..threads)
            .map(|i| {
                let cb = Arc::clone(&cb);
                std::thread::spawn(move || {
                    for j in 0..ops_per_thread {
                        if (i + j) % 2 == 0 {
                            cb.record_failure("a");
                        } else {
                            cb.record_success("a");
                        }
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        let stats = cb.stats("a");
        assert_eq!(stats.cumulative_failure + stats.cumulative_success, threads * ops_per_thread);
        // failure_threshold is set unreachably high, so the breaker never trips.
        assert_eq!(stats.state, CircuitState::Closed);
    }
}
