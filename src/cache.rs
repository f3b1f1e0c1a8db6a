//! Method-aware TTL cache with bounded size, eviction, and state-change
//! invalidation.
//!
//! Generalizes the teacher's single-TTL `lru_time_cache` (`cache.rs`) into
//! a per-method TTL table with explicit `expiresAt` timestamps, so
//! eviction and invalidation can follow spec-mandated rules instead of a
//! generic LRU policy. `parking_lot::RwLock` is kept for the same reason
//! the teacher chose it: speed, fairness, no poisoning.

use crate::config::CacheConfig;
use crate::types::RpcRequest;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, SystemTime};

const NON_CACHEABLE_PREFIXES: &[&str] = &[
    "eth_sendTransaction",
    "eth_sendRawTransaction",
    "eth_sign",
    "eth_signTransaction",
    "eth_submitWork",
    "eth_submitHashrate",
    "personal_",
    "admin_",
    "miner_",
    "debug_",
    "avax_issueTx",
    "avax_signTx",
];

/// (trigger method prefix, substrings of dependent cache keys to drop)
const INVALIDATION_RULES: &[(&str, &[&str])] = &[
    (
        "eth_sendTransaction",
        &["eth_getBalance", "eth_getTransactionCount", "eth_call"],
    ),
    (
        "eth_sendRawTransaction",
        &["eth_getBalance", "eth_getTransactionCount", "eth_call"],
    ),
    (
        "personal_sendTransaction",
        &["eth_getBalance", "eth_getTransactionCount"],
    ),
    (
        "avax_issueTx",
        &["avax_getPendingTxs", "avax_getAtomicTxStatus"],
    ),
];

pub fn ttl_for_method(method: &str) -> Duration {
    let ms = match method {
        "eth_blockNumber" => 5_000,
        "eth_gasPrice" => 10_000,
        "eth_call" => 10_000,
        "eth_getBalance" => 15_000,
        "eth_getTransactionCount" => 15_000,
        "eth_getLogs" => 30_000,
        "eth_getBlockByNumber" | "eth_getBlockByHash" => 60_000,
        "avax_getPendingTxs" => 5_000,
        "avax_getAtomicTxStatus" => 15_000,
        "avax_getAtomicTx" => 60_000,
        _ => 30_000,
    };
    Duration::from_millis(ms)
}

pub fn is_cacheable_method(method: &str) -> bool {
    !NON_CACHEABLE_PREFIXES.iter().any(|p| method.starts_with(p))
}

/// Recursively sorts object keys so that semantically-equal params
/// canonicalize to the same JSON text; arrays are emitted as-is and
/// numbers keep serde_json's shortest round-trippable representation.
fn canonicalize(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut sorted: Vec<(String, serde_json::Value)> = map
                .iter()
                .map(|(k, v)| (k.clone(), canonicalize(v)))
                .collect();
            sorted.sort_by(|a, b| a.0.cmp(&b.0));
            serde_json::Value::Object(sorted.into_iter().collect())
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(canonicalize).collect())
        }
        other => other.clone(),
    }
}

fn canonical_json(value: &serde_json::Value) -> String {
    serde_json::to_string(&canonicalize(value)).unwrap_or_default()
}

/// `method + "|" + canonicalJSON(params)` for one request.
pub fn cache_key_single(method: &str, params: &[serde_json::Value]) -> String {
    format!("{}|{}", method, canonical_json(&serde_json::Value::Array(params.to_vec())))
}

/// `"|"`-joined single-entry keys, in order; `None` if any entry is not
/// cacheable.
pub fn cache_key_batch(requests: &[RpcRequest]) -> Option<String> {
    if requests.iter().any(|r| !is_cacheable_method(&r.method)) {
        return None;
    }
    Some(
        requests
            .iter()
            .map(|r| cache_key_single(&r.method, &r.params))
            .collect::<Vec<_>>()
            .join("|"),
    )
}

pub fn ttl_for_batch(requests: &[RpcRequest]) -> Duration {
    requests
        .iter()
        .map(|r| ttl_for_method(&r.method))
        .min()
        .unwrap_or_else(|| Duration::from_millis(30_000))
}

struct StoredEntry {
    payload: serde_json::Value,
    expires_at: SystemTime,
}

#[derive(Default)]
struct MetricsInner {
    hits: u64,
    misses: u64,
    evictions: u64,
    per_method_hits: HashMap<String, u64>,
    per_method_misses: HashMap<String, u64>,
}

#[derive(Debug, Serialize)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub size: usize,
    pub max_entries: usize,
    pub hit_rate: f64,
    pub per_method_hits: HashMap<String, u64>,
    pub per_method_misses: HashMap<String, u64>,
}

pub struct Cache {
    config: CacheConfig,
    store: RwLock<HashMap<String, StoredEntry>>,
    metrics: RwLock<MetricsInner>,
}

impl Cache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            store: RwLock::new(HashMap::new()),
            metrics: RwLock::new(MetricsInner::default()),
        }
    }

    fn record_hit(&self, method: &str) {
        let mut m = self.metrics.write();
        m.hits += 1;
        *m.per_method_hits.entry(method.to_string()).or_default() += 1;
    }

    fn record_miss(&self, method: &str) {
        let mut m = self.metrics.write();
        m.misses += 1;
        *m.per_method_misses.entry(method.to_string()).or_default() += 1;
    }

    /// Lazily evicts on read: an expired entry is always a miss.
    pub fn get(&self, key: &str, method_for_metrics: &str) -> Option<serde_json::Value> {
        let now = SystemTime::now();
        let hit = {
            let mut store = self.store.write();
            match store.get(key) {
                Some(entry) if entry.expires_at > now => Some(entry.payload.clone()),
                Some(_) => {
                    store.remove(key);
                    None
                }
                None => None,
            }
        };

        match hit {
            Some(v) => {
                self.record_hit(method_for_metrics);
                Some(v)
            }
            None => {
                self.record_miss(method_for_metrics);
                None
            }
        }
    }

    /// Inserts `payload` under `key` with the given TTL. Callers must not
    /// call this for responses carrying an `error` field; the proxy
    /// enforces that before calling in.
    pub fn set(&self, key: String, payload: serde_json::Value, ttl: Duration) {
        let expires_at = SystemTime::now() + ttl;
        let mut store = self.store.write();
        store.insert(key, StoredEntry { payload, expires_at });

        if store.len() > self.config.max_entries {
            if let Some(evict_key) = store
                .iter()
                .min_by_key(|(_, e)| e.expires_at)
                .map(|(k, _)| k.clone())
            {
                store.remove(&evict_key);
                drop(store);
                self.metrics.write().evictions += 1;
            }
        }
    }

    /// Periodic sweep removing all expired entries.
    pub fn sweep_expired(&self) {
        let now = SystemTime::now();
        let mut store = self.store.write();
        store.retain(|_, e| e.expires_at > now);
    }

    pub fn spawn_sweep_loop(self: std::sync::Arc<Self>) {
        let interval = self.config.sweep_interval;
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            loop {
                timer.tick().await;
                self.sweep_expired();
            }
        });
    }

    /// Removes every entry whose key contains any substring triggered by
    /// `method` succeeding.
    pub fn invalidate_on_state_change(&self, method: &str) {
        let Some((_, substrings)) = INVALIDATION_RULES.iter().find(|(m, _)| method == *m) else {
            return;
        };
        let mut store = self.store.write();
        store.retain(|key, _| !substrings.iter().any(|s| key.contains(s)));
    }

    pub fn get_metrics(&self) -> CacheMetrics {
        let m = self.metrics.read();
        let total = m.hits + m.misses;
        CacheMetrics {
            hits: m.hits,
            misses: m.misses,
            evictions: m.evictions,
            size: self.store.read().len(),
            // Reports the configured capacity, not `metrics.size`; the
            // source's `getCacheStats` conflated the two.
            max_entries: self.config.max_entries,
            hit_rate: if total == 0 { 0.0 } else { m.hits as f64 / total as f64 },
            per_method_hits: m.per_method_hits.clone(),
            per_method_misses: m.per_method_misses.clone(),
        }
    }

    /// Serializes cacheable entries with at least 5 minutes of remaining
    /// TTL to a single JSON object, keyed by cache key.
    pub async fn save_snapshot(&self) {
        let Some(path) = self.config.snapshot_path.clone() else {
            return;
        };
        let min_remaining = Duration::from_secs(300);
        let now = SystemTime::now();

        let snapshot: HashMap<String, serde_json::Value> = {
            let store = self.store.read();
            store
                .iter()
                .filter_map(|(k, e)| {
                    let remaining = e.expires_at.duration_since(now).ok()?;
                    if remaining < min_remaining {
                        return None;
                    }
                    let expires_at_ms = e
                        .expires_at
                        .duration_since(SystemTime::UNIX_EPOCH)
                        .ok()?
                        .as_millis();
                    Some((
                        k.clone(),
                        serde_json::json!({ "data": e.payload, "expiresAt": expires_at_ms }),
                    ))
                })
                .collect()
        };

        if let Ok(text) = serde_json::to_string(&snapshot) {
            if let Err(e) = tokio::fs::write(&path, text).await {
                tracing::warn!("failed to write cache snapshot to {}: {}", path, e);
            }
        }
    }

    pub fn spawn_snapshot_loop(self: std::sync::Arc<Self>) {
        let interval = self.config.snapshot_interval;
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            loop {
                timer.tick().await;
                self.save_snapshot().await;
            }
        });
    }

    /// Loads a previously-written snapshot at startup. A missing file is
    /// not an error.
    pub async fn load_snapshot(&self) {
        let Some(path) = self.config.snapshot_path.clone() else {
            return;
        };
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(t) => t,
            Err(_) => return,
        };
        let Ok(snapshot) = serde_json::from_str::<HashMap<String, serde_json::Value>>(&text) else {
            tracing::warn!("cache snapshot at {} is not valid JSON, ignoring", path);
            return;
        };

        let now_ms = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();

        let mut store = self.store.write();
        for (key, entry) in snapshot {
            let (Some(data), Some(expires_at_ms)) = (
                entry.get("data").cloned(),
                entry.get("expiresAt").and_then(|v| v.as_u64()),
            ) else {
                continue;
            };
            if (expires_at_ms as u128) <= now_ms {
                continue;
            }
            let expires_at = SystemTime::UNIX_EPOCH
                + Duration::from_millis(expires_at_ms);
            store.insert(key, StoredEntry { payload: data, expires_at });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_entries: usize) -> CacheConfig {
        CacheConfig {
            max_entries,
            sweep_interval: Duration::from_secs(60),
            snapshot_path: None,
            snapshot_interval: Duration::from_secs(60),
        }
    }

    #[test]
    fn round_trip_within_ttl() {
        let cache = Cache::new(config(10));
        let key = cache_key_single("eth_blockNumber", &[]);
        cache.set(key.clone(), serde_json::json!({"result": "0x1234"}), Duration::from_millis(50));
        assert!(cache.get(&key, "eth_blockNumber").is_some());
    }

    #[test]
    fn miss_after_expiry() {
        let cache = Cache::new(config(10));
        let key = cache_key_single("eth_blockNumber", &[]);
        cache.set(key.clone(), serde_json::json!({"result": "0x1"}), Duration::from_millis(10));
        std::thread::sleep(Duration::from_millis(20));
        assert!(cache.get(&key, "eth_blockNumber").is_none());
    }

    #[test]
    fn non_cacheable_methods_are_rejected_before_reaching_cache() {
        assert!(!is_cacheable_method("eth_sendTransaction"));
        assert!(!is_cacheable_method("personal_sign"));
        assert!(!is_cacheable_method("debug_traceTransaction"));
        assert!(is_cacheable_method("eth_call"));
    }

    #[test]
    fn eviction_removes_earliest_expiry_over_capacity() {
        let cache = Cache::new(config(2));
        cache.set("k1".into(), serde_json::json!(1), Duration::from_millis(10));
        cache.set("k2".into(), serde_json::json!(2), Duration::from_secs(60));
        cache.set("k3".into(), serde_json::json!(3), Duration::from_secs(60));

        assert!(cache.get("k1", "m").is_none());
        assert!(cache.get("k2", "m").is_some());
        assert!(cache.get("k3", "m").is_some());
    }

    #[test]
    fn invalidation_drops_dependent_keys() {
        let cache = Cache::new(config(10));
        let balance_key = cache_key_single("eth_getBalance", &[serde_json::json!("0xabc")]);
        cache.set(balance_key.clone(), serde_json::json!({"result": "0x1"}), Duration::from_secs(60));

        cache.invalidate_on_state_change("eth_sendTransaction");

        assert!(cache.get(&balance_key, "eth_getBalance").is_none());
    }

    #[test]
    fn canonicalization_is_stable_across_key_order() {
        let a = canonical_json(&serde_json::json!({"b": 1, "a": 2}));
        let b = canonical_json(&serde_json::json!({"a": 2, "b": 1}));
        assert_eq!(a, b);
    }

    #[test]
    fn get_metrics_reports_configured_capacity_not_current_size() {
        let cache = Cache::new(config(500));
        cache.set("k1".into(), serde_json::json!(1), Duration::from_secs(60));
        let metrics = cache.get_metrics();
        assert_eq!(metrics.max_entries, 500);
        assert_eq!(metrics.size, 1);
    }

    #[test]
    fn batch_key_is_none_if_any_entry_uncacheable() {
        let requests = vec![
            RpcRequest {
                jsonrpc: "2.0".into(),
                method: "eth_blockNumber".into(),
                params: vec![],
                id: serde_json::json!(1),
            },
            RpcRequest {
                jsonrpc: "2.0".into(),
                method: "eth_sendTransaction".into(),
                params: vec![],
                id: serde_json::json!(2),
            },
        ];
        assert!(cache_key_batch(&requests).is_none());
    }
}
