//! Request validation, forwarding with retries, error classification, and
//! breaker/cache outcome recording.
//!
//! Generalizes the teacher's `UpstreamNode::call_rpc_internal` single
//! best-effort call (`upstream.rs`) into the validate → select → forward
//! (with retries) → record pipeline spec.md §4.5 requires.

use crate::cache::{self, Cache};
use crate::config::ProxyConfig;
use crate::error::GatewayError;
use crate::load_balancer::{LoadBalancer, Strategy};
use crate::types::{Network, RawRpcRequest, RpcRequest, RpcResponse};
use std::sync::Arc;

fn normalize_params(raw: Option<serde_json::Value>) -> Vec<serde_json::Value> {
    match raw {
        None => vec![],
        Some(serde_json::Value::Array(items)) => items,
        Some(scalar) => vec![scalar],
    }
}

/// Validates a single raw request, producing either a normalized
/// `RpcRequest` or an error response carrying the original id (or `null`
/// if unparseable).
fn validate_one(raw: RawRpcRequest) -> Result<RpcRequest, RpcResponse> {
    let id = match raw.id.clone() {
        Some(id) => id,
        None => return Err(RpcResponse::error(serde_json::Value::Null, -32600, "Invalid Request: missing id")),
    };

    if raw.jsonrpc.as_deref() != Some("2.0") {
        return Err(RpcResponse::error(id, -32600, "Invalid Request: jsonrpc must be \"2.0\""));
    }
    let method = match raw.method {
        Some(m) if !m.is_empty() => m,
        _ => return Err(RpcResponse::error(id, -32600, "Invalid Request: method missing or empty")),
    };

    Ok(RpcRequest {
        jsonrpc: "2.0".to_string(),
        method,
        params: normalize_params(raw.params),
        id,
    })
}

/// Per-entry validation outcome for a batch, aligned by array index with
/// the original body: exactly one of `requests[i]` / `errors[i]` is set.
pub struct BatchValidation {
    pub requests: Vec<Option<RpcRequest>>,
    pub errors: Vec<Option<RpcResponse>>,
}

pub fn validate_batch(items: &[serde_json::Value]) -> BatchValidation {
    let mut requests = Vec::with_capacity(items.len());
    let mut errors = Vec::with_capacity(items.len());

    for item in items {
        match serde_json::from_value::<RawRpcRequest>(item.clone()) {
            Ok(raw) => match validate_one(raw) {
                Ok(req) => {
                    requests.push(Some(req));
                    errors.push(None);
                }
                Err(err) => {
                    requests.push(None);
                    errors.push(Some(err));
                }
            },
            Err(_) => {
                requests.push(None);
                errors.push(Some(RpcResponse::error(serde_json::Value::Null, -32600, "Invalid Request")));
            }
        }
    }

    BatchValidation { requests, errors }
}

/// The single centralized parse step: downstream code matches on this
/// tagged sum type instead of re-deriving shape from raw JSON.
pub enum ParsedBody {
    Single(RpcRequest),
    SingleInvalid(RpcResponse),
    Batch(BatchValidation),
}

pub fn parse_body(body: &serde_json::Value) -> ParsedBody {
    match body {
        serde_json::Value::Array(items) => ParsedBody::Batch(validate_batch(items)),
        other => match serde_json::from_value::<RawRpcRequest>(other.clone()) {
            Ok(raw) => match validate_one(raw) {
                Ok(req) => ParsedBody::Single(req),
                Err(err) => ParsedBody::SingleInvalid(err),
            },
            Err(_) => ParsedBody::SingleInvalid(RpcResponse::error(serde_json::Value::Null, -32600, "Invalid Request")),
        },
    }
}

/// Gateway-level outcome of forwarding a single request, used by the HTTP
/// front-handler to pick the response status (spec.md §6): application
/// JSON-RPC errors passed through from upstream always stay 200; only
/// these gateway-originated failure classes override it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyOutcome {
    Ok,
    NoNode,
    GatewayTimeout,
    BadGateway,
}

/// Outcome of `forward_batch`: one selected node either returns the whole
/// batch or fails outright, never a per-entry mix.
enum BatchForward {
    Ok(Vec<RpcResponse>),
    NoNode,
    Failed(i32, String),
}

pub struct RpcProxy {
    client: reqwest::Client,
    config: ProxyConfig,
    load_balancer: Arc<LoadBalancer>,
    cache: Arc<Cache>,
}

impl RpcProxy {
    pub fn new(config: ProxyConfig, load_balancer: Arc<LoadBalancer>, cache: Arc<Cache>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .expect("failed to build proxy HTTP client");
        Self {
            client,
            config,
            load_balancer,
            cache,
        }
    }

    fn error_for_transport(err: reqwest::Error) -> GatewayError {
        if err.is_timeout() {
            GatewayError::Timeout
        } else if err.is_connect() {
            GatewayError::ConnectionRefused
        } else {
            GatewayError::Transport(err)
        }
    }

    fn error_for_status(status: reqwest::StatusCode) -> GatewayError {
        match status.as_u16() {
            401 => GatewayError::Unauthenticated,
            429 => GatewayError::RateLimited,
            other => GatewayError::Http(other),
        }
    }

    /// One attempt against `url`. Never touches the breaker; only the
    /// final outcome of `forward` does.
    async fn attempt(&self, url: &str, request: &RpcRequest) -> Result<RpcResponse, GatewayError> {
        let sent = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .header("User-Agent", "avax-rpc-gateway/0.1")
            .json(request)
            .send()
            .await;

        let response = sent.map_err(Self::error_for_transport)?;

        if !response.status().is_success() {
            return Err(Self::error_for_status(response.status()));
        }

        response.json::<RpcResponse>().await.map_err(GatewayError::from)
    }

    /// One attempt at POSTing the whole batch array to `url` as a single
    /// request.
    async fn attempt_batch(&self, url: &str, requests: &[RpcRequest]) -> Result<Vec<RpcResponse>, GatewayError> {
        let sent = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .header("User-Agent", "avax-rpc-gateway/0.1")
            .json(requests)
            .send()
            .await;

        let response = sent.map_err(Self::error_for_transport)?;

        if !response.status().is_success() {
            return Err(Self::error_for_status(response.status()));
        }

        response.json::<Vec<RpcResponse>>().await.map_err(GatewayError::from)
    }

    /// Forwards one validated request to a selected node, retrying up to
    /// `config.retries` additional times. Records the breaker/cache
    /// outcome only once, for the final attempt.
    pub async fn forward(
        &self,
        request: &RpcRequest,
        network: &Network,
        strategy: Strategy,
        capability: Option<&str>,
        session_id: Option<&str>,
    ) -> (RpcResponse, ProxyOutcome) {
        let node = match self.load_balancer.select(network, strategy, capability, session_id) {
            Some(n) => n,
            None => {
                return (
                    RpcResponse::error(request.id.clone(), -32006, "no admissible node"),
                    ProxyOutcome::NoNode,
                );
            }
        };

        let attempts = 1 + self.config.retries;
        let mut last_err: Option<GatewayError> = None;

        for attempt in 0..attempts {
            match self.attempt(&node.url, request).await {
                Ok(response) => {
                    self.load_balancer.record_successful_request(&node.id);
                    self.maybe_cache_single(request, &response);
                    if response.error.is_none() {
                        self.cache.invalidate_on_state_change(&request.method);
                    }
                    return (response, ProxyOutcome::Ok);
                }
                Err(err) => {
                    let retry = attempt + 1 < attempts;
                    last_err = Some(err);
                    if retry {
                        tokio::time::sleep(self.config.retry_delay).await;
                    }
                }
            }
        }

        self.load_balancer.record_failed_request(&node.id);
        let err = last_err.unwrap_or(GatewayError::Http(0));
        let outcome = if matches!(err, GatewayError::Timeout) {
            ProxyOutcome::GatewayTimeout
        } else {
            ProxyOutcome::BadGateway
        };
        (RpcResponse::error(request.id.clone(), err.code(), err.to_string()), outcome)
    }

    /// Forwards an entire batch as a single POST to one selected node,
    /// retrying that one call up to `config.retries` additional times.
    /// Breaker outcome is recorded once for the whole batch, matching
    /// `forward`'s one-outcome-per-call discipline.
    async fn forward_batch(
        &self,
        requests: &[RpcRequest],
        network: &Network,
        strategy: Strategy,
        capability: Option<&str>,
        session_id: Option<&str>,
    ) -> BatchForward {
        let node = match self.load_balancer.select(network, strategy, capability, session_id) {
            Some(n) => n,
            None => return BatchForward::NoNode,
        };

        let attempts = 1 + self.config.retries;
        let mut last_err: Option<GatewayError> = None;

        for attempt in 0..attempts {
            match self.attempt_batch(&node.url, requests).await {
                Ok(responses) => {
                    self.load_balancer.record_successful_request(&node.id);
                    for (req, resp) in requests.iter().zip(responses.iter()) {
                        self.maybe_cache_single(req, resp);
                        if resp.error.is_none() {
                            self.cache.invalidate_on_state_change(&req.method);
                        }
                    }
                    return BatchForward::Ok(responses);
                }
                Err(err) => {
                    let retry = attempt + 1 < attempts;
                    last_err = Some(err);
                    if retry {
                        tokio::time::sleep(self.config.retry_delay).await;
                    }
                }
            }
        }

        self.load_balancer.record_failed_request(&node.id);
        let err = last_err.unwrap_or(GatewayError::Http(0));
        BatchForward::Failed(err.code(), err.to_string())
    }

    fn maybe_cache_single(&self, request: &RpcRequest, response: &RpcResponse) {
        if response.is_error() || !cache::is_cacheable_method(&request.method) {
            return;
        }
        let key = cache::cache_key_single(&request.method, &request.params);
        let ttl = cache::ttl_for_method(&request.method);
        self.cache.set(
            key,
            serde_json::to_value(response).unwrap_or(serde_json::Value::Null),
            ttl,
        );
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub async fn handle_single(
        &self,
        request: RpcRequest,
        network: &Network,
        strategy: Strategy,
        capability: Option<&str>,
        session_id: Option<&str>,
    ) -> (RpcResponse, ProxyOutcome) {
        if cache::is_cacheable_method(&request.method) {
            let key = cache::cache_key_single(&request.method, &request.params);
            if let Some(cached) = self.cache.get(&key, &request.method) {
                if let Ok(response) = serde_json::from_value::<RpcResponse>(cached) {
                    return (response, ProxyOutcome::Ok);
                }
            }
        }
        self.forward(&request, network, strategy, capability, session_id).await
    }

    /// Forwards a whole batch as one POST to one selected node (spec.md
    /// §4.5): entries that failed validation never reach the upstream at
    /// all, and a transport failure on that single call is what splits
    /// back out into a per-entry error response, not independent per-entry
    /// node selection.
    pub async fn handle_batch(
        &self,
        validation: BatchValidation,
        network: &Network,
        strategy: Strategy,
        capability: Option<&str>,
        session_id: Option<&str>,
    ) -> Vec<RpcResponse> {
        let all_valid = validation.errors.iter().all(|e| e.is_none());
        let valid_requests: Vec<RpcRequest> = validation
            .requests
            .iter()
            .filter_map(|r| r.clone())
            .collect();

        let batch_key = if all_valid {
            cache::cache_key_batch(&valid_requests)
        } else {
            None
        };

        if let Some(ref key) = batch_key {
            if let Some(cached) = self.cache.get(key, "__batch__") {
                if let Ok(responses) = serde_json::from_value::<Vec<RpcResponse>>(cached) {
                    return responses;
                }
            }
        }

        if valid_requests.is_empty() {
            return validation
                .errors
                .into_iter()
                .map(|e| e.expect("every entry failed validation, so each has an error response"))
                .collect();
        }

        let forwarded = self
            .forward_batch(&valid_requests, network, strategy, capability, session_id)
            .await;

        let valid_responses: Vec<RpcResponse> = match forwarded {
            BatchForward::Ok(responses) => responses,
            BatchForward::NoNode => valid_requests
                .iter()
                .map(|r| RpcResponse::error(r.id.clone(), -32006, "no admissible node"))
                .collect(),
            BatchForward::Failed(code, message) => valid_requests
                .iter()
                .map(|r| RpcResponse::error(r.id.clone(), code, message.clone()))
                .collect(),
        };

        // Splice the forwarded/synthesized responses back in at the indices
        // that passed validation; entries that failed validation keep the
        // error response recorded for them up front.
        let mut valid_iter = valid_responses.into_iter();
        let results: Vec<RpcResponse> = validation
            .requests
            .into_iter()
            .zip(validation.errors.into_iter())
            .map(|(req, err)| match (req, err) {
                (_, Some(error_response)) => error_response,
                (Some(_), None) => valid_iter.next().expect("one response per valid request"),
                (None, None) => unreachable!("validate_batch always pairs a request or an error"),
            })
            .collect();

        if let Some(key) = batch_key {
            if results.iter().all(|r| !r.is_error()) {
                let ttl = cache::ttl_for_batch(&valid_requests);
                self.cache.set(key, serde_json::to_value(&results).unwrap_or(serde_json::Value::Null), ttl);
            }
        }

        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_version_is_invalid() {
        let body = serde_json::json!({"method": "eth_blockNumber", "params": [], "id": 1});
        match parse_body(&body) {
            ParsedBody::SingleInvalid(resp) => assert_eq!(resp.error.unwrap().code, -32600),
            _ => panic!("expected invalid"),
        }
    }

    #[test]
    fn missing_id_is_invalid() {
        let body = serde_json::json!({"jsonrpc": "2.0", "method": "eth_blockNumber"});
        match parse_body(&body) {
            ParsedBody::SingleInvalid(resp) => {
                assert_eq!(resp.error.unwrap().code, -32600);
                assert_eq!(resp.id, serde_json::Value::Null);
            }
            _ => panic!("expected invalid"),
        }
    }

    #[test]
    fn scalar_params_normalized_to_array() {
        let body = serde_json::json!({"jsonrpc": "2.0", "method": "eth_getBalance", "params": "0xabc", "id": 1});
        match parse_body(&body) {
            ParsedBody::Single(req) => assert_eq!(req.params, vec![serde_json::json!("0xabc")]),
            _ => panic!("expected single"),
        }
    }

    #[test]
    fn batch_with_one_invalid_entry_still_processes_others() {
        let items = vec![
            serde_json::json!({"jsonrpc": "2.0", "method": "eth_blockNumber", "params": [], "id": 1}),
            serde_json::json!({"jsonrpc": "1.0", "method": "eth_blockNumber", "id": 2}),
        ];
        let validation = validate_batch(&items);
        assert!(validation.requests[0].is_some());
        assert!(validation.errors[0].is_none());
        assert!(validation.requests[1].is_none());
        assert_eq!(validation.errors[1].as_ref().unwrap().error.as_ref().unwrap().code, -32600);
        assert_eq!(validation.errors[1].as_ref().unwrap().id, serde_json::json!(2));
    }

    #[test]
    fn empty_batch_array_is_empty_result() {
        match parse_body(&serde_json::json!([])) {
            ParsedBody::Batch(v) => assert!(v.requests.is_empty()),
            _ => panic!("expected batch"),
        }
    }

    // --- retry-path tests against a lightweight raw-TCP stub upstream ---

    use crate::circuit::CircuitBreaker;
    use crate::config::{CacheConfig, CircuitBreakerConfig, HealthCheckConfig};
    use crate::health::HealthChecker;
    use crate::registry::NodeRegistry;
    use crate::types::Node;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    enum StubBehavior {
        Disconnect,
        Hang,
        Respond(String),
    }

    async fn serve_one(listener: &TcpListener, behavior: StubBehavior) {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 1024];
        let _ = stream.read(&mut buf).await;
        match behavior {
            StubBehavior::Disconnect => drop(stream),
            StubBehavior::Hang => {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            StubBehavior::Respond(body) => {
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        }
    }

    fn make_proxy(url: String, retries: u32, timeout: Duration) -> (RpcProxy, Arc<CircuitBreaker>) {
        let registry = Arc::new(NodeRegistry::new(vec![Node::new("stub", url, Network::AvalancheMainnet)]));
        let circuit = Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default()));
        let health = Arc::new(HealthChecker::new(HealthCheckConfig::default(), Arc::clone(&registry)));
        let lb = Arc::new(LoadBalancer::new(
            Arc::clone(&registry),
            Arc::clone(&circuit),
            Arc::clone(&health),
            Duration::from_secs(600),
        ));
        let cache = Arc::new(Cache::new(CacheConfig {
            max_entries: 10,
            sweep_interval: Duration::from_secs(60),
            snapshot_path: None,
            snapshot_interval: Duration::from_secs(60),
        }));
        let proxy = RpcProxy::new(
            ProxyConfig {
                timeout,
                retries,
                retry_delay: Duration::from_millis(5),
            },
            lb,
            cache,
        );
        (proxy, circuit)
    }

    /// Seed scenario: first attempt fails, second succeeds. Breaker records
    /// one success and zero failures for the node.
    #[tokio::test]
    async fn retry_then_success_records_one_success_zero_failures() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let url = format!("http://{addr}");

        let server = tokio::spawn(async move {
            serve_one(&listener, StubBehavior::Disconnect).await;
            let body = serde_json::json!({"jsonrpc": "2.0", "result": "0x1", "id": 1}).to_string();
            serve_one(&listener, StubBehavior::Respond(body)).await;
        });

        let (proxy, circuit) = make_proxy(url, 1, Duration::from_millis(500));
        let request = RpcRequest {
            jsonrpc: "2.0".to_string(),
            method: "eth_blockNumber".to_string(),
            params: vec![],
            id: serde_json::json!(1),
        };

        let (response, outcome) = proxy
            .forward(&request, &Network::AvalancheMainnet, Strategy::RoundRobin, None, None)
            .await;

        server.await.unwrap();

        assert_eq!(outcome, ProxyOutcome::Ok);
        assert_eq!(response.result, Some(serde_json::json!("0x1")));
        let stats = circuit.stats("stub");
        assert_eq!(stats.cumulative_success, 1);
        assert_eq!(stats.cumulative_failure, 0);
    }

    /// Seed scenario: both attempts fail because every connection to the
    /// upstream times out. The breaker records one failure, and the
    /// synthesized error carries the timeout code.
    #[tokio::test]
    async fn exhausted_retries_return_timeout_error_code() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let url = format!("http://{addr}");

        let server = tokio::spawn(async move {
            loop {
                serve_one(&listener, StubBehavior::Hang).await;
            }
        });

        let (proxy, circuit) = make_proxy(url, 1, Duration::from_millis(50));
        let request = RpcRequest {
            jsonrpc: "2.0".to_string(),
            method: "eth_blockNumber".to_string(),
            params: vec![],
            id: serde_json::json!(1),
        };

        let (response, outcome) = proxy
            .forward(&request, &Network::AvalancheMainnet, Strategy::RoundRobin, None, None)
            .await;

        server.abort();

        assert_eq!(outcome, ProxyOutcome::GatewayTimeout);
        assert_eq!(response.error.unwrap().code, -32603);
        let stats = circuit.stats("stub");
        assert_eq!(stats.cumulative_failure, 1);
        assert_eq!(stats.cumulative_success, 0);
    }
}
