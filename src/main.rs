use avax_rpc_gateway::{Gateway, config, health, load_balancer, proxy, registry, types};

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::IntoResponse,
    routing::{get, post},
};
use config::GatewayConfig;
use load_balancer::Strategy;
use proxy::{ParsedBody, ProxyOutcome, RpcProxy};
use std::collections::HashMap;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use types::{Network, RpcResponse};

#[derive(Clone)]
struct AppState {
    proxy: Arc<RpcProxy>,
    default_network: Arc<Network>,
    health_checker: Arc<health::HealthChecker>,
    registry: Arc<registry::NodeRegistry>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "avax_rpc_gateway=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Avalanche/EVM JSON-RPC gateway");

    let config = GatewayConfig::from_env();
    tracing::info!("Configured {} upstream nodes", config.nodes.len());
    for node in &config.nodes {
        tracing::info!("  - {}: {} ({})", node.id, node.url, node.network.as_str());
    }

    let session_sweep_interval = config.sticky_sessions.sweep_interval;
    let default_network = config.default_network.clone();
    let gateway = Gateway::new(config);
    gateway.cache.load_snapshot().await;
    gateway.spawn_background_loops(session_sweep_interval);

    let state = AppState {
        proxy: Arc::clone(&gateway.proxy),
        default_network: Arc::new(default_network),
        health_checker: Arc::clone(&gateway.health_checker),
        registry: Arc::clone(&gateway.registry),
    };

    let app = Router::new()
        .route("/", post(handle_rpc_request))
        .route("/rpc", post(handle_rpc_request))
        .route("/health", get(health_check))
        .route("/status", get(status_check))
        .route("/admin/nodes/{id}/enable", post(enable_node))
        .route("/admin/nodes/{id}/disable", post(disable_node))
        .with_state(state)
        .layer(tower_http::cors::CorsLayer::permissive())
        .layer(tower_http::trace::TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind("0.0.0.0:8080")
        .await
        .expect("failed to bind to port 8080");

    tracing::info!("Listening on http://0.0.0.0:8080");

    axum::serve(listener, app).await.expect("server failed to start");
}

struct RequestContext {
    network: Network,
    strategy: Strategy,
    capability: Option<String>,
    session_id: String,
    session_is_new: bool,
}

fn extract_session_id(headers: &HeaderMap) -> Option<String> {
    if let Some(header_value) = headers.get("x-session-id").and_then(|v| v.to_str().ok()) {
        return Some(header_value.to_string());
    }
    let cookie_header = headers.get(header::COOKIE)?.to_str().ok()?;
    for part in cookie_header.split(';') {
        let part = part.trim();
        if let Some(value) = part.strip_prefix("avax_session=") {
            return Some(value.to_string());
        }
    }
    None
}

fn build_context(headers: &HeaderMap, query: &HashMap<String, String>, default_network: &Network) -> RequestContext {
    let network = query
        .get("network")
        .map(|tag| Network::parse(tag))
        .unwrap_or_else(|| default_network.clone());
    let strategy = query.get("strategy").map(|s| Strategy::parse(s)).unwrap_or(Strategy::HealthBased);
    let capability = query.get("capability").cloned();

    let (session_id, session_is_new) = match extract_session_id(headers) {
        Some(id) => (id, false),
        None => (uuid::Uuid::new_v4().to_string(), true),
    };

    RequestContext {
        network,
        strategy,
        capability,
        session_id,
        session_is_new,
    }
}

fn with_session_cookie(mut response: axum::response::Response, ctx: &RequestContext) -> axum::response::Response {
    if ctx.session_is_new {
        if let Ok(value) = HeaderValue::from_str(&format!(
            "avax_session={}; Path=/; Max-Age=600; SameSite=Strict",
            ctx.session_id
        )) {
            response.headers_mut().insert(header::SET_COOKIE, value);
        }
    }
    response
}

fn proxy_outcome_status(outcome: ProxyOutcome) -> StatusCode {
    match outcome {
        ProxyOutcome::Ok => StatusCode::OK,
        ProxyOutcome::NoNode => StatusCode::SERVICE_UNAVAILABLE,
        ProxyOutcome::GatewayTimeout => StatusCode::GATEWAY_TIMEOUT,
        ProxyOutcome::BadGateway => StatusCode::BAD_GATEWAY,
    }
}

async fn handle_rpc_request(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    if body.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(RpcResponse::error(serde_json::Value::Null, -32700, "empty request body")),
        )
            .into_response();
    }

    let parsed: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(RpcResponse::error(serde_json::Value::Null, -32700, "parse error")),
            )
                .into_response();
        }
    };

    let ctx = build_context(&headers, &query, &state.default_network);
    let capability = ctx.capability.as_deref();

    let response = match proxy::parse_body(&parsed) {
        ParsedBody::Single(request) => {
            tracing::info!("received RPC request: method={}", request.method);
            let (rpc_response, outcome) = state
                .proxy
                .handle_single(request, &ctx.network, ctx.strategy, capability, Some(&ctx.session_id))
                .await;
            let mut resp = (proxy_outcome_status(outcome), Json(rpc_response)).into_response();
            resp.headers_mut()
                .insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
            resp
        }
        ParsedBody::SingleInvalid(error_response) => {
            (StatusCode::OK, Json(error_response)).into_response()
        }
        ParsedBody::Batch(validation) => {
            let responses = state
                .proxy
                .handle_batch(validation, &ctx.network, ctx.strategy, capability, Some(&ctx.session_id))
                .await;
            (StatusCode::OK, Json(responses)).into_response()
        }
    };

    with_session_cookie(response, &ctx)
}

async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.health_checker.get_health_report()))
}

async fn status_check(State(state): State<AppState>) -> impl IntoResponse {
    let nodes = state.registry.list_all();
    let status = serde_json::json!({
        "nodes": nodes.iter().map(|n| serde_json::json!({
            "id": n.id,
            "network": n.network.as_str(),
            "healthy": n.healthy,
        })).collect::<Vec<_>>()
    });
    (StatusCode::OK, Json(status))
}

async fn enable_node(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    state.health_checker.force_update_health(&id, true);
    (StatusCode::OK, Json(serde_json::json!({"id": id, "healthy": true})))
}

async fn disable_node(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    state.health_checker.force_update_health(&id, false);
    (StatusCode::OK, Json(serde_json::json!({"id": id, "healthy": false})))
}
