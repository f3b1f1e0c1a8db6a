//! Typed gateway errors and their mapping onto JSON-RPC error codes.

use crate::types::RpcError;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("no admissible node for network {network}")]
    NoNode { network: String },

    #[error("upstream timed out")]
    Timeout,

    #[error("upstream connection refused")]
    ConnectionRefused,

    #[error("upstream authentication failed")]
    Unauthenticated,

    #[error("upstream rate limited the request")]
    RateLimited,

    #[error("upstream returned HTTP {0}")]
    Http(u16),

    #[error("circuit open, no admissible node")]
    CircuitOpen,

    #[error("method not found: {0}")]
    MethodNotFound(String),

    #[error(transparent)]
    Transport(#[from] reqwest::Error),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

impl GatewayError {
    /// Maps this error onto the JSON-RPC error code taxonomy (spec §7).
    pub fn code(&self) -> i32 {
        match self {
            GatewayError::InvalidRequest(_) => -32600,
            GatewayError::MethodNotFound(_) => -32601,
            GatewayError::Unauthenticated => -32001,
            GatewayError::NoNode { .. } => -32003,
            GatewayError::ConnectionRefused => -32003,
            GatewayError::RateLimited => -32005,
            GatewayError::CircuitOpen => -32006,
            GatewayError::Timeout => -32603,
            GatewayError::Http(_) => -32000,
            GatewayError::Transport(e) if e.is_timeout() => -32603,
            GatewayError::Transport(e) if e.is_connect() => -32003,
            GatewayError::Transport(_) => -32000,
            GatewayError::Serde(_) => -32007,
        }
    }

    pub fn to_rpc_error(&self) -> RpcError {
        RpcError {
            code: self.code(),
            message: self.to_string(),
            data: None,
        }
    }
}
