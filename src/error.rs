// src/error.rs
// Error taxonomy for the MCP client runtime

use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Crate-wide result alias. Host-facing operations always return this,
/// never a bare `anyhow::Error`, so callers can match on error kind.
pub type McpResult<T> = Result<T, McpError>;

#[derive(Error, Debug)]
pub enum McpError {
    #[error("failed to encode request: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("failed to decode response: {0}")]
    Decoding(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("rpc error {code}: {message}")]
    RpcError {
        code: i64,
        message: String,
        data: Option<Value>,
    },

    #[error("{method} timed out after {timeout:?}")]
    RequestTimedOut { method: String, timeout: Duration },

    #[error("unsupported protocol version: {0}")]
    UnsupportedProtocolVersion(String),

    #[error("transport returned HTTP {code}")]
    TransportHttpStatus { code: u16, body: Option<String> },

    #[error("transport unavailable")]
    TransportUnavailable,

    #[error("server {server_id} is not connected")]
    NotConnected { server_id: Uuid },

    #[error("tool '{name}' denied by approval policy")]
    ToolDeniedByPolicy { name: String },

    #[error("cancelled: {reason}")]
    Cancelled { reason: String },

    #[error("transport error: {0}")]
    Transport(String),
}

impl McpError {
    pub fn decoding(msg: impl Into<String>) -> Self {
        Self::Decoding(msg.into())
    }

    pub fn invalid_response(msg: impl Into<String>) -> Self {
        Self::InvalidResponse(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled {
            reason: reason.into(),
        }
    }

    /// Whether this error represents a cooperative cancellation rather than a
    /// genuine failure. Host code should branch on this before treating the
    /// error as something to surface as a failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// `-32601` (method not found) is tolerated internally as "feature
    /// absent" for any method; `roots/list` additionally tolerates
    /// `-32602` (invalid params), since some servers reject the
    /// pagination envelope outright instead of reporting the capability
    /// missing. Used by both the JSON-RPC client's list helpers and the
    /// metadata refresh path, so the tolerance rule lives in one place.
    pub fn is_method_absent(&self, method: &str) -> bool {
        match self {
            Self::RpcError { code, .. } => {
                *code == -32601 || (method == "roots/list" && *code == -32602)
            }
            _ => false,
        }
    }
}

impl From<reqwest::Error> for McpError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_absent_detects_32601_for_any_method() {
        let err = McpError::RpcError {
            code: -32601,
            message: "method not found".into(),
            data: None,
        };
        assert!(err.is_method_absent("tools/list"));
        assert!(err.is_method_absent("roots/list"));
    }

    #[test]
    fn method_absent_32602_only_tolerated_for_roots_list() {
        let err = McpError::RpcError {
            code: -32602,
            message: "invalid params".into(),
            data: None,
        };
        assert!(!err.is_method_absent("tools/list"));
        assert!(err.is_method_absent("roots/list"));
    }

    #[test]
    fn cancellation_is_distinguished_from_other_errors() {
        let cancelled = McpError::cancelled("client cancelled request");
        assert!(cancelled.is_cancellation());

        let timed_out = McpError::RequestTimedOut {
            method: "tools/call".into(),
            timeout: Duration::from_secs(5),
        };
        assert!(!timed_out.is_cancellation());
    }
}
