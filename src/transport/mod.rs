// src/transport/mod.rs
// Transport trait: the unified contract every wire implementation speaks.
//
// A transport is polymorphic over the capability set named in the
// distilled spec (§4.2): `send_request`, `send_notification`, and an
// optional streaming channel carrying notifications, server→client
// requests, and (for the server-request case) the means to answer them.
//
// Cyclic ownership between manager and transport is avoided by message
// passing (REDESIGN FLAG, distilled §9): a transport is handed an
// `EventSink` at construction and pushes inbound notifications/requests
// through it; it never holds a reference back into the manager.

pub mod oauth;
pub mod sse_split;
pub mod streamable_http;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::McpResult;
use crate::protocol::JsonRpcId;

/// What a transport instance supports, so the connection manager can
/// decide whether to start a GET SSE reader, offer resumption, etc.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransportCapabilities {
    pub streaming: bool,
    pub resumption: bool,
}

/// An event pushed upstream from a transport's background reader into the
/// manager. Delivered in the order the reader observed them (distilled
/// §5, ordering guarantees).
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Notification {
        method: String,
        params: Option<Value>,
    },
    /// A server→client request (`sampling/createMessage`, `elicitation/create`).
    /// The dispatcher answers it by calling `Transport::send_response` on
    /// the same transport handle, keyed by `id`.
    ServerRequest {
        id: JsonRpcId,
        method: String,
        params: Option<Value>,
    },
    /// The transport's connection was lost; all pending requests have
    /// already been completed with a cancellation by the transport itself.
    Disconnected { reason: String },
}

pub type EventSink = mpsc::UnboundedSender<TransportEvent>;

/// Supplies fresh per-request headers, e.g. a bearer token that a dynamic
/// credential provider refreshes before expiry (distilled §4.2, the
/// OAuth-wrapped transport variant).
#[async_trait]
pub trait HeaderProvider: Send + Sync {
    async fn headers(&self) -> McpResult<std::collections::HashMap<String, String>>;
}

/// The outcome of a server→client request, as composed by a host handler
/// and sent back over the transport.
pub enum RpcOutcome {
    Result(Value),
    Error { code: i64, message: String },
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a JSON-RPC request and await its correlated response. The
    /// caller (the JSON-RPC client, §4.1) mints `id` so it can reference
    /// the same id in a subsequent `notifications/cancelled` if the call
    /// times out or is cancelled.
    async fn send_request(&self, id: JsonRpcId, method: &str, params: Option<Value>) -> McpResult<Value>;

    /// Fire-and-forget a JSON-RPC notification.
    async fn send_notification(&self, method: &str, params: Option<Value>) -> McpResult<()>;

    /// Answer a server→client request received via `TransportEvent::ServerRequest`.
    async fn send_response(&self, id: JsonRpcId, outcome: RpcOutcome) -> McpResult<()>;

    fn capabilities(&self) -> TransportCapabilities;

    /// The currently held session-id / resumption token, if any, so the
    /// manager can persist it across restarts (distilled §6).
    async fn resumption_token(&self) -> Option<String>;

    /// Release all pending-request entries with a cancellation error and
    /// tear down the background reader, if any.
    async fn disconnect(&self);
}
