// src/transport/streamable_http.rs
// Streamable-HTTP transport (distilled §4.3): a single endpoint carrying
// JSON-RPC over HTTP POST, with inline SSE responses, a long-poll GET SSE
// channel for server→client push, session-id tracking, and
// `Last-Event-ID` based resumption.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{McpError, McpResult};
use crate::protocol::{InboundMessage, JsonRpcId, JsonRpcResponse, JSONRPC_VERSION};
use crate::transport::{EventSink, HeaderProvider, RpcOutcome, Transport, TransportCapabilities, TransportEvent};

type PendingMap = Mutex<HashMap<String, oneshot::Sender<McpResult<Value>>>>;

pub struct StreamableHttpTransport {
    client: Client,
    endpoint: reqwest::Url,
    session_id: RwLock<Option<String>>,
    protocol_version: RwLock<String>,
    static_headers: HashMap<String, String>,
    header_provider: Option<Arc<dyn HeaderProvider>>,
    pending: PendingMap,
    event_sink: EventSink,
    last_event_id: RwLock<Option<String>>,
    sse_task: Mutex<Option<JoinHandle<()>>>,
    sse_supported: AtomicBool,
    self_weak: Weak<Self>,
}

impl StreamableHttpTransport {
    /// Builds the transport inside its own `Arc` via `Arc::new_cyclic` so
    /// `send_request` can re-arm and restart the GET SSE reader from a
    /// late `202 Accepted` without the caller threading an `Arc<Self>`
    /// handle down into it.
    pub fn new(
        endpoint: reqwest::Url,
        protocol_version: impl Into<String>,
        static_headers: HashMap<String, String>,
        header_provider: Option<Arc<dyn HeaderProvider>>,
        event_sink: EventSink,
        resumption_token: Option<String>,
    ) -> Arc<Self> {
        let client = Client::builder()
            .build()
            .expect("reqwest client construction cannot fail under default TLS settings");
        let protocol_version = protocol_version.into();
        Arc::new_cyclic(|weak| Self {
            client,
            endpoint,
            session_id: RwLock::new(None),
            protocol_version: RwLock::new(protocol_version),
            static_headers,
            header_provider,
            pending: Mutex::new(HashMap::new()),
            event_sink,
            last_event_id: RwLock::new(resumption_token),
            sse_task: Mutex::new(None),
            sse_supported: AtomicBool::new(true),
            self_weak: weak.clone(),
        })
    }

    pub async fn set_protocol_version(&self, version: impl Into<String>) {
        *self.protocol_version.write().await = version.into();
    }

    async fn base_headers(&self) -> McpResult<reqwest::header::HeaderMap> {
        use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
        let mut headers = HeaderMap::new();
        headers.insert(
            "MCP-Protocol-Version",
            HeaderValue::from_str(&self.protocol_version.read().await).unwrap(),
        );
        if let Some(session) = self.session_id.read().await.as_ref() {
            headers.insert("MCP-Session-Id", HeaderValue::from_str(session).unwrap());
        }
        for (k, v) in &self.static_headers {
            if let (Ok(name), Ok(value)) = (HeaderName::try_from(k.as_str()), HeaderValue::from_str(v)) {
                headers.insert(name, value);
            }
        }
        if let Some(provider) = &self.header_provider {
            for (k, v) in provider.headers().await? {
                if let (Ok(name), Ok(value)) = (HeaderName::try_from(k.as_str()), HeaderValue::from_str(&v)) {
                    headers.insert(name, value);
                }
            }
        }
        Ok(headers)
    }

    fn adopt_session_header(&self, response: &reqwest::Response) -> Option<String> {
        response
            .headers()
            .get("MCP-Session-Id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }

    /// POST one JSON-RPC message (request, notification, or a response we
    /// are sending back to the server) and classify the outcome.
    async fn post(&self, body: &Value) -> McpResult<PostOutcome> {
        let headers = self.base_headers().await?;
        let response = self
            .client
            .post(self.endpoint.clone())
            .headers(headers)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream")
            .json(body)
            .send()
            .await?;

        if let Some(session) = self.adopt_session_header(&response) {
            *self.session_id.write().await = Some(session);
        }

        match response.status() {
            StatusCode::ACCEPTED => Ok(PostOutcome::Accepted),
            StatusCode::NOT_FOUND => Ok(PostOutcome::StaleSession),
            status if status.is_success() => {
                let is_event_stream = response
                    .headers()
                    .get(reqwest::header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .map(|ct| ct.contains("text/event-stream"))
                    .unwrap_or(false);
                if is_event_stream {
                    let events = self.drain_inline_sse(response).await?;
                    Ok(PostOutcome::InlineEvents(events))
                } else {
                    let value: Value = response.json().await.map_err(McpError::from)?;
                    Ok(PostOutcome::Json(value))
                }
            }
            status => {
                let body = response.text().await.ok();
                Ok(PostOutcome::HttpError {
                    code: status.as_u16(),
                    body,
                })
            }
        }
    }

    /// Parse every event out of an inline `text/event-stream` POST
    /// response body. Per the distilled spec's open question, resolution
    /// is to correlate strictly by id rather than taking "the last `data:`
    /// event wins" (noted as the safer reading in DESIGN.md).
    async fn drain_inline_sse(&self, response: reqwest::Response) -> McpResult<Vec<InboundMessage>> {
        let mut stream = response.bytes_stream().eventsource();
        let mut out = Vec::new();
        while let Some(event) = stream.next().await {
            let event = match event {
                Ok(e) => e,
                Err(e) => {
                    warn!("inline SSE parse error: {e}");
                    break;
                }
            };
            if event.event == "error" {
                warn!("server sent SSE error event: {}", event.data);
                continue;
            }
            let data = event.data.trim();
            if data.is_empty() || data == "[DONE]" {
                continue;
            }
            if let Some(id) = &event.id {
                if !id.is_empty() {
                    *self.last_event_id.write().await = Some(id.clone());
                }
            }
            let value: Value = match serde_json::from_str(data) {
                Ok(v) => v,
                Err(e) => {
                    warn!("failed to decode inline SSE payload: {e}");
                    continue;
                }
            };
            if let Some(msg) = InboundMessage::parse(&value) {
                out.push(msg);
            }
        }
        Ok(out)
    }

    async fn dispatch_non_matching(&self, msg: InboundMessage, awaited_key: &str) -> Option<McpResult<Value>> {
        match msg {
            InboundMessage::Response(resp) => {
                let key = resp.id.as_key();
                let outcome = response_to_outcome(resp);
                if key == awaited_key {
                    Some(outcome)
                } else {
                    self.complete_pending(&key, outcome).await;
                    None
                }
            }
            InboundMessage::Notification { method, params } => {
                let _ = self.event_sink.send(TransportEvent::Notification { method, params });
                None
            }
            InboundMessage::ServerRequest { id, method, params } => {
                let _ = self.event_sink.send(TransportEvent::ServerRequest { id, method, params });
                None
            }
        }
    }

    async fn complete_pending(&self, key: &str, outcome: McpResult<Value>) {
        if let Some(tx) = self.pending.lock().await.remove(key) {
            let _ = tx.send(outcome);
        }
    }

    /// A late `202 Accepted` after the GET loop was downgraded (405, or a
    /// non-SSE content type) means the server expects us to still be
    /// listening; re-arm `sse_supported` so `ensure_sse_reader` actually
    /// re-probes instead of bailing on its downgraded-flag short circuit.
    /// Returns whether a re-arm happened, for tests.
    fn rearm_sse_if_downgraded(&self) -> bool {
        if self.sse_supported.load(Ordering::Relaxed) {
            return false;
        }
        debug!("202 Accepted while GET SSE is downgraded; re-probing");
        self.sse_supported.store(true, Ordering::Relaxed);
        true
    }

    /// Spawn the long-poll GET SSE reader if one isn't already running and
    /// the server is known to support it.
    async fn ensure_sse_reader(self: &Arc<Self>) {
        if !self.sse_supported.load(Ordering::Relaxed) {
            return;
        }
        let mut guard = self.sse_task.lock().await;
        if guard.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let this = Arc::clone(self);
        *guard = Some(tokio::spawn(async move {
            this.run_sse_reader().await;
        }));
    }

    async fn run_sse_reader(&self) {
        let headers = match self.base_headers().await {
            Ok(h) => h,
            Err(e) => {
                warn!("could not build headers for SSE GET: {e}");
                return;
            }
        };
        let mut request = self
            .client
            .get(self.endpoint.clone())
            .headers(headers)
            .header("Accept", "text/event-stream");
        if let Some(last_id) = self.last_event_id.read().await.clone() {
            request = request.header("Last-Event-ID", last_id);
        }

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => {
                debug!("SSE GET connection failed: {e}");
                return;
            }
        };

        match response.status() {
            StatusCode::METHOD_NOT_ALLOWED => {
                self.sse_supported.store(false, Ordering::Relaxed);
                debug!("server does not support streaming GET; downgrading silently");
                return;
            }
            status if !status.is_success() => {
                debug!("SSE GET returned unexpected status {status}");
                return;
            }
            _ => {}
        }
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        if !content_type.contains("text/event-stream") {
            self.sse_supported.store(false, Ordering::Relaxed);
            debug!("server replied to GET with {content_type}, not SSE; downgrading silently");
            return;
        }

        let mut stream = response.bytes_stream().eventsource();
        while let Some(event) = stream.next().await {
            let event = match event {
                Ok(e) => e,
                Err(e) => {
                    debug!("SSE GET stream ended: {e}");
                    break;
                }
            };
            if event.event == "error" {
                warn!("server sent SSE error event on GET channel: {}", event.data);
                continue;
            }
            let data = event.data.trim();
            if data.is_empty() || data == "[DONE]" {
                continue;
            }
            if !event.id.is_empty() {
                *self.last_event_id.write().await = Some(event.id.clone());
            }
            let value: Value = match serde_json::from_str(data) {
                Ok(v) => v,
                Err(e) => {
                    warn!("failed to decode GET SSE payload: {e}");
                    continue;
                }
            };
            let Some(msg) = InboundMessage::parse(&value) else {
                continue;
            };
            match msg {
                InboundMessage::Response(resp) => {
                    let key = resp.id.as_key();
                    let outcome = response_to_outcome(resp);
                    self.complete_pending(&key, outcome).await;
                }
                InboundMessage::Notification { method, params } => {
                    let _ = self.event_sink.send(TransportEvent::Notification { method, params });
                }
                InboundMessage::ServerRequest { id, method, params } => {
                    let _ = self.event_sink.send(TransportEvent::ServerRequest { id, method, params });
                }
            }
        }
    }
}

enum PostOutcome {
    Json(Value),
    Accepted,
    StaleSession,
    InlineEvents(Vec<InboundMessage>),
    HttpError { code: u16, body: Option<String> },
}

fn response_to_outcome(resp: JsonRpcResponse) -> McpResult<Value> {
    if let Some(err) = resp.error {
        Err(McpError::RpcError {
            code: err.code,
            message: err.message,
            data: err.data,
        })
    } else {
        Ok(resp.result.unwrap_or(Value::Null))
    }
}

#[async_trait]
impl Transport for StreamableHttpTransport {
    async fn send_request(&self, id: JsonRpcId, method: &str, params: Option<Value>) -> McpResult<Value> {
        let key = id.as_key();
        let body = json!({
            "jsonrpc": JSONRPC_VERSION,
            "id": id,
            "method": method,
            "params": params,
        });

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(key.clone(), tx);

        let mut stale_session_retried = false;
        loop {
            match self.post(&body).await {
                Ok(PostOutcome::Json(value)) => {
                    self.pending.lock().await.remove(&key);
                    let resp: JsonRpcResponse = serde_json::from_value(value)
                        .map_err(|e| McpError::decoding(e.to_string()))?;
                    return response_to_outcome(resp);
                }
                Ok(PostOutcome::Accepted) => {
                    // Response will arrive on the GET SSE channel; make
                    // sure a reader is alive (and re-probing if it was
                    // previously downgraded) before awaiting the pending
                    // entry.
                    if let Some(this) = self.self_weak.upgrade() {
                        this.rearm_sse_if_downgraded();
                        this.ensure_sse_reader().await;
                    }
                    break;
                }
                Ok(PostOutcome::InlineEvents(events)) => {
                    let mut resolved = None;
                    for msg in events {
                        if let InboundMessage::Response(resp) = &msg {
                            if resp.id.as_key() == key {
                                resolved = Some(response_to_outcome(msg_into_response(msg)));
                                continue;
                            }
                        }
                        self.dispatch_non_matching(msg, &key).await;
                    }
                    self.pending.lock().await.remove(&key);
                    if let Some(outcome) = resolved {
                        return outcome;
                    }
                    // Server claimed an inline stream but never sent our
                    // response; fall through to await the GET channel.
                    break;
                }
                Ok(PostOutcome::StaleSession) => {
                    if stale_session_retried {
                        self.pending.lock().await.remove(&key);
                        return Err(McpError::TransportHttpStatus {
                            code: 404,
                            body: None,
                        });
                    }
                    stale_session_retried = true;
                    *self.session_id.write().await = None;
                    continue;
                }
                Ok(PostOutcome::HttpError { code, body }) => {
                    self.pending.lock().await.remove(&key);
                    return Err(McpError::TransportHttpStatus { code, body });
                }
                Err(e) => {
                    self.pending.lock().await.remove(&key);
                    return Err(e);
                }
            }
        }

        rx.await.unwrap_or_else(|_| Err(McpError::cancelled("transport disconnected")))
    }

    async fn send_notification(&self, method: &str, params: Option<Value>) -> McpResult<()> {
        let body = json!({
            "jsonrpc": JSONRPC_VERSION,
            "method": method,
            "params": params,
        });
        match self.post(&body).await? {
            PostOutcome::HttpError { code, body } => Err(McpError::TransportHttpStatus { code, body }),
            _ => Ok(()),
        }
    }

    async fn send_response(&self, id: JsonRpcId, outcome: RpcOutcome) -> McpResult<()> {
        let body = match outcome {
            RpcOutcome::Result(value) => json!({
                "jsonrpc": JSONRPC_VERSION,
                "id": id,
                "result": value,
            }),
            RpcOutcome::Error { code, message } => json!({
                "jsonrpc": JSONRPC_VERSION,
                "id": id,
                "error": { "code": code, "message": message },
            }),
        };
        match self.post(&body).await? {
            PostOutcome::HttpError { code, body } => Err(McpError::TransportHttpStatus { code, body }),
            _ => Ok(()),
        }
    }

    fn capabilities(&self) -> TransportCapabilities {
        TransportCapabilities {
            streaming: self.sse_supported.load(Ordering::Relaxed),
            resumption: true,
        }
    }

    async fn resumption_token(&self) -> Option<String> {
        self.last_event_id.read().await.clone()
    }

    async fn disconnect(&self) {
        if let Some(session) = self.session_id.read().await.clone() {
            if let Ok(headers) = self.base_headers().await {
                let _ = self
                    .client
                    .delete(self.endpoint.clone())
                    .headers(headers)
                    .send()
                    .await;
            }
            debug!("sent DELETE for session {session}");
        }
        if let Some(handle) = self.sse_task.lock().await.take() {
            handle.abort();
        }
        let mut pending = self.pending.lock().await;
        for (_, tx) in pending.drain() {
            let _ = tx.send(Err(McpError::cancelled("transport disconnected")));
        }
    }
}

/// `StreamableHttpTransport` needs an `Arc<Self>` to spawn its own reader
/// task (distilled §4.3: "exactly one background reader task owns the SSE
/// channel"). The connection manager constructs it inside an `Arc` and
/// calls this immediately after `initialize` succeeds.
impl StreamableHttpTransport {
    pub async fn start_streaming(self: &Arc<Self>) {
        self.ensure_sse_reader().await;
    }
}

fn msg_into_response(msg: InboundMessage) -> JsonRpcResponse {
    match msg {
        InboundMessage::Response(r) => r,
        _ => unreachable!("caller already matched Response variant"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_to_outcome_maps_error_object() {
        let resp = JsonRpcResponse {
            jsonrpc: None,
            id: JsonRpcId::String("1".into()),
            result: None,
            error: Some(crate::protocol::JsonRpcErrorObject {
                code: -32601,
                message: "not found".into(),
                data: None,
            }),
        };
        let outcome = response_to_outcome(resp);
        assert!(matches!(outcome, Err(McpError::RpcError { code: -32601, .. })));
    }

    #[test]
    fn response_to_outcome_defaults_missing_result_to_null() {
        let resp = JsonRpcResponse {
            jsonrpc: None,
            id: JsonRpcId::Number(1),
            result: None,
            error: None,
        };
        assert_eq!(response_to_outcome(resp).unwrap(), Value::Null);
    }

    fn test_transport() -> Arc<StreamableHttpTransport> {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        StreamableHttpTransport::new(
            reqwest::Url::parse("http://localhost/mcp").unwrap(),
            "2025-06-18",
            HashMap::new(),
            None,
            tx,
            None,
        )
    }

    #[test]
    fn rearm_sse_if_downgraded_only_flips_when_previously_downgraded() {
        let transport = test_transport();
        assert!(transport.sse_supported.load(Ordering::Relaxed));
        assert!(!transport.rearm_sse_if_downgraded());

        transport.sse_supported.store(false, Ordering::Relaxed);
        assert!(transport.rearm_sse_if_downgraded());
        assert!(transport.sse_supported.load(Ordering::Relaxed));
    }

    #[test]
    fn self_weak_upgrades_to_the_owning_arc() {
        let transport = test_transport();
        assert!(transport.self_weak.upgrade().is_some());
    }
}
