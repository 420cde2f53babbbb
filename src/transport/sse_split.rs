// src/transport/sse_split.rs
// Legacy SSE-split transport: a persistent GET on the SSE endpoint pushes
// server events (including an `event: endpoint` message naming where POSTs
// should go, possibly with a `sessionId` query parameter), while requests
// are POSTed to a separate message endpoint derived from the SSE one by
// path rewrite until the server tells us otherwise.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{McpError, McpResult};
use crate::protocol::{InboundMessage, JsonRpcId, JsonRpcResponse, JSONRPC_VERSION};
use crate::transport::{EventSink, HeaderProvider, RpcOutcome, Transport, TransportCapabilities, TransportEvent};

pub struct SseSplitTransport {
    client: Client,
    sse_endpoint: reqwest::Url,
    post_endpoint: RwLock<reqwest::Url>,
    session_id: RwLock<Option<String>>,
    static_headers: HashMap<String, String>,
    header_provider: Option<Arc<dyn HeaderProvider>>,
    pending: Mutex<HashMap<String, oneshot::Sender<McpResult<Value>>>>,
    event_sink: EventSink,
    sse_task: Mutex<Option<JoinHandle<()>>>,
}

/// Derive the default message-POST endpoint from the SSE endpoint by
/// rewriting the final path segment (e.g. `.../sse` -> `.../message`).
/// Overridden the first time an `event: endpoint` message names a path.
fn derive_post_endpoint(sse_endpoint: &reqwest::Url) -> reqwest::Url {
    let mut url = sse_endpoint.clone();
    {
        let mut segments: Vec<String> = url
            .path_segments()
            .map(|s| s.map(str::to_string).collect())
            .unwrap_or_default();
        if let Some(last) = segments.last_mut() {
            *last = "message".to_string();
        } else {
            segments.push("message".to_string());
        }
        url.set_path(&segments.join("/"));
    }
    url
}

impl SseSplitTransport {
    pub fn new(
        sse_endpoint: reqwest::Url,
        static_headers: HashMap<String, String>,
        header_provider: Option<Arc<dyn HeaderProvider>>,
        event_sink: EventSink,
    ) -> Self {
        let post_endpoint = derive_post_endpoint(&sse_endpoint);
        Self {
            client: Client::new(),
            sse_endpoint,
            post_endpoint: RwLock::new(post_endpoint),
            session_id: RwLock::new(None),
            static_headers,
            header_provider,
            pending: Mutex::new(HashMap::new()),
            event_sink,
            sse_task: Mutex::new(None),
        }
    }

    async fn headers(&self) -> McpResult<reqwest::header::HeaderMap> {
        use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
        let mut headers = HeaderMap::new();
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

    /// Spawn the persistent GET reader on the SSE endpoint, if not already
    /// running.
    pub async fn start_streaming(self: &Arc<Self>) {
        let mut guard = self.sse_task.lock().await;
        if guard.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let this = Arc::clone(self);
        *guard = Some(tokio::spawn(async move {
            this.run_reader().await;
        }));
    }

    async fn run_reader(&self) {
        let headers = match self.headers().await {
            Ok(h) => h,
            Err(e) => {
                warn!("could not build headers for SSE-split GET: {e}");
                return;
            }
        };
        let response = match self
            .client
            .get(self.sse_endpoint.clone())
            .headers(headers)
            .header("Accept", "text/event-stream")
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                debug!("SSE-split GET connection failed: {e}");
                return;
            }
        };
        if !response.status().is_success() {
            debug!("SSE-split GET returned {}", response.status());
            return;
        }

        let mut stream = response.bytes_stream().eventsource();
        while let Some(event) = stream.next().await {
            let event = match event {
                Ok(e) => e,
                Err(e) => {
                    debug!("SSE-split stream ended: {e}");
                    break;
                }
            };
            if event.event == "endpoint" {
                self.adopt_endpoint_event(&event.data).await;
                continue;
            }
            if event.event == "error" {
                warn!("server sent SSE error event: {}", event.data);
                continue;
            }
            let data = event.data.trim();
            if data.is_empty() || data == "[DONE]" {
                continue;
            }
            let value: Value = match serde_json::from_str(data) {
                Ok(v) => v,
                Err(e) => {
                    warn!("failed to decode SSE-split payload: {e}");
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
                    if let Some(tx) = self.pending.lock().await.remove(&key) {
                        let _ = tx.send(outcome);
                    }
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

    /// Legacy servers announce the message-POST target (and optionally a
    /// `sessionId` query parameter) via a dedicated `event: endpoint`
    /// SSE message, which may be a full URL or a path relative to the SSE
    /// endpoint.
    async fn adopt_endpoint_event(&self, payload: &str) {
        let resolved = match self.sse_endpoint.join(payload.trim()) {
            Ok(url) => url,
            Err(e) => {
                warn!("could not resolve endpoint event '{payload}': {e}");
                return;
            }
        };
        if let Some((_, session)) = resolved.query_pairs().find(|(k, _)| k == "sessionId") {
            *self.session_id.write().await = Some(session.to_string());
        }
        *self.post_endpoint.write().await = resolved;
    }
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
impl Transport for SseSplitTransport {
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

        let headers = self.headers().await?;
        let target = self.post_endpoint.read().await.clone();
        let response = self
            .client
            .post(target)
            .headers(headers)
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            self.pending.lock().await.remove(&key);
            let code = response.status().as_u16();
            let body = response.text().await.ok();
            return Err(McpError::TransportHttpStatus { code, body });
        }

        rx.await.unwrap_or_else(|_| Err(McpError::cancelled("transport disconnected")))
    }

    async fn send_notification(&self, method: &str, params: Option<Value>) -> McpResult<()> {
        let body = json!({
            "jsonrpc": JSONRPC_VERSION,
            "method": method,
            "params": params,
        });
        let headers = self.headers().await?;
        let target = self.post_endpoint.read().await.clone();
        let response = self.client.post(target).headers(headers).json(&body).send().await?;
        if !response.status().is_success() {
            let code = response.status().as_u16();
            let body = response.text().await.ok();
            return Err(McpError::TransportHttpStatus { code, body });
        }
        Ok(())
    }

    async fn send_response(&self, id: JsonRpcId, outcome: RpcOutcome) -> McpResult<()> {
        let body = match outcome {
            RpcOutcome::Result(value) => json!({"jsonrpc": JSONRPC_VERSION, "id": id, "result": value}),
            RpcOutcome::Error { code, message } => {
                json!({"jsonrpc": JSONRPC_VERSION, "id": id, "error": {"code": code, "message": message}})
            }
        };
        let headers = self.headers().await?;
        let target = self.post_endpoint.read().await.clone();
        let response = self.client.post(target).headers(headers).json(&body).send().await?;
        if !response.status().is_success() {
            let code = response.status().as_u16();
            let body = response.text().await.ok();
            return Err(McpError::TransportHttpStatus { code, body });
        }
        Ok(())
    }

    fn capabilities(&self) -> TransportCapabilities {
        TransportCapabilities {
            streaming: true,
            resumption: false,
        }
    }

    async fn resumption_token(&self) -> Option<String> {
        None
    }

    async fn disconnect(&self) {
        if let Some(handle) = self.sse_task.lock().await.take() {
            handle.abort();
        }
        let mut pending = self.pending.lock().await;
        for (_, tx) in pending.drain() {
            let _ = tx.send(Err(McpError::cancelled("transport disconnected")));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_message_endpoint_by_path_rewrite() {
        let sse = reqwest::Url::parse("http://host/api/sse").unwrap();
        let post = derive_post_endpoint(&sse);
        assert_eq!(post.path(), "/api/message");
    }
}
