// src/rpc.rs
// JSON-RPC client: encodes the MCP method catalogue over a `Transport`,
// enforces per-call timeout by racing the transport future against a
// sleep (distilled §4.1 — the timeout is never pushed into the transport
// itself), and tolerates "method not found" for optional list endpoints.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::warn;
use uuid::Uuid;

use crate::error::{McpError, McpResult};
use crate::protocol::{
    ClientCapabilities, ClientInfo, GetPromptResult, InitializeResult, JsonRpcId, Page,
    ProgressToken, PromptDescriptor, ResourceDescriptor, ResourceTemplateDescriptor,
    RootDescriptor, ToolDescriptor,
};
use crate::transport::Transport;

/// Protocol versions this client can negotiate, newest first.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2025-06-18", "2025-03-26", "2024-11-05"];

pub struct JsonRpcClient {
    transport: Arc<dyn Transport>,
}

impl JsonRpcClient {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    fn mint_id() -> JsonRpcId {
        JsonRpcId::String(Uuid::new_v4().to_string())
    }

    /// Race `transport.send_request` against a sleep of `timeout`. On
    /// timeout, best-effort cancel the request on the server and surface
    /// `request_timed_out`.
    async fn request_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> McpResult<Value> {
        let id = Self::mint_id();
        let transport = Arc::clone(&self.transport);
        let method_owned = method.to_string();
        let id_for_task = id.clone();
        let handle = tokio::spawn(async move {
            transport
                .send_request(id_for_task, &method_owned, params)
                .await
        });
        let abort_handle = handle.abort_handle();

        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(_join_error)) => Err(McpError::transport("request task did not complete")),
            Err(_elapsed) => {
                abort_handle.abort();
                self.cancel(id, "request timed out").await;
                Err(McpError::RequestTimedOut {
                    method: method.to_string(),
                    timeout,
                })
            }
        }
    }

    /// Send a request with no enforced deadline — used by the managed
    /// tool-call engine (§4.7), which implements its own idle/total
    /// watchdog at a coarser granularity than a single race.
    pub async fn request_raw(&self, id: JsonRpcId, method: &str, params: Option<Value>) -> McpResult<Value> {
        self.transport.send_request(id, method, params).await
    }

    pub fn mint_call_id(&self) -> JsonRpcId {
        Self::mint_id()
    }

    /// Best-effort `notifications/cancelled`; failures are swallowed per
    /// the distilled spec (cancellation notices are advisory).
    pub async fn cancel(&self, request_id: JsonRpcId, reason: &str) {
        let params = json!({ "requestId": request_id, "reason": reason });
        if let Err(e) = self.transport.send_notification("notifications/cancelled", Some(params)).await {
            warn!("failed to send notifications/cancelled: {e}");
        }
    }

    pub async fn initialize(
        &self,
        client_info: ClientInfo,
        capabilities: ClientCapabilities,
    ) -> McpResult<InitializeResult> {
        let params = json!({
            "protocolVersion": SUPPORTED_PROTOCOL_VERSIONS[0],
            "clientInfo": client_info,
            "capabilities": capabilities,
        });
        let id = Self::mint_id();
        let value = self.transport.send_request(id, "initialize", Some(params)).await?;
        let result: InitializeResult =
            serde_json::from_value(value).map_err(|e| McpError::decoding(e.to_string()))?;

        if let Some(version) = &result.protocol_version {
            if !SUPPORTED_PROTOCOL_VERSIONS.contains(&version.as_str()) {
                return Err(McpError::UnsupportedProtocolVersion(version.clone()));
            }
        }

        // Best-effort; failure to deliver `notifications/initialized` is
        // ignored per the distilled spec.
        let _ = self.transport.send_notification("notifications/initialized", None).await;

        Ok(result)
    }

    async fn paginate_raw(
        &self,
        method: &str,
        items_key: &str,
        timeout: Duration,
    ) -> McpResult<Vec<Value>> {
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;
        let mut seen_cursors: HashSet<String> = HashSet::new();
        loop {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let value = match self.request_with_timeout(method, params, timeout).await {
                Ok(v) => v,
                Err(e) if e.is_method_absent(method) => {
                    return Ok(items);
                }
                Err(e) => return Err(e),
            };
            let page: Page<Value> = Page::from_value(value, items_key)
                .map_err(|e| McpError::decoding(e.to_string()))?;
            items.extend(page.items);
            match page.next_cursor {
                Some(next) if !next.trim().is_empty() => {
                    if !seen_cursors.insert(next.clone()) {
                        warn!("{method} cursor cycle detected ({next}); stopping pagination");
                        break;
                    }
                    cursor = Some(next);
                }
                _ => break,
            }
        }
        Ok(items)
    }

    pub async fn list_tools(&self, timeout: Duration) -> McpResult<Vec<ToolDescriptor>> {
        let raw = self.paginate_raw("tools/list", "tools", timeout).await?;
        Ok(raw.into_iter().filter_map(ToolDescriptor::from_value).collect())
    }

    pub async fn list_resources(&self, timeout: Duration) -> McpResult<Vec<ResourceDescriptor>> {
        let raw = self.paginate_raw("resources/list", "resources", timeout).await?;
        Ok(raw
            .into_iter()
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect())
    }

    pub async fn list_resource_templates(
        &self,
        timeout: Duration,
    ) -> McpResult<Vec<ResourceTemplateDescriptor>> {
        let raw = self
            .paginate_raw("resources/templates/list", "resourceTemplates", timeout)
            .await?;
        Ok(raw
            .into_iter()
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect())
    }

    pub async fn list_prompts(&self, timeout: Duration) -> McpResult<Vec<PromptDescriptor>> {
        let raw = self.paginate_raw("prompts/list", "prompts", timeout).await?;
        Ok(raw
            .into_iter()
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect())
    }

    /// `roots/list` additionally tolerates `-32602` (invalid params).
    pub async fn list_roots(&self, timeout: Duration) -> McpResult<Vec<RootDescriptor>> {
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;
        let mut seen_cursors: HashSet<String> = HashSet::new();
        loop {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let value = match self.request_with_timeout("roots/list", params, timeout).await {
                Ok(v) => v,
                Err(e) if e.is_method_absent("roots/list") => {
                    return Ok(items);
                }
                Err(e) => return Err(e),
            };
            let page: Page<RootDescriptor> =
                Page::from_value(value, "roots").map_err(|e| McpError::decoding(e.to_string()))?;
            items.extend(page.items);
            match page.next_cursor {
                Some(next) if !next.trim().is_empty() => {
                    if !seen_cursors.insert(next.clone()) {
                        warn!("roots/list cursor cycle detected ({next}); stopping pagination");
                        break;
                    }
                    cursor = Some(next);
                }
                _ => break,
            }
        }
        Ok(items)
    }

    pub async fn read_resource(
        &self,
        uri: &str,
        arguments: Option<Value>,
        timeout: Duration,
    ) -> McpResult<Value> {
        let params = json!({ "uri": uri, "arguments": arguments });
        self.request_with_timeout("resources/read", Some(params), timeout).await
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<Value>,
        timeout: Duration,
    ) -> McpResult<GetPromptResult> {
        let params = json!({ "name": name, "arguments": arguments });
        let value = self.request_with_timeout("prompts/get", Some(params), timeout).await?;
        serde_json::from_value(value).map_err(|e| McpError::decoding(e.to_string()))
    }

    pub async fn set_log_level(&self, level: &str, timeout: Duration) -> McpResult<()> {
        let params = json!({ "level": level });
        self.request_with_timeout("logging/setLevel", Some(params), timeout)
            .await
            .map(|_| ())
    }

    /// Issue `tools/call` with an explicit id so the caller (the managed
    /// tool-call engine) can correlate progress/cancellation against it.
    /// No deadline is enforced here; the engine's watchdog owns timing.
    pub async fn call_tool_raw(
        &self,
        id: JsonRpcId,
        name: &str,
        arguments: Value,
        progress_token: &ProgressToken,
        meta_timeout_ms: Option<u64>,
    ) -> McpResult<Value> {
        let mut meta = json!({ "progressToken": progress_token });
        if let Some(ms) = meta_timeout_ms {
            meta["timeout"] = json!(ms);
        }
        let params = json!({ "name": name, "arguments": arguments, "_meta": meta });
        self.transport.send_request(id, "tools/call", Some(params)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{JsonRpcId, JsonRpcResponse};
    use crate::transport::{RpcOutcome, TransportCapabilities, TransportEvent};
    use async_trait::async_trait;
    use tokio::sync::Mutex;

    struct MockTransport {
        responses: Mutex<Vec<McpResult<Value>>>,
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send_request(&self, _id: JsonRpcId, _method: &str, _params: Option<Value>) -> McpResult<Value> {
            let mut responses = self.responses.lock().await;
            if responses.is_empty() {
                return Ok(Value::Null);
            }
            responses.remove(0)
        }
        async fn send_notification(&self, _method: &str, _params: Option<Value>) -> McpResult<()> {
            Ok(())
        }
        async fn send_response(&self, _id: JsonRpcId, _outcome: RpcOutcome) -> McpResult<()> {
            Ok(())
        }
        fn capabilities(&self) -> TransportCapabilities {
            TransportCapabilities::default()
        }
        async fn resumption_token(&self) -> Option<String> {
            None
        }
        async fn disconnect(&self) {}
    }

    fn _unused(_e: TransportEvent) {}
    fn _unused2(_r: JsonRpcResponse) {}

    #[tokio::test]
    async fn initialize_rejects_unsupported_protocol_version() {
        let transport = Arc::new(MockTransport {
            responses: Mutex::new(vec![Ok(json!({
                "serverInfo": {"name": "srv"},
                "protocolVersion": "1999-01-01",
            }))]),
        });
        let client = JsonRpcClient::new(transport);
        let err = client
            .initialize(ClientInfo::default(), ClientCapabilities::default())
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::UnsupportedProtocolVersion(_)));
    }

    #[tokio::test]
    async fn list_tools_treats_method_not_found_as_empty() {
        let transport = Arc::new(MockTransport {
            responses: Mutex::new(vec![Err(McpError::RpcError {
                code: -32601,
                message: "no such method".into(),
                data: None,
            })]),
        });
        let client = JsonRpcClient::new(transport);
        let tools = client.list_tools(Duration::from_secs(1)).await.unwrap();
        assert!(tools.is_empty());
    }

    #[tokio::test]
    async fn pagination_accumulates_pages_until_cursor_absent() {
        let transport = Arc::new(MockTransport {
            responses: Mutex::new(vec![
                Ok(json!({"tools": [{"name": "a"}], "nextCursor": "p2"})),
                Ok(json!({"tools": [{"name": "b"}]})),
            ]),
        });
        let client = JsonRpcClient::new(transport);
        let tools = client.list_tools(Duration::from_secs(1)).await.unwrap();
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].id, "a");
        assert_eq!(tools[1].id, "b");
    }
}
