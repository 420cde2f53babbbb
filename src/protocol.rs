// src/protocol.rs
// JSON-RPC 2.0 envelopes and MCP wire-level message schemas.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

pub const JSONRPC_VERSION: &str = "2.0";

/// A JSON-RPC id: either a string or an integer on the wire. A canonical
/// string projection is used whenever an id (or a progress token, which
/// shares the same variant shape) must index a table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcId {
    String(String),
    Number(i64),
}

impl JsonRpcId {
    /// Canonical string projection used as a map key.
    pub fn as_key(&self) -> String {
        match self {
            JsonRpcId::String(s) => s.clone(),
            JsonRpcId::Number(n) => n.to_string(),
        }
    }
}

impl fmt::Display for JsonRpcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JsonRpcId::String(s) => write!(f, "{s}"),
            JsonRpcId::Number(n) => write!(f, "{n}"),
        }
    }
}

/// A progress token shares the same `{string|integer}` shape as a JSON-RPC
/// id; reusing `CorrelationKey` for both avoids re-deriving the
/// project-to-string rule per call site.
pub type ProgressToken = JsonRpcId;

/// Newtype over the canonical-string projection, shared by JSON-RPC ids and
/// progress tokens wherever either must key a table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationKey(pub String);

impl From<&JsonRpcId> for CorrelationKey {
    fn from(id: &JsonRpcId) -> Self {
        CorrelationKey(id.as_key())
    }
}

impl From<JsonRpcId> for CorrelationKey {
    fn from(id: JsonRpcId) -> Self {
        CorrelationKey(id.as_key())
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    pub id: JsonRpcId,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: JsonRpcId, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: &'static str,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            method: method.into(),
            params,
        }
    }
}

/// A JSON-RPC response as returned by a server, with `result`/`error`
/// mutually exclusive. Servers disagree on whether `id` is always present
/// (it must be per spec, but tolerate absence defensively when peeking).
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    #[allow(dead_code)]
    pub jsonrpc: Option<String>,
    pub id: JsonRpcId,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcErrorObject>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

/// A raw inbound message, before we know whether it's a response, a
/// notification, or a server-to-client request. Peeked at by field
/// presence per the distilled spec's dispatch rule (§4.3):
/// `method` + no `id` => notification; `method` + `id` => server request;
/// `id` + no `method` => response.
#[derive(Debug, Clone)]
pub enum InboundMessage {
    Response(JsonRpcResponse),
    Notification { method: String, params: Option<Value> },
    ServerRequest { id: JsonRpcId, method: String, params: Option<Value> },
}

impl InboundMessage {
    pub fn parse(value: &Value) -> Option<Self> {
        let method = value.get("method").and_then(Value::as_str);
        let id = value.get("id").cloned();
        match (method, id) {
            (Some(method), Some(id)) => {
                let id: JsonRpcId = serde_json::from_value(id).ok()?;
                Some(InboundMessage::ServerRequest {
                    id,
                    method: method.to_string(),
                    params: value.get("params").cloned(),
                })
            }
            (Some(method), None) => Some(InboundMessage::Notification {
                method: method.to_string(),
                params: value.get("params").cloned(),
            }),
            (None, Some(_)) => {
                let resp: JsonRpcResponse = serde_json::from_value(value.clone()).ok()?;
                Some(InboundMessage::Response(resp))
            }
            (None, None) => None,
        }
    }
}

// ---------------------------------------------------------------------
// MCP message schemas
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServerInfo {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
}

/// Client capability advertisement. `roots.list_changed` is always
/// advertised; `sampling`/`elicitation` reflect whether the host registered
/// a handler (§4.8).
#[derive(Debug, Clone, Serialize, Default)]
pub struct ClientCapabilities {
    pub roots: RootsCapability,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sampling: Option<serde_json::Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elicitation: Option<ElicitationCapability>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct RootsCapability {
    #[serde(rename = "listChanged")]
    pub list_changed: bool,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct ElicitationCapability {
    pub form: bool,
    pub url: bool,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ServerCapabilities {
    #[serde(default)]
    pub tools: Option<Value>,
    #[serde(default)]
    pub resources: Option<Value>,
    #[serde(default)]
    pub prompts: Option<Value>,
    #[serde(default)]
    pub logging: Option<Value>,
}

/// Flattened result of `initialize`; the teacher-grade field name
/// `metadata` absorbs anything servers attach beyond the three named
/// fields so a schema drift doesn't break decoding.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct InitializeResult {
    #[serde(rename = "serverInfo", default)]
    pub server_info: ServerInfo,
    #[serde(rename = "protocolVersion", default)]
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub capabilities: Option<ServerCapabilities>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

/// A page of list results. Servers may reply with `{items, nextCursor}` or
/// with a bare array; both are accepted.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<String>,
}

impl<T: for<'de> Deserialize<'de>> Page<T> {
    pub fn from_value(value: Value, items_key: &str) -> Result<Self, serde_json::Error> {
        if let Value::Array(_) = &value {
            let items: Vec<T> = serde_json::from_value(value)?;
            return Ok(Page {
                items,
                next_cursor: None,
            });
        }
        let items = value
            .get(items_key)
            .cloned()
            .map(serde_json::from_value)
            .transpose()?
            .unwrap_or_default();
        let next_cursor = value
            .get("nextCursor")
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok(Page { items, next_cursor })
    }
}

/// Tool descriptor. Decodes from any of `{toolId, name, id}` as primary
/// key for interoperability across server implementations.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDescriptor {
    pub id: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Option<Value>,
    #[serde(rename = "outputSchema", default)]
    pub output_schema: Option<Value>,
    #[serde(default)]
    pub raw: Value,
}

impl ToolDescriptor {
    /// Decode from `{toolId|name|id, description?, inputSchema?, outputSchema?}`.
    pub fn from_value(value: Value) -> Option<Self> {
        let id = value
            .get("toolId")
            .or_else(|| value.get("name"))
            .or_else(|| value.get("id"))
            .and_then(Value::as_str)?
            .to_string();
        Some(ToolDescriptor {
            id,
            description: value
                .get("description")
                .and_then(Value::as_str)
                .map(str::to_string),
            input_schema: value.get("inputSchema").cloned(),
            output_schema: value.get("outputSchema").cloned(),
            raw: value,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub uri: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "mimeType", default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub raw: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceTemplateDescriptor {
    #[serde(rename = "uriTemplate")]
    pub uri_template: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub raw: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub arguments: Option<Value>,
    #[serde(default)]
    pub raw: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootDescriptor {
    pub uri: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// Content block shared by `prompts/get` results and tool-call results —
/// the MCP schema uses one shape for both even though the distilled spec
/// only names it for prompts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentBlock {
    Text { text: String },
    Image { data: String, #[serde(rename = "mimeType")] mime_type: String },
    Resource { resource: EmbeddedResource },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddedResource {
    pub uri: String,
    #[serde(rename = "mimeType", default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: String,
    pub content: ContentBlock,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GetPromptResult {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub messages: Vec<PromptMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressParams {
    #[serde(rename = "progressToken")]
    pub progress_token: ProgressToken,
    pub progress: f64,
    #[serde(default)]
    pub total: Option<f64>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelledParams {
    #[serde(rename = "requestId")]
    pub request_id: JsonRpcId,
    #[serde(default)]
    pub reason: Option<String>,
}

impl CancelledParams {
    pub fn new(request_id: JsonRpcId, reason: impl Into<String>) -> Self {
        Self {
            request_id,
            reason: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogMessageParams {
    pub level: String,
    #[serde(default)]
    pub logger: Option<String>,
    #[serde(default)]
    pub data: Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_roundtrips_string_and_number() {
        let s = JsonRpcId::String("abc".into());
        let n = JsonRpcId::Number(42);
        assert_eq!(s.as_key(), "abc");
        assert_eq!(n.as_key(), "42");
    }

    #[test]
    fn inbound_message_classifies_by_field_presence() {
        let resp = serde_json::json!({"jsonrpc":"2.0","id":"x","result":{"ok":true}});
        assert!(matches!(
            InboundMessage::parse(&resp),
            Some(InboundMessage::Response(_))
        ));

        let notif = serde_json::json!({"jsonrpc":"2.0","method":"notifications/progress","params":{}});
        assert!(matches!(
            InboundMessage::parse(&notif),
            Some(InboundMessage::Notification { .. })
        ));

        let req = serde_json::json!({"jsonrpc":"2.0","id":"e1","method":"elicitation/create","params":{}});
        assert!(matches!(
            InboundMessage::parse(&req),
            Some(InboundMessage::ServerRequest { .. })
        ));
    }

    #[test]
    fn page_accepts_bare_array_or_wrapped_object() {
        let arr = serde_json::json!([{"uri": "file:///a"}]);
        let page: Page<ResourceDescriptor> = Page::from_value(arr, "resources").unwrap();
        assert_eq!(page.items.len(), 1);
        assert!(page.next_cursor.is_none());

        let wrapped = serde_json::json!({"resources": [{"uri": "file:///a"}], "nextCursor": "tok"});
        let page: Page<ResourceDescriptor> = Page::from_value(wrapped, "resources").unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.next_cursor.as_deref(), Some("tok"));
    }

    #[test]
    fn tool_descriptor_accepts_tool_id_name_or_id() {
        let by_name = serde_json::json!({"name": "calc", "description": "adds"});
        assert_eq!(ToolDescriptor::from_value(by_name).unwrap().id, "calc");

        let by_tool_id = serde_json::json!({"toolId": "calc2"});
        assert_eq!(ToolDescriptor::from_value(by_tool_id).unwrap().id, "calc2");

        let by_id = serde_json::json!({"id": "calc3"});
        assert_eq!(ToolDescriptor::from_value(by_id).unwrap().id, "calc3");
    }
}
