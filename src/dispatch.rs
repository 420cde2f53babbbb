// src/dispatch.rs
// Server→client dispatcher (distilled §4.8): handles `sampling/createMessage`
// and `elicitation/create` requests arriving on a transport's streaming
// channel, invokes host-supplied handlers, and sends the JSON-RPC response
// back over the same transport.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::protocol::JsonRpcId;
use crate::transport::{RpcOutcome, Transport};

// ---------------------------------------------------------------------
// Sampling
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingRequest {
    pub messages: Vec<SamplingMessage>,
    #[serde(default, rename = "modelPreferences")]
    pub model_preferences: Option<ModelPreferences>,
    #[serde(default, rename = "systemPrompt")]
    pub system_prompt: Option<String>,
    #[serde(default, rename = "maxTokens")]
    pub max_tokens: Option<u32>,
    #[serde(default, rename = "stopSequences")]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingMessage {
    pub role: String,
    pub content: SamplingContent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SamplingContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl SamplingContent {
    pub fn as_text(&self) -> String {
        match self {
            SamplingContent::Text(t) => t.clone(),
            SamplingContent::Parts(parts) => parts
                .iter()
                .map(|p| match p {
                    ContentPart::Text { text } => text.clone(),
                    ContentPart::Image { .. } => "[image]".to_string(),
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image")]
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ModelPreferences {
    #[serde(default)]
    pub hints: Vec<ModelHint>,
    #[serde(default, rename = "costPriority")]
    pub cost_priority: Option<f32>,
    #[serde(default, rename = "speedPriority")]
    pub speed_priority: Option<f32>,
    #[serde(default, rename = "intelligencePriority")]
    pub intelligence_priority: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelHint {
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingResponse {
    pub role: String,
    pub content: SamplingContent,
    pub model: String,
    #[serde(default, rename = "stopReason")]
    pub stop_reason: Option<String>,
}

/// Host-supplied handler for server-initiated sampling requests. Absence
/// of a registered handler is handled by the dispatcher itself (replies
/// `-32603`); this trait is only consulted when one is registered.
#[async_trait]
pub trait SamplingHandler: Send + Sync {
    async fn handle(&self, server_id: Uuid, request: SamplingRequest) -> Result<SamplingResponse, String>;
}

// ---------------------------------------------------------------------
// Elicitation
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElicitationRequest {
    pub message: String,
    #[serde(default, rename = "requestedSchema")]
    pub requested_schema: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElicitationAction {
    Accept,
    Decline,
    Cancel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElicitationResult {
    pub action: ElicitationAction,
    #[serde(default)]
    pub content: Option<Value>,
}

impl ElicitationResult {
    pub fn decline() -> Self {
        Self {
            action: ElicitationAction::Decline,
            content: None,
        }
    }
}

/// Host-supplied handler for server-initiated elicitation requests.
/// Absence of a registered handler is handled by the dispatcher itself
/// (replies with a decline), matching sampling's fail-safe default.
#[async_trait]
pub trait ElicitationHandler: Send + Sync {
    async fn handle(&self, server_id: Uuid, request: ElicitationRequest) -> ElicitationResult;
}

// ---------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct DispatchHandlers {
    pub sampling: Option<Arc<dyn SamplingHandler>>,
    pub elicitation: Option<Arc<dyn ElicitationHandler>>,
}

/// Advertise `roots.listChanged` always, `sampling`/`elicitation` only
/// when a handler is registered (distilled §4.8).
pub fn client_capabilities(handlers: &DispatchHandlers) -> crate::protocol::ClientCapabilities {
    use crate::protocol::{ClientCapabilities, ElicitationCapability, RootsCapability};
    ClientCapabilities {
        roots: RootsCapability { list_changed: true },
        sampling: handlers.sampling.as_ref().map(|_| serde_json::Map::new()),
        elicitation: handlers
            .elicitation
            .as_ref()
            .map(|_| ElicitationCapability { form: true, url: true }),
    }
}

/// Handle one server→client request, invoking the matching host handler
/// (or the fail-safe default) and posting the JSON-RPC response back over
/// `transport`.
pub async fn dispatch_server_request(
    transport: &Arc<dyn Transport>,
    handlers: &DispatchHandlers,
    server_id: Uuid,
    id: JsonRpcId,
    method: &str,
    params: Option<Value>,
) {
    let outcome = match method {
        "sampling/createMessage" => handle_sampling(handlers, server_id, params).await,
        "elicitation/create" => handle_elicitation(handlers, server_id, params).await,
        other => {
            warn!("unsupported server→client method: {other}");
            RpcOutcome::Error {
                code: -32601,
                message: format!("Client does not support {other}"),
            }
        }
    };
    if let Err(e) = transport.send_response(id, outcome).await {
        warn!("failed to deliver server-request response: {e}");
    }
}

async fn handle_sampling(handlers: &DispatchHandlers, server_id: Uuid, params: Option<Value>) -> RpcOutcome {
    let Some(handler) = &handlers.sampling else {
        return RpcOutcome::Error {
            code: -32603,
            message: "Client does not support sampling".to_string(),
        };
    };
    let request: SamplingRequest = match params.map(serde_json::from_value) {
        Some(Ok(r)) => r,
        _ => {
            return RpcOutcome::Error {
                code: -32602,
                message: "invalid sampling/createMessage params".to_string(),
            }
        }
    };
    match handler.handle(server_id, request).await {
        Ok(response) => match serde_json::to_value(response) {
            Ok(v) => RpcOutcome::Result(v),
            Err(e) => RpcOutcome::Error {
                code: -32603,
                message: e.to_string(),
            },
        },
        Err(message) => RpcOutcome::Error { code: -32603, message },
    }
}

async fn handle_elicitation(handlers: &DispatchHandlers, server_id: Uuid, params: Option<Value>) -> RpcOutcome {
    let Some(handler) = &handlers.elicitation else {
        info!(%server_id, "elicitation declined: no handler registered");
        return RpcOutcome::Result(serde_json::to_value(ElicitationResult::decline()).unwrap());
    };
    let request: ElicitationRequest = match params.map(serde_json::from_value) {
        Some(Ok(r)) => r,
        _ => {
            return RpcOutcome::Error {
                code: -32602,
                message: "invalid elicitation/create params".to_string(),
            }
        }
    };
    let result = handler.handle(server_id, request).await;
    RpcOutcome::Result(serde_json::to_value(result).unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct DenyAllSampling;

    #[async_trait]
    impl SamplingHandler for DenyAllSampling {
        async fn handle(&self, _server_id: Uuid, _request: SamplingRequest) -> Result<SamplingResponse, String> {
            Err("denied".to_string())
        }
    }

    #[tokio::test]
    async fn sampling_without_handler_returns_unsupported_error() {
        let handlers = DispatchHandlers::default();
        let outcome = handle_sampling(
            &handlers,
            Uuid::nil(),
            Some(serde_json::json!({"messages": []})),
        )
        .await;
        match outcome {
            RpcOutcome::Error { code, .. } => assert_eq!(code, -32603),
            _ => panic!("expected error outcome"),
        }
    }

    #[tokio::test]
    async fn elicitation_without_handler_declines() {
        let handlers = DispatchHandlers::default();
        let outcome = handle_elicitation(
            &handlers,
            Uuid::nil(),
            Some(serde_json::json!({"message": "confirm?"})),
        )
        .await;
        match outcome {
            RpcOutcome::Result(v) => assert_eq!(v["action"], "decline"),
            _ => panic!("expected result outcome"),
        }
    }

    #[test]
    fn capabilities_reflect_registered_handlers() {
        let mut handlers = DispatchHandlers::default();
        let caps = client_capabilities(&handlers);
        assert!(caps.sampling.is_none());
        assert!(caps.elicitation.is_none());
        assert!(caps.roots.list_changed);

        handlers.sampling = Some(Arc::new(DenyAllSampling));
        let caps = client_capabilities(&handlers);
        assert!(caps.sampling.is_some());
    }
}
