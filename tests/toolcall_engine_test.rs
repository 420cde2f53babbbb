// tests/toolcall_engine_test.rs
// Exercises the managed tool-call engine end to end against an in-process
// mock transport: a real `JsonRpcClient` wraps the mock, so these tests
// drive the actual request encoding / watchdog / governance-log wiring
// rather than poking engine internals directly.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use uuid::Uuid;

use mcp_client_runtime::config::RuntimeConfig;
use mcp_client_runtime::error::{McpError, McpResult};
use mcp_client_runtime::governance::GovernanceLog;
use mcp_client_runtime::protocol::JsonRpcId;
use mcp_client_runtime::rpc::JsonRpcClient;
use mcp_client_runtime::toolcall::{CallState, ToolCallEngine, ToolCallOptions};
use mcp_client_runtime::transport::{RpcOutcome, Transport, TransportCapabilities};

/// A transport whose `tools/call` response either returns immediately or
/// after an artificial delay, to drive the watchdog's idle-timeout path.
struct ScriptedTransport {
    delay: Option<Duration>,
    result: McpResult<Value>,
    notifications: Mutex<Vec<(String, Option<Value>)>>,
}

impl ScriptedTransport {
    fn immediate(result: McpResult<Value>) -> Self {
        Self {
            delay: None,
            result,
            notifications: Mutex::new(Vec::new()),
        }
    }

    fn delayed(delay: Duration, result: McpResult<Value>) -> Self {
        Self {
            delay: Some(delay),
            result,
            notifications: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send_request(&self, _id: JsonRpcId, method: &str, _params: Option<Value>) -> McpResult<Value> {
        assert_eq!(method, "tools/call");
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match &self.result {
            Ok(v) => Ok(v.clone()),
            Err(e) => Err(McpError::transport(e.to_string())),
        }
    }

    async fn send_notification(&self, method: &str, params: Option<Value>) -> McpResult<()> {
        self.notifications.lock().await.push((method.to_string(), params));
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

fn fast_config() -> RuntimeConfig {
    let mut cfg = RuntimeConfig::default();
    cfg.watchdog_tick = Duration::from_millis(10);
    cfg.terminal_grace = Duration::from_millis(10);
    cfg
}

#[tokio::test]
async fn successful_tool_call_returns_result_and_logs_success() {
    let transport: Arc<dyn Transport> = Arc::new(ScriptedTransport::immediate(Ok(json!({"ok": true}))));
    let rpc = Arc::new(JsonRpcClient::new(transport));
    let governance = Arc::new(GovernanceLog::new(100));
    let engine = Arc::new(ToolCallEngine::new(fast_config(), Arc::clone(&governance)));

    let server_id = Uuid::new_v4();
    let result = engine
        .invoke(rpc, server_id, "calc", json!({"q": "6*7"}), ToolCallOptions::default())
        .await
        .unwrap();

    assert_eq!(result, json!({"ok": true}));
    let entries = governance.snapshot().await;
    assert!(entries.iter().any(|e| e.message.contains("tool call started")));
    assert!(entries.iter().any(|e| e.message.contains("tool call succeeded")));
}

// Not `start_paused`: the watchdog measures elapsed time with
// `chrono::Utc::now()` (wall clock), which a paused tokio clock does not
// advance. The transport's artificial delay only needs to outlast the
// idle timeout in real time; the watchdog firing aborts it well before
// it would actually complete.
#[tokio::test]
async fn idle_timeout_cancels_the_call_and_sends_cancelled_notification() {
    let transport = Arc::new(ScriptedTransport::delayed(Duration::from_secs(30), Ok(Value::Null)));
    let rpc = Arc::new(JsonRpcClient::new(Arc::clone(&transport) as Arc<dyn Transport>));
    let governance = Arc::new(GovernanceLog::new(100));
    let engine = Arc::new(ToolCallEngine::new(fast_config(), governance));

    let options = ToolCallOptions {
        idle_timeout: Some(Duration::from_millis(50)),
        max_total_timeout: Some(Duration::from_secs(5)),
        reset_on_progress: false,
        ..Default::default()
    };

    let server_id = Uuid::new_v4();
    let err = engine
        .invoke(rpc, server_id, "slow_tool", Value::Null, options)
        .await
        .unwrap_err();

    match err {
        McpError::RequestTimedOut { method, timeout } => {
            assert_eq!(method, "tools/call");
            assert_eq!(timeout, Duration::from_millis(50));
        }
        other => panic!("expected request_timed_out, got {other:?}"),
    }

    let sent = transport.notifications.lock().await;
    assert!(sent.iter().any(|(m, _)| m == "notifications/cancelled"));
}

#[tokio::test]
async fn server_error_response_surfaces_to_the_host_and_marks_call_failed() {
    let transport: Arc<dyn Transport> = Arc::new(ScriptedTransport::immediate(Err(McpError::RpcError {
        code: -32000,
        message: "tool crashed".into(),
        data: None,
    })));
    let rpc = Arc::new(JsonRpcClient::new(transport));
    let governance = Arc::new(GovernanceLog::new(100));
    let engine = Arc::new(ToolCallEngine::new(fast_config(), governance));

    let err = engine
        .invoke(rpc, Uuid::new_v4(), "crashy", Value::Null, ToolCallOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, McpError::Transport(_)));

    // The call transitioned through a terminal state before returning;
    // the active-call table prunes it after `terminal_grace`, so check
    // immediately rather than racing the prune task.
    let active = engine.active_calls().await;
    assert!(active.iter().all(|c| c.state != CallState::Running));
}
