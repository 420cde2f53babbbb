// src/toolcall.rs
// Managed tool-call engine (distilled §4.7): per-call identity, dual
// idle/total timeout, progress propagation, cooperative cancellation via
// `notifications/cancelled`, and at-most-once completion.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::RwLock;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::RuntimeConfig;
use crate::error::{McpError, McpResult};
use crate::governance::{GovernanceCategory, GovernanceLevel, GovernanceLog};
use crate::protocol::{JsonRpcId, ProgressParams, ProgressToken};
use crate::rpc::JsonRpcClient;

pub type ProgressObserver = Arc<dyn Fn(&ProgressParams) + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub enum CallState {
    Running,
    Cancelling,
    Succeeded,
    Failed(String),
    Cancelled(String),
}

impl CallState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallState::Succeeded | CallState::Failed(_) | CallState::Cancelled(_)
        )
    }
}

#[derive(Debug, Clone)]
pub struct ManagedCall {
    pub id: Uuid,
    pub server_id: Uuid,
    pub tool_id: String,
    pub started_at: DateTime<Utc>,
    pub progress_token: ProgressToken,
    pub latest_progress: Option<f64>,
    pub latest_total: Option<f64>,
    pub last_progress_at: DateTime<Utc>,
    pub idle_timeout: Duration,
    pub max_total_timeout: Duration,
    pub reset_on_progress: bool,
    pub state: CallState,
}

#[derive(Default)]
pub struct ToolCallOptions {
    pub idle_timeout: Option<Duration>,
    pub max_total_timeout: Option<Duration>,
    pub reset_on_progress: bool,
    pub progress_token: Option<ProgressToken>,
    pub cancellation_reason: Option<String>,
    pub include_timeout_in_meta: bool,
    pub on_progress: Option<ProgressObserver>,
}

struct WatchdogOutcome {
    reason: &'static str,
    timeout: Duration,
}

/// Tracks all live managed tool calls for the host process. Owned by the
/// connection manager; a single instance spans every server.
pub struct ToolCallEngine {
    config: RuntimeConfig,
    governance: Arc<GovernanceLog>,
    active: RwLock<HashMap<Uuid, ManagedCall>>,
    /// token key -> call ids sharing that progress token (coalescing,
    /// distilled §4.7 "Token coalescing").
    token_calls: RwLock<HashMap<String, Vec<Uuid>>>,
    observers: RwLock<HashMap<Uuid, ProgressObserver>>,
    abort_handles: RwLock<HashMap<Uuid, AbortHandle>>,
}

impl ToolCallEngine {
    pub fn new(config: RuntimeConfig, governance: Arc<GovernanceLog>) -> Self {
        Self {
            config,
            governance,
            active: RwLock::new(HashMap::new()),
            token_calls: RwLock::new(HashMap::new()),
            observers: RwLock::new(HashMap::new()),
            abort_handles: RwLock::new(HashMap::new()),
        }
    }

    pub async fn active_calls(&self) -> Vec<ManagedCall> {
        self.active.read().await.values().cloned().collect()
    }

    pub async fn get(&self, call_id: Uuid) -> Option<ManagedCall> {
        self.active.read().await.get(&call_id).cloned()
    }

    /// Invoke `tool_id` on `server_id` through `rpc`, returning the tool's
    /// result value or a terminal error/cancellation.
    pub async fn invoke(
        self: &Arc<Self>,
        rpc: Arc<JsonRpcClient>,
        server_id: Uuid,
        tool_id: &str,
        arguments: Value,
        options: ToolCallOptions,
    ) -> McpResult<Value> {
        let call_id = Uuid::new_v4();
        let progress_token = options
            .progress_token
            .clone()
            .unwrap_or_else(|| ProgressToken::String(Uuid::new_v4().to_string()));
        let token_key = progress_token.as_key();
        let idle_timeout = options.idle_timeout.unwrap_or(self.config.default_idle_timeout);
        let max_total_timeout = options
            .max_total_timeout
            .unwrap_or(self.config.default_total_timeout);
        let now = Utc::now();

        let call = ManagedCall {
            id: call_id,
            server_id,
            tool_id: tool_id.to_string(),
            started_at: now,
            progress_token: progress_token.clone(),
            latest_progress: None,
            latest_total: None,
            last_progress_at: now,
            idle_timeout,
            max_total_timeout,
            reset_on_progress: options.reset_on_progress,
            state: CallState::Running,
        };
        self.active.write().await.insert(call_id, call);
        self.token_calls.write().await.entry(token_key.clone()).or_default().push(call_id);
        if let Some(observer) = options.on_progress.clone() {
            self.observers.write().await.insert(call_id, observer);
        }

        self.governance
            .push(
                GovernanceLevel::Info,
                GovernanceCategory::ToolCall,
                Some(server_id),
                None,
                format!("tool call started: {tool_id}"),
                None,
            )
            .await;

        let request_id = JsonRpcId::String(call_id.to_string());
        let meta_timeout_ms = options.include_timeout_in_meta.then(|| max_total_timeout.as_millis() as u64);

        let rpc_for_task = Arc::clone(&rpc);
        let request_id_for_task = request_id.clone();
        let tool_id_owned = tool_id.to_string();
        let token_for_task = progress_token.clone();
        let request_task = tokio::spawn(async move {
            rpc_for_task
                .call_tool_raw(request_id_for_task, &tool_id_owned, arguments, &token_for_task, meta_timeout_ms)
                .await
        });
        self.abort_handles.write().await.insert(call_id, request_task.abort_handle());

        let watchdog = self.run_watchdog(call_id);

        let outcome = tokio::select! {
            biased;
            watchdog_result = watchdog => {
                if let Some(request_task) = self.abort_handles.write().await.remove(&call_id) {
                    request_task.abort();
                }
                self.finish_timeout(&rpc, call_id, request_id.clone(), watchdog_result).await
            }
            joined = request_task => {
                self.abort_handles.write().await.remove(&call_id);
                match joined {
                    Ok(Ok(value)) => self.finish_success(call_id, value).await,
                    Ok(Err(McpError::Cancelled { reason })) => self.finish_cancelled(call_id, reason).await,
                    Ok(Err(other)) => self.finish_failed(call_id, other).await,
                    Err(join_err) if join_err.is_cancelled() => {
                        self.finish_cancelled(call_id, options.cancellation_reason.clone().unwrap_or_else(|| "client cancelled request".to_string())).await
                    }
                    Err(join_err) => self.finish_failed(call_id, McpError::transport(join_err.to_string())).await,
                }
            }
        };

        self.cleanup_progress_routing(call_id, &token_key).await;
        self.schedule_prune(call_id);
        outcome
    }

    async fn run_watchdog(&self, call_id: Uuid) -> WatchdogOutcome {
        loop {
            tokio::time::sleep(self.config.watchdog_tick).await;
            let Some(call) = self.active.read().await.get(&call_id).cloned() else {
                // Call already finalized by another path; park forever so
                // the select! branch that actually completed wins.
                return std::future::pending::<WatchdogOutcome>().await;
            };
            let now = Utc::now();
            let total_elapsed = (now - call.started_at)
                .to_std()
                .unwrap_or(Duration::ZERO);
            if total_elapsed > call.max_total_timeout {
                return WatchdogOutcome {
                    reason: "max_total_timeout",
                    timeout: call.max_total_timeout,
                };
            }
            let idle_anchor = if call.reset_on_progress {
                call.last_progress_at
            } else {
                call.started_at
            };
            let idle_elapsed = (now - idle_anchor).to_std().unwrap_or(Duration::ZERO);
            if idle_elapsed > call.idle_timeout {
                return WatchdogOutcome {
                    reason: "idle_timeout",
                    timeout: call.idle_timeout,
                };
            }
        }
    }

    async fn finish_timeout(
        &self,
        rpc: &Arc<JsonRpcClient>,
        call_id: Uuid,
        request_id: JsonRpcId,
        outcome: WatchdogOutcome,
    ) -> McpResult<Value> {
        if let Some(call) = self.active.write().await.get_mut(&call_id) {
            call.state = CallState::Cancelling;
        }
        rpc.cancel(request_id, &format!("{} exceeded", outcome.reason)).await;
        let err = McpError::RequestTimedOut {
            method: "tools/call".to_string(),
            timeout: outcome.timeout,
        };
        if let Some(call) = self.active.write().await.get_mut(&call_id) {
            call.state = CallState::Cancelled(err.to_string());
        }
        self.governance
            .push(
                GovernanceLevel::Warn,
                GovernanceCategory::ToolCall,
                None,
                None,
                format!("tool call timed out: {}", outcome.reason),
                None,
            )
            .await;
        Err(err)
    }

    async fn finish_success(&self, call_id: Uuid, value: Value) -> McpResult<Value> {
        let tool = self.mark_terminal(call_id, CallState::Succeeded).await;
        self.record_outcome_metric(&tool, "succeeded");
        self.governance
            .push(
                GovernanceLevel::Info,
                GovernanceCategory::ToolCall,
                None,
                None,
                "tool call succeeded",
                None,
            )
            .await;
        Ok(value)
    }

    async fn finish_cancelled(&self, call_id: Uuid, reason: String) -> McpResult<Value> {
        let tool = self.mark_terminal(call_id, CallState::Cancelled(reason.clone())).await;
        self.record_outcome_metric(&tool, "cancelled");
        self.governance
            .push(
                GovernanceLevel::Info,
                GovernanceCategory::ToolCall,
                None,
                None,
                format!("tool call cancelled: {reason}"),
                None,
            )
            .await;
        Err(McpError::cancelled(reason))
    }

    async fn finish_failed(&self, call_id: Uuid, err: McpError) -> McpResult<Value> {
        let tool = self.mark_terminal(call_id, CallState::Failed(err.to_string())).await;
        self.record_outcome_metric(&tool, "failed");
        self.governance
            .push(
                GovernanceLevel::Error,
                GovernanceCategory::ToolCall,
                None,
                None,
                format!("tool call failed: {err}"),
                None,
            )
            .await;
        Err(err)
    }

    /// Transition a call into its terminal state and hand back `(tool_id,
    /// started_at)` so the caller can record a duration metric without a
    /// second lock round-trip.
    async fn mark_terminal(&self, call_id: Uuid, state: CallState) -> Option<(String, DateTime<Utc>)> {
        let mut active = self.active.write().await;
        let call = active.get_mut(&call_id)?;
        call.state = state;
        Some((call.tool_id.clone(), call.started_at))
    }

    fn record_outcome_metric(&self, tool: &Option<(String, DateTime<Utc>)>, outcome: &'static str) {
        if let Some((tool_id, started_at)) = tool {
            let elapsed = (Utc::now() - *started_at).to_std().unwrap_or(Duration::ZERO);
            crate::metrics::record_tool_call(tool_id, outcome, elapsed);
        }
    }

    async fn cleanup_progress_routing(&self, call_id: Uuid, token_key: &str) {
        self.observers.write().await.remove(&call_id);
        let mut token_calls = self.token_calls.write().await;
        if let Some(calls) = token_calls.get_mut(token_key) {
            calls.retain(|id| *id != call_id);
            if calls.is_empty() {
                token_calls.remove(token_key);
            }
        }
    }

    fn schedule_prune(self: &Arc<Self>, call_id: Uuid) {
        let engine = Arc::clone(self);
        let grace = engine.config.terminal_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            engine.active.write().await.remove(&call_id);
        });
    }

    /// Fan out a `notifications/progress` payload to every call sharing
    /// its token. Clears the token-routing entry once
    /// `progress >= total > 0`, but does not terminate the call(s) — the
    /// result RPC still arrives (distilled §4.7, §8 boundary behaviour).
    pub async fn record_progress(&self, params: &ProgressParams) {
        let token_key = params.progress_token.as_key();
        let call_ids = self.token_calls.read().await.get(&token_key).cloned().unwrap_or_default();
        if call_ids.is_empty() {
            debug!("progress for unknown token {token_key}");
            return;
        }
        let now = Utc::now();
        {
            let mut active = self.active.write().await;
            for id in &call_ids {
                if let Some(call) = active.get_mut(id) {
                    call.latest_progress = Some(params.progress);
                    call.latest_total = params.total;
                    call.last_progress_at = now;
                }
            }
        }
        let observers = self.observers.read().await;
        for id in &call_ids {
            if let Some(observer) = observers.get(id) {
                observer(params);
            }
        }
        if let Some(total) = params.total {
            if total > 0.0 && params.progress >= total {
                self.token_calls.write().await.remove(&token_key);
            }
        }
    }

    /// Host-initiated cancellation of a specific active call.
    pub async fn cancel(&self, rpc: &JsonRpcClient, call_id: Uuid, reason: &str) -> McpResult<()> {
        let request_id = JsonRpcId::String(call_id.to_string());
        if let Some(handle) = self.abort_handles.write().await.remove(&call_id) {
            handle.abort();
        } else {
            warn!("cancel requested for unknown or already-finished call {call_id}");
        }
        if let Some(call) = self.active.write().await.get_mut(&call_id) {
            call.state = CallState::Cancelling;
        }
        rpc.cancel(request_id, reason).await;
        info!("cancelled managed call {call_id}: {reason}");
        Ok(())
    }

    /// Cancel every active call owned by `server_id`, e.g. on disconnect
    /// or descriptor deletion (distilled §5, cancellation propagation).
    pub async fn cancel_all_for_server(&self, rpc: &JsonRpcClient, server_id: Uuid, reason: &str) {
        let ids: Vec<Uuid> = self
            .active
            .read()
            .await
            .values()
            .filter(|c| c.server_id == server_id && !c.state.is_terminal())
            .map(|c| c.id)
            .collect();
        for id in ids {
            let _ = self.cancel(rpc, id, reason).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn progress_at_or_past_total_clears_token_routing_without_terminating() {
        let engine = Arc::new(ToolCallEngine::new(RuntimeConfig::default(), Arc::new(GovernanceLog::new(10))));
        let call_id = Uuid::new_v4();
        let token = ProgressToken::String("tok".into());
        engine.active.write().await.insert(
            call_id,
            ManagedCall {
                id: call_id,
                server_id: Uuid::nil(),
                tool_id: "t".into(),
                started_at: Utc::now(),
                progress_token: token.clone(),
                latest_progress: None,
                latest_total: None,
                last_progress_at: Utc::now(),
                idle_timeout: Duration::from_secs(60),
                max_total_timeout: Duration::from_secs(300),
                reset_on_progress: true,
                state: CallState::Running,
            },
        );
        engine.token_calls.write().await.insert("tok".to_string(), vec![call_id]);

        engine
            .record_progress(&ProgressParams {
                progress_token: token.clone(),
                progress: 10.0,
                total: Some(10.0),
                message: None,
            })
            .await;

        assert!(engine.token_calls.read().await.get("tok").is_none());
        let call = engine.active.read().await.get(&call_id).cloned().unwrap();
        assert_eq!(call.state, CallState::Running);
        assert_eq!(call.latest_progress, Some(10.0));
    }

    #[tokio::test]
    async fn progress_below_total_keeps_token_routing() {
        let engine = Arc::new(ToolCallEngine::new(RuntimeConfig::default(), Arc::new(GovernanceLog::new(10))));
        let call_id = Uuid::new_v4();
        let token = ProgressToken::String("tok2".into());
        engine.active.write().await.insert(
            call_id,
            ManagedCall {
                id: call_id,
                server_id: Uuid::nil(),
                tool_id: "t".into(),
                started_at: Utc::now(),
                progress_token: token.clone(),
                latest_progress: None,
                latest_total: None,
                last_progress_at: Utc::now(),
                idle_timeout: Duration::from_secs(60),
                max_total_timeout: Duration::from_secs(300),
                reset_on_progress: true,
                state: CallState::Running,
            },
        );
        engine.token_calls.write().await.insert("tok2".to_string(), vec![call_id]);

        engine
            .record_progress(&ProgressParams {
                progress_token: token,
                progress: 5.0,
                total: Some(10.0),
                message: None,
            })
            .await;

        assert!(engine.token_calls.read().await.get("tok2").is_some());
    }
}
