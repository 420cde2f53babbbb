// src/notifications.rs
// Upstream notification types and the host-facing delegate trait. The
// streaming channel feeds `(method, params)` pairs into the manager
// (distilled §4.1, §6 inbound-notification catalogue); this module turns
// that pair into a typed `McpNotification` and fans it to whatever the
// manager or a host-registered observer wants to do with it.

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::protocol::{CancelledParams, ProgressParams};

#[derive(Debug, Clone)]
pub enum McpNotification {
    ToolsListChanged,
    ResourcesListChanged,
    ResourceUpdated { uri: Option<String> },
    PromptsListChanged,
    RootsListChanged,
    Progress(ProgressParams),
    ServerLog { level: String, logger: Option<String>, data: Value },
    Cancelled(CancelledParams),
    Unknown { method: String },
}

impl McpNotification {
    pub fn from_wire(method: &str, params: Option<Value>) -> Self {
        match method {
            "notifications/tools/list_changed" => McpNotification::ToolsListChanged,
            "notifications/resources/list_changed" => McpNotification::ResourcesListChanged,
            "notifications/resources/updated" => McpNotification::ResourceUpdated {
                uri: params
                    .as_ref()
                    .and_then(|p| p.get("uri"))
                    .and_then(Value::as_str)
                    .map(str::to_string),
            },
            "notifications/prompts/list_changed" => McpNotification::PromptsListChanged,
            "notifications/roots/list_changed" => McpNotification::RootsListChanged,
            "notifications/progress" => match params.and_then(|p| serde_json::from_value(p).ok()) {
                Some(progress) => McpNotification::Progress(progress),
                None => McpNotification::Unknown {
                    method: method.to_string(),
                },
            },
            "notifications/message" => {
                let level = params
                    .as_ref()
                    .and_then(|p| p.get("level"))
                    .and_then(Value::as_str)
                    .unwrap_or("info")
                    .to_string();
                let logger = params
                    .as_ref()
                    .and_then(|p| p.get("logger"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                let data = params
                    .as_ref()
                    .and_then(|p| p.get("data"))
                    .cloned()
                    .unwrap_or(Value::Null);
                McpNotification::ServerLog { level, logger, data }
            }
            "notifications/cancelled" => match params.and_then(|p| serde_json::from_value(p).ok()) {
                Some(cancelled) => McpNotification::Cancelled(cancelled),
                None => McpNotification::Unknown {
                    method: method.to_string(),
                },
            },
            other => McpNotification::Unknown {
                method: other.to_string(),
            },
        }
    }

    /// Whether this notification invalidates the metadata cache for its
    /// originating server (distilled §4.4, "List-changed notifications").
    pub fn invalidates_cache(&self) -> bool {
        matches!(
            self,
            McpNotification::ToolsListChanged
                | McpNotification::ResourcesListChanged
                | McpNotification::ResourceUpdated { .. }
                | McpNotification::PromptsListChanged
                | McpNotification::RootsListChanged
        )
    }
}

/// Host-facing observer for every notification that flows upstream, keyed
/// by the originating server so a UI can route log lines, progress bars,
/// etc per server.
#[async_trait]
pub trait NotificationHandler: Send + Sync {
    async fn handle(&self, server_id: Uuid, notification: &McpNotification);
}

/// The default handler just traces; hosts register their own to drive UI.
pub struct TracingNotificationHandler;

#[async_trait]
impl NotificationHandler for TracingNotificationHandler {
    async fn handle(&self, server_id: Uuid, notification: &McpNotification) {
        match notification {
            McpNotification::ServerLog { level, data, .. } => match level.as_str() {
                "error" => tracing::error!(%server_id, ?data, "server log"),
                "warning" => tracing::warn!(%server_id, ?data, "server log"),
                _ => tracing::debug!(%server_id, ?data, "server log"),
            },
            McpNotification::Progress(p) => {
                tracing::debug!(%server_id, progress = p.progress, total = ?p.total, "progress");
            }
            other => tracing::debug!(%server_id, ?other, "notification"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_progress_notification() {
        let params = serde_json::json!({"progressToken": "tok", "progress": 1.0, "total": 2.0});
        let notification = McpNotification::from_wire("notifications/progress", Some(params));
        assert!(matches!(notification, McpNotification::Progress(_)));
    }

    #[test]
    fn unknown_method_is_preserved_for_diagnostics() {
        let notification = McpNotification::from_wire("notifications/something_new", None);
        assert!(matches!(notification, McpNotification::Unknown { .. }));
    }

    #[test]
    fn list_changed_notifications_invalidate_cache() {
        assert!(McpNotification::ToolsListChanged.invalidates_cache());
        assert!(!McpNotification::Cancelled(CancelledParams::new(
            crate::protocol::JsonRpcId::String("x".into()),
            "r"
        ))
        .invalidates_cache());
    }
}
