// src/descriptor.rs
// Server descriptor: the immutable-identity, mutable-configuration record
// a host persists per configured MCP server (distilled §3).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocol::ClientInfo;

/// Which wire transport a descriptor's endpoint speaks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportKind {
    StreamableHttp { endpoint: String },
    SseSplit { endpoint: String },
    OAuthWrapped {
        inner: Box<TransportKind>,
        /// Opaque identifier the host's credential-provider registry
        /// resolves to a `CredentialProvider`; this crate does not
        /// implement the token endpoint itself (distilled §1).
        credential_provider_id: String,
    },
}

/// Per-tool approval gate (distilled §3).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalPolicy {
    #[default]
    AskEveryTime,
    AlwaysAllow,
    AlwaysDeny,
}

/// Immutable identity + mutable configuration for one configured MCP
/// server. The UUID never changes for the lifetime of the descriptor;
/// deleting it is the host's responsibility and cancels everything
/// referring to it (enforced by the connection manager on
/// `reload_descriptors`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerDescriptor {
    pub id: Uuid,
    pub display_name: String,
    #[serde(default)]
    pub notes: String,
    pub transport: TransportKind,
    #[serde(default)]
    pub tool_enabled: HashMap<String, bool>,
    #[serde(default)]
    pub tool_approval: HashMap<String, ApprovalPolicy>,
    pub selected_for_chat: bool,
    #[serde(default)]
    pub resumption_token: Option<String>,
    #[serde(default)]
    pub client_info: Option<ClientInfo>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub retry_on_failure: bool,
}

impl ServerDescriptor {
    pub fn new(display_name: impl Into<String>, transport: TransportKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            display_name: display_name.into(),
            notes: String::new(),
            transport,
            tool_enabled: HashMap::new(),
            tool_approval: HashMap::new(),
            selected_for_chat: true,
            resumption_token: None,
            client_info: None,
            headers: HashMap::new(),
            retry_on_failure: true,
        }
    }

    pub fn is_tool_enabled(&self, tool_id: &str) -> bool {
        self.tool_enabled.get(tool_id).copied().unwrap_or(true)
    }

    pub fn approval_for(&self, tool_id: &str) -> ApprovalPolicy {
        self.tool_approval.get(tool_id).copied().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_enable_tools_and_ask_for_approval() {
        let d = ServerDescriptor::new(
            "test",
            TransportKind::StreamableHttp {
                endpoint: "http://localhost/mcp".into(),
            },
        );
        assert!(d.is_tool_enabled("anything"));
        assert_eq!(d.approval_for("anything"), ApprovalPolicy::AskEveryTime);
    }

    #[test]
    fn id_is_stable_across_clones() {
        let d = ServerDescriptor::new(
            "test",
            TransportKind::StreamableHttp {
                endpoint: "http://localhost/mcp".into(),
            },
        );
        let cloned = d.clone();
        assert_eq!(d.id, cloned.id);
    }
}
