// src/aggregator.rs
// Aggregator & router (distilled §4.6): mints globally unique internal
// names for tools/resources/resource-templates/prompts across every
// selected server and resolves an internal name back to its owner.
// `build()` is a pure function of (descriptor set, status snapshots) —
// the connection manager rebuilds and swaps this wholesale after any
// status mutation (distilled §5, "Shared-resource policy").

use std::collections::{HashMap, HashSet};

use uuid::Uuid;

use crate::descriptor::{ApprovalPolicy, ServerDescriptor};
use crate::error::{McpError, McpResult};
use crate::protocol::{PromptDescriptor, ResourceDescriptor, ResourceTemplateDescriptor, ToolDescriptor};
use crate::state::ConnectionState;

/// What the aggregator needs to know about one server to decide whether
/// it contributes to this rebuild and what it contributes.
#[derive(Debug, Clone)]
pub struct ServerSnapshot {
    pub descriptor: ServerDescriptor,
    pub state: ConnectionState,
    pub metadata_fresh: bool,
    pub tools: Vec<ToolDescriptor>,
    pub resources: Vec<ResourceDescriptor>,
    pub resource_templates: Vec<ResourceTemplateDescriptor>,
    pub prompts: Vec<PromptDescriptor>,
}

impl ServerSnapshot {
    /// A selected server not currently `ready` contributes only if its
    /// cache is non-empty and still fresh — stale-but-cached servers are
    /// skipped so the host never advertises phantom capabilities.
    fn contributes(&self) -> bool {
        if !self.descriptor.selected_for_chat {
            return false;
        }
        if self.state.is_ready() {
            return true;
        }
        let has_cache = !self.tools.is_empty()
            || !self.resources.is_empty()
            || !self.resource_templates.is_empty()
            || !self.prompts.is_empty();
        has_cache && self.metadata_fresh
    }
}

#[derive(Debug, Clone)]
pub struct RouteTarget {
    pub server_id: Uuid,
    pub server_name: String,
    pub id: String,
}

#[derive(Debug, Clone)]
pub struct AggregatedTool {
    pub internal_name: String,
    pub canonical_name: String,
    pub server_id: Uuid,
    pub server_name: String,
    pub descriptor: ToolDescriptor,
}

#[derive(Debug, Clone)]
pub struct AggregatedResource {
    pub internal_name: String,
    pub server_id: Uuid,
    pub server_name: String,
    pub descriptor: ResourceDescriptor,
}

#[derive(Debug, Clone)]
pub struct AggregatedResourceTemplate {
    pub internal_name: String,
    pub server_id: Uuid,
    pub server_name: String,
    pub descriptor: ResourceTemplateDescriptor,
}

#[derive(Debug, Clone)]
pub struct AggregatedPrompt {
    pub internal_name: String,
    pub server_id: Uuid,
    pub server_name: String,
    pub descriptor: PromptDescriptor,
}

/// The three read-mostly projections the host and managed-call engine
/// consult: aggregated lists plus the alias/canonical → owner router
/// tables (distilled §4.6, items 1-3).
#[derive(Debug, Clone, Default)]
pub struct Aggregation {
    pub tools: Vec<AggregatedTool>,
    pub resources: Vec<AggregatedResource>,
    pub resource_templates: Vec<AggregatedResourceTemplate>,
    pub prompts: Vec<AggregatedPrompt>,
    tool_router: HashMap<String, RouteTarget>,
    resource_router: HashMap<String, RouteTarget>,
    prompt_router: HashMap<String, RouteTarget>,
}

impl Aggregation {
    pub fn resolve_tool(&self, internal_name: &str) -> Option<&RouteTarget> {
        self.tool_router.get(internal_name)
    }

    pub fn resolve_resource(&self, internal_name: &str) -> Option<&RouteTarget> {
        self.resource_router.get(internal_name)
    }

    pub fn resolve_prompt(&self, internal_name: &str) -> Option<&RouteTarget> {
        self.prompt_router.get(internal_name)
    }
}

fn canonical_name(server_id: Uuid, suffix: &str) -> String {
    format!("mcp://{server_id}/{suffix}")
}

fn short_alias(server_id: Uuid, suffix: &str) -> String {
    let short_uuid = server_id.simple().to_string();
    format!("mcp_{}_{suffix}", &short_uuid[..8])
}

/// Rebuild the aggregated lists and router tables from scratch. Deterministic
/// given the same input: servers are processed in the order given, and
/// tools/resources/prompts within a server keep the server's reported
/// order (distilled §8, "Aggregator output is a pure function").
pub fn build(snapshots: &[ServerSnapshot]) -> Aggregation {
    let mut out = Aggregation::default();
    let mut used_aliases: HashSet<String> = HashSet::new();

    for snapshot in snapshots {
        if !snapshot.contributes() {
            continue;
        }
        let server_id = snapshot.descriptor.id;
        let server_name = snapshot.descriptor.display_name.clone();

        for tool in &snapshot.tools {
            if !snapshot.descriptor.is_tool_enabled(&tool.id) {
                continue;
            }
            if snapshot.descriptor.approval_for(&tool.id) == ApprovalPolicy::AlwaysDeny {
                continue;
            }
            let canonical = canonical_name(server_id, &tool.id);
            let target = RouteTarget {
                server_id,
                server_name: server_name.clone(),
                id: tool.id.clone(),
            };
            out.tool_router.insert(canonical.clone(), target.clone());

            let alias = short_alias(server_id, &tool.id);
            let internal_name = if used_aliases.insert(alias.clone()) {
                out.tool_router.insert(alias.clone(), target);
                alias
            } else {
                canonical.clone()
            };

            out.tools.push(AggregatedTool {
                internal_name,
                canonical_name: canonical,
                server_id,
                server_name: server_name.clone(),
                descriptor: tool.clone(),
            });
        }

        for resource in &snapshot.resources {
            let canonical = canonical_name(server_id, &resource.uri);
            out.resource_router.insert(
                canonical.clone(),
                RouteTarget {
                    server_id,
                    server_name: server_name.clone(),
                    id: resource.uri.clone(),
                },
            );
            out.resources.push(AggregatedResource {
                internal_name: canonical,
                server_id,
                server_name: server_name.clone(),
                descriptor: resource.clone(),
            });
        }

        for template in &snapshot.resource_templates {
            let canonical = canonical_name(server_id, &template.uri_template);
            out.resource_templates.push(AggregatedResourceTemplate {
                internal_name: canonical,
                server_id,
                server_name: server_name.clone(),
                descriptor: template.clone(),
            });
        }

        for prompt in &snapshot.prompts {
            let canonical = canonical_name(server_id, &prompt.name);
            out.prompt_router.insert(
                canonical.clone(),
                RouteTarget {
                    server_id,
                    server_name: server_name.clone(),
                    id: prompt.name.clone(),
                },
            );
            out.prompts.push(AggregatedPrompt {
                internal_name: canonical,
                server_id,
                server_name: server_name.clone(),
                descriptor: prompt.clone(),
            });
        }
    }

    out
}

/// Re-check a tool's enable flag and approval policy against the
/// descriptor's *current* state at invocation time — the aggregation the
/// router table came from may already be one rebuild stale (distilled
/// §4.6, "Enable/approval enforcement").
pub fn enforce_tool_policy(descriptor: &ServerDescriptor, tool_id: &str) -> McpResult<()> {
    if !descriptor.is_tool_enabled(tool_id) {
        return Err(McpError::ToolDeniedByPolicy {
            name: tool_id.to_string(),
        });
    }
    if descriptor.approval_for(tool_id) == ApprovalPolicy::AlwaysDeny {
        return Err(McpError::ToolDeniedByPolicy {
            name: tool_id.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::TransportKind;

    fn snapshot_with_tools(display_name: &str, tool_ids: &[&str]) -> ServerSnapshot {
        let mut descriptor = ServerDescriptor::new(
            display_name,
            TransportKind::StreamableHttp {
                endpoint: "http://localhost/mcp".into(),
            },
        );
        descriptor.selected_for_chat = true;
        ServerSnapshot {
            descriptor,
            state: ConnectionState::Ready,
            metadata_fresh: true,
            tools: tool_ids
                .iter()
                .map(|id| ToolDescriptor {
                    id: id.to_string(),
                    description: None,
                    input_schema: None,
                    output_schema: None,
                    raw: serde_json::Value::Null,
                })
                .collect(),
            resources: vec![],
            resource_templates: vec![],
            prompts: vec![],
        }
    }

    #[test]
    fn disabled_and_always_deny_tools_are_excluded() {
        let mut snapshot = snapshot_with_tools("srv", &["a", "b", "c"]);
        snapshot.descriptor.tool_enabled.insert("a".to_string(), false);
        snapshot
            .descriptor
            .tool_approval
            .insert("b".to_string(), ApprovalPolicy::AlwaysDeny);

        let agg = build(&[snapshot]);
        let names: Vec<_> = agg.tools.iter().map(|t| t.descriptor.id.clone()).collect();
        assert_eq!(names, vec!["c".to_string()]);
    }

    #[test]
    fn unready_stale_server_is_skipped() {
        let mut snapshot = snapshot_with_tools("srv", &["a"]);
        snapshot.state = ConnectionState::Failed { reason: "x".into() };
        snapshot.metadata_fresh = false;

        let agg = build(&[snapshot]);
        assert!(agg.tools.is_empty());
    }

    #[test]
    fn unready_fresh_cached_server_still_contributes() {
        let mut snapshot = snapshot_with_tools("srv", &["a"]);
        snapshot.state = ConnectionState::Reconnecting {
            attempt: 1,
            scheduled_at: chrono::Utc::now(),
            reason: "x".into(),
        };
        snapshot.metadata_fresh = true;

        let agg = build(&[snapshot]);
        assert_eq!(agg.tools.len(), 1);
    }

    #[test]
    fn colliding_short_alias_falls_back_to_canonical() {
        let snap_a = snapshot_with_tools("a", &["shared"]);
        let snap_b = snapshot_with_tools("b", &["shared"]);
        // Force an alias collision by using identical server ids.
        let mut snap_b = snap_b;
        snap_b.descriptor.id = snap_a.descriptor.id;

        let agg = build(&[snap_a, snap_b]);
        assert_eq!(agg.tools.len(), 2);
        assert_ne!(agg.tools[0].internal_name, agg.tools[1].internal_name);
        assert_eq!(agg.tools[1].internal_name, agg.tools[1].canonical_name);
    }

    #[test]
    fn router_resolves_both_alias_and_canonical_forms() {
        let snapshot = snapshot_with_tools("srv", &["calc"]);
        let server_id = snapshot.descriptor.id;
        let agg = build(&[snapshot]);

        let canonical = canonical_name(server_id, "calc");
        assert!(agg.resolve_tool(&canonical).is_some());
        let alias = &agg.tools[0].internal_name;
        assert!(agg.resolve_tool(alias).is_some());
    }

    #[test]
    fn enforce_policy_rejects_always_deny() {
        let mut descriptor = ServerDescriptor::new(
            "srv",
            TransportKind::StreamableHttp {
                endpoint: "http://localhost/mcp".into(),
            },
        );
        descriptor.tool_approval.insert("x".to_string(), ApprovalPolicy::AlwaysDeny);
        let err = enforce_tool_policy(&descriptor, "x").unwrap_err();
        assert!(matches!(err, McpError::ToolDeniedByPolicy { .. }));
    }
}
