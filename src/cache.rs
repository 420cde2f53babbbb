// src/cache.rs
// Metadata cache: a per-server snapshot of tools/resources/resource-
// templates/prompts/roots, with a TTL-based staleness rule shared by the
// connection manager (live cache) and the persisted record (distilled
// §3, §4.4, §4.10).

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::protocol::{
    PromptDescriptor, ResourceDescriptor, ResourceTemplateDescriptor, RootDescriptor, ServerInfo,
    ToolDescriptor,
};

pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Staleness threshold named by the distilled spec; callers should prefer
/// `RuntimeConfig::metadata_ttl` (the env-overridable form) but this
/// constant documents the spec-default value directly.
pub const DEFAULT_METADATA_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataCacheRecord {
    pub cached_at: DateTime<Utc>,
    pub server_info: ServerInfo,
    #[serde(default)]
    pub tools: Vec<ToolDescriptorRecord>,
    #[serde(default)]
    pub resources: Vec<ResourceDescriptor>,
    #[serde(default)]
    pub resource_templates: Vec<ResourceTemplateDescriptor>,
    #[serde(default)]
    pub prompts: Vec<PromptDescriptor>,
    #[serde(default)]
    pub roots: Vec<RootDescriptor>,
}

/// `ToolDescriptor` carries a raw, non-serializable-shape-stable
/// `serde_json::Value`; the persisted record stores the same fields
/// through a plain serializable mirror so cache files remain portable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptorRecord {
    pub id: String,
    pub description: Option<String>,
    pub input_schema: Option<serde_json::Value>,
    pub output_schema: Option<serde_json::Value>,
}

impl From<&ToolDescriptor> for ToolDescriptorRecord {
    fn from(t: &ToolDescriptor) -> Self {
        Self {
            id: t.id.clone(),
            description: t.description.clone(),
            input_schema: t.input_schema.clone(),
            output_schema: t.output_schema.clone(),
        }
    }
}

impl From<&ToolDescriptorRecord> for ToolDescriptor {
    fn from(r: &ToolDescriptorRecord) -> Self {
        ToolDescriptor {
            id: r.id.clone(),
            description: r.description.clone(),
            input_schema: r.input_schema.clone(),
            output_schema: r.output_schema.clone(),
            raw: serde_json::Value::Null,
        }
    }
}

impl MetadataCacheRecord {
    pub fn is_stale(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        let ttl = ChronoDuration::from_std(ttl).unwrap_or(ChronoDuration::max_value());
        now - self.cached_at >= ttl
    }
}

/// The schema-versioned, persistable shape named in distilled §6
/// ("Persisted state"). This crate does not perform file/KV I/O — that's
/// an external collaborator per §1 — but defines the stable contract a
/// host's persistence layer serializes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedServerRecord {
    pub schema_version: u32,
    pub descriptor: crate::descriptor::ServerDescriptor,
    #[serde(default)]
    pub metadata_cache: Option<MetadataCacheRecord>,
}

impl PersistedServerRecord {
    pub fn new(descriptor: crate::descriptor::ServerDescriptor) -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            descriptor,
            metadata_cache: None,
        }
    }

    /// `true` exactly when `now - cached_at >= ttl`; `false` when there is
    /// no cache at all (an absent cache is "not cached", not "stale").
    pub fn is_stale(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        match &self.metadata_cache {
            Some(cache) => cache.is_stale(ttl, now),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_cached_at(cached_at: DateTime<Utc>) -> MetadataCacheRecord {
        MetadataCacheRecord {
            cached_at,
            server_info: ServerInfo::default(),
            tools: vec![],
            resources: vec![],
            resource_templates: vec![],
            prompts: vec![],
            roots: vec![],
        }
    }

    #[test]
    fn stale_boundary_is_inclusive() {
        let now = Utc::now();
        let ttl = Duration::from_secs(300);

        let exactly_at_ttl = record_cached_at(now - ChronoDuration::seconds(300));
        assert!(exactly_at_ttl.is_stale(ttl, now));

        let just_inside = record_cached_at(now - ChronoDuration::seconds(299));
        assert!(!just_inside.is_stale(ttl, now));

        let just_outside = record_cached_at(now - ChronoDuration::seconds(301));
        assert!(just_outside.is_stale(ttl, now));
    }

    #[test]
    fn absent_cache_counts_as_stale() {
        let descriptor = crate::descriptor::ServerDescriptor::new(
            "test",
            crate::descriptor::TransportKind::StreamableHttp {
                endpoint: "http://localhost/mcp".into(),
            },
        );
        let record = PersistedServerRecord::new(descriptor);
        assert!(record.is_stale(Duration::from_secs(300), Utc::now()));
    }
}
