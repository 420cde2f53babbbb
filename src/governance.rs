// src/governance.rs
// Governance log: a bounded, categorized audit ring (distilled §3, §4.9).
// This is the primary observability surface the host exposes to a UI; the
// categories are stable (lifecycle, cache, routing, tool_call,
// notification, server_log, progress).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GovernanceCategory {
    Lifecycle,
    Cache,
    Routing,
    ToolCall,
    Notification,
    ServerLog,
    Progress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GovernanceLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct GovernanceEntry {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub level: GovernanceLevel,
    pub category: GovernanceCategory,
    pub server_id: Option<Uuid>,
    pub server_name: Option<String>,
    pub message: String,
    pub payload: Option<Value>,
}

/// Bounded append-only ring; oldest entries are evicted once over
/// capacity (default 1,200 per the distilled spec).
pub struct GovernanceLog {
    capacity: usize,
    next_id: AtomicU64,
    entries: RwLock<VecDeque<GovernanceEntry>>,
}

impl GovernanceLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            next_id: AtomicU64::new(1),
            entries: RwLock::new(VecDeque::with_capacity(capacity.min(4096))),
        }
    }

    pub async fn push(
        &self,
        level: GovernanceLevel,
        category: GovernanceCategory,
        server_id: Option<Uuid>,
        server_name: Option<String>,
        message: impl Into<String>,
        payload: Option<Value>,
    ) {
        let entry = GovernanceEntry {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            timestamp: Utc::now(),
            level,
            category,
            server_id,
            server_name,
            message: message.into(),
            payload,
        };
        let mut entries = self.entries.write().await;
        entries.push_back(entry);
        while entries.len() > self.capacity {
            entries.pop_front();
        }
    }

    pub async fn snapshot(&self) -> Vec<GovernanceEntry> {
        self.entries.read().await.iter().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn evicts_oldest_entries_past_capacity() {
        let log = GovernanceLog::new(3);
        for i in 0..5 {
            log.push(
                GovernanceLevel::Info,
                GovernanceCategory::Lifecycle,
                None,
                None,
                format!("entry {i}"),
                None,
            )
            .await;
        }
        let snapshot = log.snapshot().await;
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot[0].message, "entry 2");
        assert_eq!(snapshot[2].message, "entry 4");
    }

    #[tokio::test]
    async fn entries_get_monotonic_ids() {
        let log = GovernanceLog::new(10);
        log.push(GovernanceLevel::Info, GovernanceCategory::Cache, None, None, "a", None)
            .await;
        log.push(GovernanceLevel::Info, GovernanceCategory::Cache, None, None, "b", None)
            .await;
        let snapshot = log.snapshot().await;
        assert!(snapshot[1].id > snapshot[0].id);
    }
}
