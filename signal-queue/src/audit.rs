use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::EntryId;

/// Kind of lifecycle fact recorded in the audit trail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    Enqueued,
    Completed,
    DeadLettered,
    Expired,
    Evicted,
    Requeued,
    BreakerStateChange,
}

impl AuditKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Enqueued => "enqueued",
            Self::Completed => "completed",
            Self::DeadLettered => "dead_lettered",
            Self::Expired => "expired",
            Self::Evicted => "evicted",
            Self::Requeued => "requeued",
            Self::BreakerStateChange => "breaker_state_change",
        }
    }
}

/// One structured audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub at: DateTime<Utc>,
    /// Queue or breaker name
    pub source: String,
    pub kind: AuditKind,
    pub entry_id: Option<EntryId>,
    pub detail: serde_json::Value,
}

impl AuditEntry {
    pub fn new(source: impl Into<String>, kind: AuditKind) -> Self {
        Self {
            at: Utc::now(),
            source: source.into(),
            kind,
            entry_id: None,
            detail: serde_json::Value::Null,
        }
    }

    pub fn with_entry(mut self, entry_id: &EntryId) -> Self {
        self.entry_id = Some(entry_id.clone());
        self
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }
}

/// Receiver of lifecycle facts (audit log, UI feed, ...)
pub trait AuditSink: Send + Sync {
    fn write(&self, entry: AuditEntry);
}

/// Forwards audit entries to `tracing`
#[derive(Debug, Clone, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn write(&self, entry: AuditEntry) {
        info!(
            target: "signal_queue::audit",
            source = %entry.source,
            kind = entry.kind.name(),
            entry_id = entry.entry_id.as_ref().map(|id| id.as_str()).unwrap_or("-"),
            detail = %entry.detail,
            "audit"
        );
    }
}

/// Keeps audit entries in memory, most recent last
#[derive(Clone, Default)]
pub struct MemoryAuditSink {
    entries: Arc<Mutex<Vec<AuditEntry>>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().clone()
    }

    pub fn count(&self, kind: AuditKind) -> usize {
        self.entries.lock().iter().filter(|e| e.kind == kind).count()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl AuditSink for MemoryAuditSink {
    fn write(&self, entry: AuditEntry) {
        self.entries.lock().push(entry);
    }
}
