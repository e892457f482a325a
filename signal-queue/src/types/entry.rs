use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::EntryId;

/// Entry status lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    /// Waiting in the live queue
    Pending,

    /// Handed to the processor
    Processing,

    /// Processor succeeded; removed from the live queue
    Completed,

    /// Retry budget exhausted; moved to the dead-letter queue
    Failed,

    /// TTL elapsed before the entry ever ran
    Expired,
}

impl EntryStatus {
    /// Check if the entry left the live queue for good
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Expired)
    }

    /// Get the status name as a string
    pub fn name(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Expired => "expired",
        }
    }
}

impl std::fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Per-enqueue options
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
    /// Higher is more urgent
    pub priority: i32,

    /// Time-to-live; the queue default applies when unset
    pub ttl: Option<Duration>,

    /// Suppresses a second pending entry with the same key
    pub dedupe_key: Option<String>,
}

impl EnqueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }
}

/// One unit of work held by a [`SignalQueue`](crate::SignalQueue)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry<P> {
    pub id: EntryId,

    /// Opaque signal data owned by the producer
    pub payload: P,

    pub priority: i32,

    pub created_at: DateTime<Utc>,

    pub expires_at: DateTime<Utc>,

    pub dedupe_key: Option<String>,

    /// Failed attempts so far
    pub retries: u32,

    pub status: EntryStatus,

    /// Last processor error (set on failure, kept on dead letters)
    pub last_error: Option<String>,
}

impl<P> QueueEntry<P> {
    /// Create a new pending entry expiring `ttl` after now
    pub fn new(payload: P, priority: i32, ttl: Duration, dedupe_key: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: EntryId::new(),
            payload,
            priority,
            created_at: now,
            expires_at: expiry_from(now, ttl),
            dedupe_key,
            retries: 0,
            status: EntryStatus::Pending,
            last_error: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == EntryStatus::Pending
    }

    /// A pending entry whose TTL has elapsed
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.is_pending() && now >= self.expires_at
    }

    pub fn start_processing(&mut self) {
        self.status = EntryStatus::Processing;
    }

    pub fn complete(&mut self) {
        self.status = EntryStatus::Completed;
    }

    pub fn expire(&mut self) {
        self.status = EntryStatus::Expired;
    }

    /// Record a failed attempt; returns true once the retry budget is exhausted
    pub fn record_failure(&mut self, error: String, max_retries: u32) -> bool {
        self.retries += 1;
        self.last_error = Some(error);
        if self.retries >= max_retries {
            self.status = EntryStatus::Failed;
            true
        } else {
            self.status = EntryStatus::Pending;
            false
        }
    }

    /// Return to pending without charging the retry budget
    pub fn defer(&mut self) {
        self.status = EntryStatus::Pending;
    }

    /// Reset a dead letter for another full run
    pub fn requeue(&mut self, ttl: Duration) {
        let now = Utc::now();
        self.retries = 0;
        self.status = EntryStatus::Pending;
        self.created_at = now;
        self.expires_at = expiry_from(now, ttl);
    }
}

fn expiry_from(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
