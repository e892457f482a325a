use serde::{Deserialize, Serialize};

/// Lifetime counters for one named queue (persisted with the snapshot)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub enqueued: u64,
    pub processed: u64,
    pub failed: u64,
    pub expired: u64,
    pub deduplicated: u64,
    #[serde(default)]
    pub evicted: u64,
}

impl QueueStats {
    /// Share of finished entries that completed, in percent
    pub fn success_rate(&self) -> f64 {
        let finished = (self.processed + self.failed) as f64;
        if finished == 0.0 {
            100.0
        } else {
            (self.processed as f64 / finished) * 100.0
        }
    }
}

/// Pull-based status snapshot of a queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub name: String,
    /// Entries in the live queue (pending + processing)
    pub size: usize,
    pub pending: usize,
    pub processing: usize,
    pub dead_letters: usize,
    pub paused: bool,
    pub running: bool,
    pub stats: QueueStats,
}
