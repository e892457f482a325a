use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{EntryId, EntryStatus, QueueEntry, QueueStats};

/// Result of recording a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Back to pending with this many failed attempts
    Retrying { retries: u32 },
    /// Moved to the dead-letter queue
    DeadLettered,
}

/// Everything a queue owns; also the persisted record.
///
/// `queue` is kept ordered by descending priority, arrival order within a
/// priority. Pure bookkeeping: no clocks beyond what callers pass in, no I/O.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueState<P> {
    pub queue: Vec<QueueEntry<P>>,
    pub dead_letter_queue: Vec<QueueEntry<P>>,
    pub stats: QueueStats,
}

impl<P> Default for QueueState<P> {
    fn default() -> Self {
        Self {
            queue: Vec::new(),
            dead_letter_queue: Vec::new(),
            stats: QueueStats::default(),
        }
    }
}

impl<P> QueueState<P> {
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.count_status(EntryStatus::Pending)
    }

    pub fn processing_count(&self) -> usize {
        self.count_status(EntryStatus::Processing)
    }

    fn count_status(&self, status: EntryStatus) -> usize {
        self.queue.iter().filter(|e| e.status == status).count()
    }

    fn position(&self, id: &EntryId) -> Option<usize> {
        self.queue.iter().position(|e| &e.id == id)
    }

    pub fn get(&self, id: &EntryId) -> Option<&QueueEntry<P>> {
        self.queue.iter().find(|e| &e.id == id)
    }

    /// True while a pending entry carries this dedupe key
    pub fn has_pending_dedupe(&self, key: &str) -> bool {
        self.queue
            .iter()
            .any(|e| e.is_pending() && e.dedupe_key.as_deref() == Some(key))
    }

    /// Insert in priority order (higher first, FIFO within a priority)
    pub fn insert(&mut self, entry: QueueEntry<P>) {
        let pos = self
            .queue
            .iter()
            .position(|existing| existing.priority < entry.priority)
            .unwrap_or(self.queue.len());
        self.queue.insert(pos, entry);
    }

    /// Remove pending entries whose TTL has elapsed
    pub fn purge_expired(&mut self, now: DateTime<Utc>) -> Vec<QueueEntry<P>> {
        let mut expired = Vec::new();
        let mut kept = Vec::with_capacity(self.queue.len());
        for mut entry in self.queue.drain(..) {
            if entry.is_expired(now) {
                entry.expire();
                expired.push(entry);
            } else {
                kept.push(entry);
            }
        }
        self.queue = kept;
        self.stats.expired += expired.len() as u64;
        expired
    }

    /// Drop the lowest-priority, oldest pending entry
    pub fn evict_one(&mut self) -> Option<QueueEntry<P>> {
        let (idx, _) = self
            .queue
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_pending())
            .min_by(|(_, a), (_, b)| {
                a.priority
                    .cmp(&b.priority)
                    .then(a.created_at.cmp(&b.created_at))
            })?;
        self.stats.evicted += 1;
        Some(self.queue.remove(idx))
    }

    /// Take the first pending entry and mark it processing
    pub fn next_pending(&mut self) -> Option<&QueueEntry<P>> {
        let entry = self.queue.iter_mut().find(|e| e.is_pending())?;
        entry.start_processing();
        Some(entry)
    }

    /// Remove a completed entry from the live queue
    pub fn complete(&mut self, id: &EntryId) -> Option<QueueEntry<P>> {
        let idx = self.position(id)?;
        let mut entry = self.queue.remove(idx);
        entry.complete();
        self.stats.processed += 1;
        Some(entry)
    }

    /// Charge a failed attempt; dead-letter the entry once the budget is spent
    pub fn fail(
        &mut self,
        id: &EntryId,
        error: String,
        max_retries: u32,
        max_dead_letters: usize,
    ) -> Option<FailOutcome> {
        let idx = self.position(id)?;
        if !self.queue[idx].record_failure(error, max_retries) {
            return Some(FailOutcome::Retrying {
                retries: self.queue[idx].retries,
            });
        }

        let entry = self.queue.remove(idx);
        self.stats.failed += 1;
        self.dead_letter_queue.push(entry);
        if self.dead_letter_queue.len() > max_dead_letters {
            let overflow = self.dead_letter_queue.len() - max_dead_letters;
            self.dead_letter_queue.drain(..overflow);
        }
        Some(FailOutcome::DeadLettered)
    }

    /// Return an in-flight entry to pending without charging it
    pub fn defer(&mut self, id: &EntryId) -> bool {
        match self.queue.iter_mut().find(|e| &e.id == id) {
            Some(entry) => {
                entry.defer();
                true
            }
            None => false,
        }
    }

    /// Remove an entry from the dead-letter queue, along with the slot it held
    pub fn take_dead_letter(&mut self, id: &EntryId) -> Option<(usize, QueueEntry<P>)> {
        let idx = self.dead_letter_queue.iter().position(|e| &e.id == id)?;
        Some((idx, self.dead_letter_queue.remove(idx)))
    }

    /// Put a dead letter back into the slot [`take_dead_letter`](Self::take_dead_letter) returned
    pub fn restore_dead_letter(&mut self, idx: usize, entry: QueueEntry<P>) {
        let idx = idx.min(self.dead_letter_queue.len());
        self.dead_letter_queue.insert(idx, entry);
    }

    /// Entries left `processing` by a crash go back to pending
    pub fn recover_in_flight(&mut self) -> usize {
        let mut recovered = 0;
        for entry in self.queue.iter_mut().filter(|e| e.status == EntryStatus::Processing) {
            entry.defer();
            recovered += 1;
        }
        recovered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::Duration;

    fn entry(priority: i32) -> QueueEntry<i32> {
        QueueEntry::new(priority, priority, Duration::from_secs(60), None)
    }

    fn drain_order(state: &mut QueueState<i32>) -> Vec<i32> {
        let mut order = Vec::new();
        while let Some(next) = state.next_pending() {
            let id = next.id.clone();
            order.push(next.payload);
            state.complete(&id);
        }
        order
    }

    #[test]
    fn test_priority_order() {
        let mut state = QueueState::default();
        for p in [1, 5, 2] {
            state.insert(entry(p));
        }
        assert_eq!(drain_order(&mut state), vec![5, 2, 1]);
        assert_eq!(state.stats.processed, 3);
    }

    #[test]
    fn test_fifo_within_priority() {
        let mut state = QueueState::default();
        let first = entry(1);
        let second = entry(1);
        let (a, b) = (first.id.clone(), second.id.clone());
        state.insert(first);
        state.insert(entry(0));
        state.insert(second);

        assert_eq!(state.queue[0].id, a);
        assert_eq!(state.queue[1].id, b);
    }

    #[test]
    fn test_dedupe_only_blocks_pending() {
        let mut state = QueueState::default();
        state.insert(QueueEntry::new(1, 0, Duration::from_secs(60), Some("BUY-AAPL".into())));
        assert!(state.has_pending_dedupe("BUY-AAPL"));
        assert!(!state.has_pending_dedupe("SELL-AAPL"));

        state.next_pending();
        assert!(!state.has_pending_dedupe("BUY-AAPL"));
    }

    #[test]
    fn test_purge_expired_skips_processing() {
        let mut state = QueueState::default();
        state.insert(QueueEntry::new(1, 1, Duration::ZERO, None));
        state.insert(QueueEntry::new(2, 0, Duration::ZERO, None));
        state.next_pending();

        let later = Utc::now() + chrono::Duration::seconds(1);
        let expired = state.purge_expired(later);

        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].payload, 2);
        assert_eq!(expired[0].status, EntryStatus::Expired);
        assert_eq!(state.len(), 1);
        assert_eq!(state.stats.expired, 1);
    }

    #[test]
    fn test_evicts_lowest_priority_oldest_pending() {
        let mut state = QueueState::default();
        state.insert(entry(0));
        state.insert(entry(5));
        state.insert(entry(0));
        let oldest_low = state.queue[1].id.clone();

        let evicted = state.evict_one().unwrap();
        assert_eq!(evicted.id, oldest_low);
        assert_eq!(state.stats.evicted, 1);
        assert_eq!(state.len(), 2);
    }

    #[test]
    fn test_fail_moves_to_dead_letters_and_caps() {
        let mut state = QueueState::default();
        for p in 0..3 {
            state.insert(entry(p));
        }

        for _ in 0..3 {
            let id = state.next_pending().unwrap().id.clone();
            assert_eq!(state.fail(&id, "boom".into(), 1, 2), Some(FailOutcome::DeadLettered));
        }

        assert!(state.is_empty());
        assert_eq!(state.stats.failed, 3);
        let kept: Vec<i32> = state.dead_letter_queue.iter().map(|e| e.payload).collect();
        assert_eq!(kept, vec![1, 0]);
    }

    #[test]
    fn test_fail_with_budget_left_returns_to_pending() {
        let mut state = QueueState::default();
        state.insert(entry(0));
        let id = state.next_pending().unwrap().id.clone();

        assert_eq!(
            state.fail(&id, "boom".into(), 3, 10),
            Some(FailOutcome::Retrying { retries: 1 })
        );
        assert_eq!(state.pending_count(), 1);
        assert_eq!(state.get(&id).unwrap().last_error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_restore_dead_letter_keeps_its_slot() {
        let mut state = QueueState::default();
        for p in 0..3 {
            state.insert(entry(p));
        }
        for _ in 0..3 {
            let id = state.next_pending().unwrap().id.clone();
            state.fail(&id, "boom".into(), 1, 10);
        }
        let before: Vec<i32> = state.dead_letter_queue.iter().map(|e| e.payload).collect();
        let middle = state.dead_letter_queue[1].id.clone();

        let (idx, taken) = state.take_dead_letter(&middle).unwrap();
        assert_eq!(idx, 1);
        state.restore_dead_letter(idx, taken);

        let after: Vec<i32> = state.dead_letter_queue.iter().map(|e| e.payload).collect();
        assert_eq!(after, before);
    }

    #[test]
    fn test_recover_in_flight() {
        let mut state = QueueState::default();
        state.insert(entry(0));
        state.next_pending();
        assert_eq!(state.processing_count(), 1);

        assert_eq!(state.recover_in_flight(), 1);
        assert_eq!(state.pending_count(), 1);
    }

    proptest! {
        #[test]
        fn prop_drain_order_is_stable_priority_sort(priorities in proptest::collection::vec(-5i32..5, 0..40)) {
            let mut state = QueueState::default();
            let mut expected: Vec<(i32, usize)> = Vec::new();
            for (arrival, p) in priorities.iter().enumerate() {
                state.insert(QueueEntry::new(arrival as i32, *p, Duration::from_secs(60), None));
                expected.push((*p, arrival));
            }
            expected.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
            let expected: Vec<i32> = expected.into_iter().map(|(_, arrival)| arrival as i32).collect();

            prop_assert_eq!(drain_order(&mut state), expected);
        }
    }
}
