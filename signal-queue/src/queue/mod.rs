//! Persistent priority queue with dedupe, TTL and a dead-letter queue.
//!
//! One entry is processed at a time. Each step purges expired entries, hands
//! the highest-priority pending entry to the registered [`Processor`] and then
//! completes, retries, defers or dead-letters it. Every mutation rewrites the
//! full snapshot to the configured [`Store`].

pub mod state;

pub use state::{FailOutcome, QueueState};

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::audit::{AuditEntry, AuditKind, AuditSink, TracingAuditSink};
use crate::config::QueueConfig;
use crate::error::{ExecResult, QueueError, QueueResult};
use crate::store::{MemoryStore, Store};
use crate::types::{EnqueueOptions, EntryId, QueueEntry, QueueStatus};

/// Anything that can sit in a queue and survive a restart
pub trait Payload: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> Payload for T where T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Consumer of queue entries
#[async_trait]
pub trait Processor<P>: Send + Sync {
    async fn process(&self, payload: P) -> ExecResult<()>;
}

/// Adapts an async closure into a [`Processor`]
pub struct ProcessorFn<F>(F);

/// Wrap an async closure as a [`Processor`]
pub fn processor_fn<F>(f: F) -> ProcessorFn<F> {
    ProcessorFn(f)
}

#[async_trait]
impl<P, F, Fut> Processor<P> for ProcessorFn<F>
where
    P: Send + 'static,
    F: Fn(P) -> Fut + Send + Sync,
    Fut: Future<Output = ExecResult<()>> + Send,
{
    async fn process(&self, payload: P) -> ExecResult<()> {
        (self.0)(payload).await
    }
}

/// What a single [`SignalQueue::process_next`] call did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Paused,
    NoProcessor,
    /// Another step is already in flight
    Busy,
    /// Nothing pending
    Idle,
    Completed(EntryId),
    /// Failed with retry budget left; back to pending
    Retrying(EntryId),
    /// The circuit was open; back to pending without a charged retry
    Deferred(EntryId),
    DeadLettered(EntryId),
}

struct PollerHandle {
    shutdown_tx: oneshot::Sender<()>,
    join_handle: JoinHandle<()>,
}

/// Clears the busy flag when a step ends, however it ends
struct StepGuard<'a>(&'a AtomicBool);

impl<'a> StepGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for StepGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Hands a claimed entry back to pending if the step future is dropped
/// before it settles
struct InFlight<'a, P: Payload> {
    queue: &'a SignalQueue<P>,
    id: EntryId,
    armed: bool,
}

impl<'a, P: Payload> InFlight<'a, P> {
    fn claim(queue: &'a SignalQueue<P>, id: EntryId) -> Self {
        Self { queue, id, armed: true }
    }

    fn disarm(mut self) -> EntryId {
        self.armed = false;
        self.id.clone()
    }
}

impl<P: Payload> Drop for InFlight<'_, P> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.queue.state.lock();
        if state.defer(&self.id) {
            warn!(
                "Step for {} in {} was dropped, entry is pending again",
                self.id.short(),
                self.queue.name
            );
            self.queue.persist(&state);
        }
    }
}

/// Storage key of a queue snapshot
pub fn storage_key(name: &str) -> String {
    format!("signal_queue:{}", name)
}

/// Named, persistent, single-consumer priority queue
pub struct SignalQueue<P: Payload> {
    name: String,
    config: QueueConfig,
    store: Arc<dyn Store>,
    audit: Arc<dyn AuditSink>,
    state: Mutex<QueueState<P>>,
    processor: RwLock<Option<Arc<dyn Processor<P>>>>,
    paused: AtomicBool,
    busy: AtomicBool,
    poller: Mutex<Option<PollerHandle>>,
}

impl<P: Payload> SignalQueue<P> {
    /// In-memory queue; state does not outlive the process
    pub fn new(name: impl Into<String>, config: QueueConfig) -> QueueResult<Self> {
        Self::open(name, config, Arc::new(MemoryStore::new()))
    }

    /// Open a queue, restoring its last snapshot from `store`.
    ///
    /// Entries that were `processing` when the snapshot was written go back
    /// to pending.
    pub fn open(name: impl Into<String>, config: QueueConfig, store: Arc<dyn Store>) -> QueueResult<Self> {
        let name = name.into();
        let mut state = match store.get(&storage_key(&name))? {
            Some(json) => serde_json::from_str::<QueueState<P>>(&json)?,
            None => QueueState::default(),
        };

        let recovered = state.recover_in_flight();
        if recovered > 0 {
            warn!("Queue {} recovered {} in-flight entries as pending", name, recovered);
        }
        info!(
            "Opened queue {} with {} entries and {} dead letters",
            name,
            state.len(),
            state.dead_letter_queue.len()
        );

        let queue = Self {
            name,
            config,
            store,
            audit: Arc::new(TracingAuditSink),
            state: Mutex::new(state),
            processor: RwLock::new(None),
            paused: AtomicBool::new(false),
            busy: AtomicBool::new(false),
            poller: Mutex::new(None),
        };
        if recovered > 0 {
            queue.persist(&queue.state.lock());
        }
        Ok(queue)
    }

    /// Send lifecycle facts to `audit` instead of the tracing sink
    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Add a payload.
    ///
    /// Returns `Ok(None)` when a pending entry already carries the same dedupe
    /// key. A full queue first drops expired entries, then evicts its
    /// lowest-priority oldest pending entry.
    #[instrument(skip(self, payload), fields(queue = %self.name, priority = options.priority))]
    pub fn enqueue(&self, payload: P, options: EnqueueOptions) -> QueueResult<Option<EntryId>> {
        let mut audits = Vec::new();
        let result = {
            let mut state = self.state.lock();
            let result = self.enqueue_locked(&mut state, payload, options, &mut audits);
            self.persist(&state);
            result
        };
        self.write_audits(audits);
        result
    }

    fn enqueue_locked(
        &self,
        state: &mut QueueState<P>,
        payload: P,
        options: EnqueueOptions,
        audits: &mut Vec<AuditEntry>,
    ) -> QueueResult<Option<EntryId>> {
        if let Some(key) = options.dedupe_key.as_deref() {
            if state.has_pending_dedupe(key) {
                state.stats.deduplicated += 1;
                debug!("Dropped duplicate signal with dedupe key {}", key);
                return Ok(None);
            }
        }

        self.make_room(state, audits)?;

        let ttl = options.ttl.unwrap_or(self.config.default_ttl);
        let entry = QueueEntry::new(payload, options.priority, ttl, options.dedupe_key);
        let id = entry.id.clone();
        audits.push(
            AuditEntry::new(&self.name, AuditKind::Enqueued)
                .with_entry(&id)
                .with_detail(json!({
                    "priority": entry.priority,
                    "dedupeKey": entry.dedupe_key,
                    "expiresAt": entry.expires_at,
                })),
        );
        state.insert(entry);
        state.stats.enqueued += 1;

        debug!("Enqueued {} into {}", id.short(), self.name);
        Ok(Some(id))
    }

    /// Free one slot below `max_size`. A snapshot restored under a smaller
    /// limit may need several evictions.
    fn make_room(&self, state: &mut QueueState<P>, audits: &mut Vec<AuditEntry>) -> QueueResult<()> {
        if state.len() < self.config.max_size {
            return Ok(());
        }

        let expired = state.purge_expired(Utc::now());
        audits.extend(expired.iter().map(|e| self.expired_audit(e)));

        while state.len() >= self.config.max_size {
            let Some(evicted) = state.evict_one() else {
                return Err(QueueError::QueueFull {
                    max_size: self.config.max_size,
                });
            };
            warn!(
                "Queue {} is full ({} entries), evicted {} with priority {}",
                self.name,
                self.config.max_size,
                evicted.id.short(),
                evicted.priority
            );
            audits.push(
                AuditEntry::new(&self.name, AuditKind::Evicted)
                    .with_entry(&evicted.id)
                    .with_detail(json!({ "priority": evicted.priority })),
            );
        }
        Ok(())
    }

    /// Register the consumer; replaces any previous one
    pub fn set_processor(&self, processor: impl Processor<P> + 'static) {
        self.set_shared_processor(Arc::new(processor));
    }

    pub fn set_shared_processor(&self, processor: Arc<dyn Processor<P>>) {
        *self.processor.write() = Some(processor);
    }

    pub fn has_processor(&self) -> bool {
        self.processor.read().is_some()
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        info!("Paused queue {}", self.name);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        info!("Resumed queue {}", self.name);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Run one processing step.
    ///
    /// Does nothing while paused, without a processor, or while another step
    /// is still in flight.
    pub async fn process_next(&self) -> QueueResult<StepOutcome> {
        if self.is_paused() {
            return Ok(StepOutcome::Paused);
        }
        let Some(processor) = self.processor.read().clone() else {
            return Ok(StepOutcome::NoProcessor);
        };
        let Some(_guard) = StepGuard::acquire(&self.busy) else {
            return Ok(StepOutcome::Busy);
        };

        let (audits, next) = {
            let mut state = self.state.lock();
            let expired = state.purge_expired(Utc::now());
            let next = state.next_pending().map(|e| (e.id.clone(), e.payload.clone()));
            if !expired.is_empty() || next.is_some() {
                self.persist(&state);
            }
            let audits: Vec<AuditEntry> = expired.iter().map(|e| self.expired_audit(e)).collect();
            (audits, next)
        };
        self.write_audits(audits);

        let Some((id, payload)) = next else {
            return Ok(StepOutcome::Idle);
        };

        debug!("Processing {} from {}", id.short(), self.name);
        let in_flight = InFlight::claim(self, id);
        let result = processor.process(payload).await;
        Ok(self.settle(in_flight.disarm(), result))
    }

    fn settle(&self, id: EntryId, result: ExecResult<()>) -> StepOutcome {
        let mut audits = Vec::new();
        let outcome = {
            let mut state = self.state.lock();
            let outcome = match result {
                Ok(()) => match state.complete(&id) {
                    Some(_) => {
                        info!("Entry {} completed", id.short());
                        audits.push(AuditEntry::new(&self.name, AuditKind::Completed).with_entry(&id));
                        StepOutcome::Completed(id)
                    }
                    None => {
                        debug!("Entry {} left the queue while processing", id);
                        StepOutcome::Idle
                    }
                },
                Err(err) if err.is_circuit_open() => {
                    if !state.defer(&id) {
                        return StepOutcome::Idle;
                    }
                    debug!("Entry {} deferred: {}", id.short(), err);
                    StepOutcome::Deferred(id)
                }
                Err(err) => {
                    let message = err.to_string();
                    match state.fail(
                        &id,
                        message.clone(),
                        self.config.max_retries,
                        self.config.max_dead_letters,
                    ) {
                        Some(FailOutcome::Retrying { retries }) => {
                            warn!(
                                "Entry {} failed ({}/{}), will retry: {}",
                                id.short(), retries, self.config.max_retries, message
                            );
                            StepOutcome::Retrying(id)
                        }
                        Some(FailOutcome::DeadLettered) => {
                            error!("Entry {} moved to dead letters: {}", id.short(), message);
                            audits.push(
                                AuditEntry::new(&self.name, AuditKind::DeadLettered)
                                    .with_entry(&id)
                                    .with_detail(json!({ "error": message })),
                            );
                            StepOutcome::DeadLettered(id)
                        }
                        None => {
                            debug!("Entry {} left the queue while processing", id);
                            return StepOutcome::Idle;
                        }
                    }
                }
            };
            self.persist(&state);
            outcome
        };
        self.write_audits(audits);
        outcome
    }

    /// Drop expired pending entries; returns how many were removed
    pub fn purge_expired(&self) -> usize {
        let expired = {
            let mut state = self.state.lock();
            let expired = state.purge_expired(Utc::now());
            if !expired.is_empty() {
                self.persist(&state);
            }
            expired
        };
        if !expired.is_empty() {
            info!("Purged {} expired entries from {}", expired.len(), self.name);
        }
        self.write_audits(expired.iter().map(|e| self.expired_audit(e)).collect());
        expired.len()
    }

    /// Most recent dead letters first, at most `limit`
    pub fn get_dead_letters(&self, limit: usize) -> Vec<QueueEntry<P>> {
        self.state
            .lock()
            .dead_letter_queue
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    /// Move a dead letter back into the live queue with a fresh TTL and retry
    /// budget.
    ///
    /// Fails with [`QueueError::Duplicate`] while a pending entry holds the
    /// same dedupe key. On any failure the dead letter keeps its place.
    pub fn retry_dead_letter(&self, id: &EntryId) -> QueueResult<()> {
        let mut audits = Vec::new();
        let result = {
            let mut state = self.state.lock();
            let (slot, mut entry) = state
                .take_dead_letter(id)
                .ok_or_else(|| QueueError::EntryNotFound(id.clone()))?;

            let admitted = match entry.dedupe_key.as_deref() {
                Some(key) if state.has_pending_dedupe(key) => Err(QueueError::Duplicate {
                    key: key.to_string(),
                }),
                _ => self.make_room(&mut state, &mut audits),
            };
            let result = match admitted {
                Ok(()) => {
                    entry.requeue(self.config.default_ttl);
                    state.insert(entry);
                    audits.push(AuditEntry::new(&self.name, AuditKind::Requeued).with_entry(id));
                    info!("Requeued dead letter {} into {}", id.short(), self.name);
                    Ok(())
                }
                Err(err) => {
                    warn!("Dead letter {} stays put: {}", id.short(), err);
                    state.restore_dead_letter(slot, entry);
                    Err(err)
                }
            };
            self.persist(&state);
            result
        };
        self.write_audits(audits);
        result
    }

    /// Empty the dead-letter queue; returns how many entries were dropped
    pub fn purge_dead_letters(&self) -> usize {
        let mut state = self.state.lock();
        let purged = state.dead_letter_queue.len();
        state.dead_letter_queue.clear();
        self.persist(&state);
        info!("Purged {} dead letters from {}", purged, self.name);
        purged
    }

    /// Drop every live entry and dead letter; counters are kept
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.queue.clear();
        state.dead_letter_queue.clear();
        self.persist(&state);
        info!("Cleared queue {}", self.name);
    }

    pub fn get(&self, id: &EntryId) -> Option<QueueEntry<P>> {
        self.state.lock().get(id).cloned()
    }

    /// Live entries in processing order
    pub fn entries(&self) -> Vec<QueueEntry<P>> {
        self.state.lock().queue.clone()
    }

    pub fn snapshot(&self) -> QueueState<P> {
        self.state.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.state.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().is_empty()
    }

    pub fn get_status(&self) -> QueueStatus {
        let running = self.is_running();
        let state = self.state.lock();
        QueueStatus {
            name: self.name.clone(),
            size: state.len(),
            pending: state.pending_count(),
            processing: state.processing_count(),
            dead_letters: state.dead_letter_queue.len(),
            paused: self.is_paused(),
            running,
            stats: state.stats.clone(),
        }
    }

    /// Start the polling loop. A second call while running is a no-op.
    ///
    /// The loop holds a weak reference and ends on its own once the queue is
    /// dropped.
    pub fn start(self: &Arc<Self>) {
        let mut poller = self.poller.lock();
        if poller.is_some() {
            debug!("Queue {} is already running", self.name);
            return;
        }

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let weak = Arc::downgrade(self);
        let period = self.config.poll_interval;
        let name = self.name.clone();

        let join_handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {}
                }

                let Some(queue) = weak.upgrade() else {
                    break;
                };
                if let Err(e) = queue.process_next().await {
                    error!("Error processing queue {}: {}", name, e);
                }
            }

            debug!("Polling loop for {} stopped", name);
        });

        *poller = Some(PollerHandle {
            shutdown_tx,
            join_handle,
        });
        info!("Started queue {}", self.name);
    }

    /// Stop the polling loop, waiting for an in-flight step to finish.
    ///
    /// Must not be awaited from inside a processor of this queue.
    pub async fn stop(&self) {
        let handle = self.poller.lock().take();
        let Some(handle) = handle else {
            return;
        };

        let _ = handle.shutdown_tx.send(());
        if let Err(e) = handle.join_handle.await {
            error!("Polling loop for {} ended abnormally: {}", self.name, e);
        }
        info!("Stopped queue {}", self.name);
    }

    pub fn is_running(&self) -> bool {
        self.poller.lock().is_some()
    }

    fn persist(&self, state: &QueueState<P>) {
        let json = match serde_json::to_string(state) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize queue {}: {}", self.name, e);
                return;
            }
        };
        if let Err(e) = self.store.put(&storage_key(&self.name), &json) {
            error!("Failed to persist queue {}: {}", self.name, e);
        }
    }

    fn expired_audit(&self, entry: &QueueEntry<P>) -> AuditEntry {
        AuditEntry::new(&self.name, AuditKind::Expired)
            .with_entry(&entry.id)
            .with_detail(json!({ "expiresAt": entry.expires_at }))
    }

    fn write_audits(&self, audits: Vec<AuditEntry>) {
        for entry in audits {
            self.audit.write(entry);
        }
    }
}
