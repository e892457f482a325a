//! Circuit breaker for a named downstream dependency.
//!
//! ```text
//! CLOSED    → OPEN:      failure_count >= failure_threshold
//! OPEN      → HALF_OPEN: timeout elapsed (next caller, or the monitor)
//! HALF_OPEN → CLOSED:    success_count >= success_threshold
//! HALF_OPEN → OPEN:      any failure
//! ```
//!
//! The breaker only gates whether the wrapped call runs. Errors from the call
//! are always returned unchanged.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::audit::{AuditEntry, AuditKind, AuditSink};
use crate::config::CircuitBreakerConfig;
use crate::error::{ExecError, ExecResult};
use crate::observer::{Subject, Subscription};
use crate::types::{BreakerEvent, CircuitState};

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_time: Option<DateTime<Utc>>,
    next_attempt_at: Option<Instant>,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_time: None,
            next_attempt_at: None,
        }
    }
}

/// Point-in-time view of a breaker
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerStatus {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
    /// Time left before an OPEN breaker admits a trial call
    pub next_attempt_in: Option<Duration>,
    /// False while the breaker is OPEN
    pub healthy: bool,
}

/// Three-state gate in front of one external dependency
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    events: Subject<BreakerEvent>,
    audit: Option<Arc<dyn AuditSink>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner::new()),
            events: Subject::new(),
            audit: None,
        }
    }

    /// Record state changes in an audit sink
    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn events(&self) -> &Subject<BreakerEvent> {
        &self.events
    }

    /// Shorthand for `events().subscribe(listener)`
    pub fn on_event<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&BreakerEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(listener)
    }

    /// Run `call` unless the breaker is OPEN.
    ///
    /// An OPEN breaker whose timeout has elapsed moves to HALF_OPEN and lets the
    /// call through as a trial. A [`ExecError::CircuitOpen`] coming back from
    /// `call` itself is passed through without touching the counters.
    pub async fn execute<T, F, Fut>(&self, call: F) -> ExecResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ExecResult<T>>,
    {
        self.admit()?;

        match call().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) if err.is_circuit_open() => Err(err),
            Err(err) => {
                self.record_failure(&err);
                Err(err)
            }
        }
    }

    /// Force the breaker OPEN
    pub fn trip(&self) {
        let mut pending = Vec::new();
        {
            let mut inner = self.inner.lock();
            self.transition(&mut inner, CircuitState::Open, &mut pending);
        }
        self.publish(pending);
    }

    /// Force the breaker CLOSED and clear its counters
    pub fn reset(&self) {
        let mut pending = Vec::new();
        {
            let mut inner = self.inner.lock();
            self.transition(&mut inner, CircuitState::Closed, &mut pending);
        }
        self.publish(pending);
    }

    /// Move an OPEN breaker to HALF_OPEN once its timeout has elapsed.
    /// Returns true when a transition happened.
    pub fn check_timeout(&self) -> bool {
        let mut pending = Vec::new();
        {
            let mut inner = self.inner.lock();
            if !self.timeout_elapsed(&inner) {
                return false;
            }
            self.transition(&mut inner, CircuitState::HalfOpen, &mut pending);
        }
        self.publish(pending);
        true
    }

    pub fn status(&self) -> BreakerStatus {
        let inner = self.inner.lock();
        let now = Instant::now();
        BreakerStatus {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            last_failure_time: inner.last_failure_time,
            next_attempt_in: match inner.state {
                CircuitState::Open => inner.next_attempt_at.map(|at| at.saturating_duration_since(now)),
                _ => None,
            },
            healthy: inner.state != CircuitState::Open,
        }
    }

    /// Start the background task that flips an OPEN breaker to HALF_OPEN as
    /// soon as its timeout elapses. The task ends when the handle is shut down
    /// or dropped, or when the breaker itself is dropped.
    pub fn spawn_monitor(self: &Arc<Self>) -> MonitorHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let weak = Arc::downgrade(self);
        let period = self.config.monitor_interval;
        let name = self.name.clone();

        let join_handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            debug!("Starting breaker monitor for {} with interval {:?}", name, period);

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {}
                }

                let Some(breaker) = weak.upgrade() else {
                    break;
                };
                if breaker.check_timeout() {
                    debug!("Monitor moved breaker {} to HALF_OPEN", name);
                }
            }

            debug!("Breaker monitor for {} stopped", name);
        });

        MonitorHandle {
            shutdown_tx,
            join_handle,
        }
    }

    fn admit(&self) -> ExecResult<()> {
        let mut pending = Vec::new();
        let result = {
            let mut inner = self.inner.lock();
            if inner.state != CircuitState::Open {
                Ok(())
            } else if self.timeout_elapsed(&inner) {
                self.transition(&mut inner, CircuitState::HalfOpen, &mut pending);
                Ok(())
            } else {
                let retry_in = inner
                    .next_attempt_at
                    .map(|at| at.saturating_duration_since(Instant::now()))
                    .unwrap_or_default();
                Err(ExecError::CircuitOpen {
                    name: self.name.clone(),
                    retry_in,
                })
            }
        };
        self.publish(pending);
        result
    }

    fn record_success(&self) {
        let mut pending = Vec::new();
        {
            let mut inner = self.inner.lock();
            inner.failure_count = 0;
            inner.success_count += 1;
            pending.push(BreakerEvent::Success {
                name: self.name.clone(),
                state: inner.state,
            });

            if inner.state == CircuitState::HalfOpen
                && inner.success_count >= self.config.success_threshold
            {
                self.transition(&mut inner, CircuitState::Closed, &mut pending);
            }
        }
        self.publish(pending);
    }

    fn record_failure(&self, err: &ExecError) {
        let mut pending = Vec::new();
        {
            let mut inner = self.inner.lock();
            inner.success_count = 0;
            inner.failure_count += 1;
            inner.last_failure_time = Some(Utc::now());
            pending.push(BreakerEvent::Failure {
                name: self.name.clone(),
                state: inner.state,
                error: err.to_string(),
            });

            let reopen = match inner.state {
                CircuitState::HalfOpen => true,
                CircuitState::Closed => inner.failure_count >= self.config.failure_threshold,
                CircuitState::Open => false,
            };
            if reopen {
                self.transition(&mut inner, CircuitState::Open, &mut pending);
            }
        }
        self.publish(pending);
    }

    fn timeout_elapsed(&self, inner: &BreakerInner) -> bool {
        inner.state == CircuitState::Open
            && inner
                .next_attempt_at
                .map_or(true, |at| Instant::now() >= at)
    }

    fn transition(
        &self,
        inner: &mut BreakerInner,
        to: CircuitState,
        pending: &mut Vec<BreakerEvent>,
    ) {
        let from = inner.state;
        match to {
            CircuitState::Open => {
                inner.next_attempt_at = Some(Instant::now() + self.config.timeout);
            }
            CircuitState::HalfOpen => {
                inner.success_count = 0;
            }
            CircuitState::Closed => {
                inner.failure_count = 0;
                inner.success_count = 0;
                inner.next_attempt_at = None;
            }
        }
        if from == to {
            return;
        }
        inner.state = to;

        if to == CircuitState::Open {
            warn!(
                "Circuit {} opened after {} failures, next attempt in {:?}",
                self.name, inner.failure_count, self.config.timeout
            );
        } else {
            info!("Circuit {} moved from {} to {}", self.name, from, to);
        }

        pending.push(BreakerEvent::StateChange {
            name: self.name.clone(),
            from,
            to,
        });
    }

    // Runs after the lock is released so listeners may call back into the breaker.
    fn publish(&self, pending: Vec<BreakerEvent>) {
        for event in pending {
            if let (Some(audit), BreakerEvent::StateChange { from, to, .. }) = (&self.audit, &event) {
                audit.write(
                    AuditEntry::new(self.name.clone(), AuditKind::BreakerStateChange)
                        .with_detail(json!({ "from": from, "to": to })),
                );
            }
            self.events.emit(event);
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

/// Handle for the background monitor task
pub struct MonitorHandle {
    shutdown_tx: oneshot::Sender<()>,
    join_handle: JoinHandle<()>,
}

impl MonitorHandle {
    /// Stop the monitor and wait for it to exit
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.join_handle.await;
    }
}
