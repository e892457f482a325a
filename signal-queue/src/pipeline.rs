//! Queue + circuit breaker + retry, wired together.
//!
//! Each step of the queue hands its payload to a [`ProtectedProcessor`], which
//! runs the [`Executor`] as `breaker(retry(executor))`: the retry sequence is
//! one call from the breaker's point of view, so a single failed signal counts
//! once towards opening the circuit.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, instrument};

use crate::audit::{AuditSink, TracingAuditSink};
use crate::breaker::{BreakerStatus, CircuitBreaker, MonitorHandle};
use crate::config::PipelineConfig;
use crate::error::{ExecResult, QueueError, QueueResult};
use crate::queue::{Payload, Processor, SignalQueue};
use crate::retry::RetryManager;
use crate::store::{MemoryStore, Store};
use crate::types::{EnqueueOptions, EntryId, QueueStatus};

/// The side-effecting call a signal turns into (an order, a webhook, ...)
#[async_trait]
pub trait Executor<P>: Send + Sync {
    async fn attempt(&self, payload: &P) -> ExecResult<()>;
}

/// [`Processor`] that runs an [`Executor`] behind a breaker and retries
pub struct ProtectedProcessor<P> {
    context: String,
    breaker: Arc<CircuitBreaker>,
    retry: Arc<RetryManager>,
    executor: Arc<dyn Executor<P>>,
}

impl<P> ProtectedProcessor<P> {
    pub fn new(
        context: impl Into<String>,
        breaker: Arc<CircuitBreaker>,
        retry: Arc<RetryManager>,
        executor: Arc<dyn Executor<P>>,
    ) -> Self {
        Self {
            context: context.into(),
            breaker,
            retry,
            executor,
        }
    }
}

#[async_trait]
impl<P: Send + Sync + 'static> Processor<P> for ProtectedProcessor<P> {
    async fn process(&self, payload: P) -> ExecResult<()> {
        let executor = &self.executor;
        let retry = &self.retry;
        let context = self.context.as_str();
        let payload = &payload;
        self.breaker
            .execute(move || retry.execute(move || executor.attempt(payload), context))
            .await
    }
}

/// Point-in-time view of a whole pipeline
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub queue: QueueStatus,
    pub breaker: BreakerStatus,
}

/// A queue whose entries are executed through a breaker and retries
pub struct SignalPipeline<P: Payload> {
    name: String,
    queue: Arc<SignalQueue<P>>,
    breaker: Arc<CircuitBreaker>,
    retry: Arc<RetryManager>,
    monitor: Mutex<Option<MonitorHandle>>,
}

impl<P: Payload> SignalPipeline<P> {
    pub fn builder(name: impl Into<String>) -> SignalPipelineBuilder<P> {
        SignalPipelineBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queue(&self) -> &Arc<SignalQueue<P>> {
        &self.queue
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn retry(&self) -> &Arc<RetryManager> {
        &self.retry
    }

    pub fn enqueue(&self, payload: P, options: EnqueueOptions) -> QueueResult<Option<EntryId>> {
        self.queue.enqueue(payload, options)
    }

    /// Start the poll loop and the breaker monitor
    pub fn start(&self) {
        self.queue.start();
        let mut monitor = self.monitor.lock();
        if monitor.is_none() {
            *monitor = Some(self.breaker.spawn_monitor());
        }
        info!("Started pipeline {}", self.name);
    }

    /// Stop both background tasks, letting an in-flight step finish
    #[instrument(skip(self), fields(pipeline = %self.name))]
    pub async fn stop(&self) {
        self.queue.stop().await;
        let monitor = self.monitor.lock().take();
        if let Some(monitor) = monitor {
            monitor.shutdown().await;
        }
        info!("Stopped pipeline {}", self.name);
    }

    pub fn status(&self) -> PipelineStatus {
        PipelineStatus {
            queue: self.queue.get_status(),
            breaker: self.breaker.status(),
        }
    }
}

/// Builder for [`SignalPipeline`]
pub struct SignalPipelineBuilder<P> {
    name: String,
    config: PipelineConfig,
    store: Option<Arc<dyn Store>>,
    audit: Option<Arc<dyn AuditSink>>,
    executor: Option<Arc<dyn Executor<P>>>,
}

impl<P: Payload> SignalPipelineBuilder<P> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: PipelineConfig::default(),
            store: None,
            audit: None,
            executor: None,
        }
    }

    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Defaults to an in-memory store
    pub fn with_store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    /// Defaults to [`TracingAuditSink`]
    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn with_executor<E: Executor<P> + 'static>(mut self, executor: E) -> Self {
        self.executor = Some(Arc::new(executor));
        self
    }

    /// Open the queue (restoring any persisted snapshot) and wire the processor
    pub fn build(self) -> QueueResult<SignalPipeline<P>> {
        let executor = self
            .executor
            .ok_or_else(|| QueueError::Internal(format!("pipeline {} has no executor", self.name)))?;
        let store = self.store.unwrap_or_else(|| Arc::new(MemoryStore::new()));
        let audit = self.audit.unwrap_or_else(|| Arc::new(TracingAuditSink));

        let breaker = Arc::new(CircuitBreaker::new(self.name.clone(), self.config.breaker).with_audit(audit.clone()));
        let retry = Arc::new(RetryManager::new(self.config.retry));
        let queue = Arc::new(SignalQueue::open(self.name.clone(), self.config.queue, store)?.with_audit(audit));

        queue.set_processor(ProtectedProcessor::new(
            self.name.clone(),
            breaker.clone(),
            retry.clone(),
            executor,
        ));

        Ok(SignalPipeline {
            name: self.name,
            queue,
            breaker,
            retry,
            monitor: Mutex::new(None),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditKind, MemoryAuditSink};
    use crate::config::{CircuitBreakerConfig, RetryPolicy};
    use crate::error::ExecError;
    use crate::queue::StepOutcome;
    use crate::types::CircuitState;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct FlakyBroker {
        calls: Arc<AtomicU32>,
        failures: u32,
    }

    #[async_trait]
    impl Executor<String> for FlakyBroker {
        async fn attempt(&self, _order: &String) -> ExecResult<()> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                Err(ExecError::transient("broker timeout"))
            } else {
                Ok(())
            }
        }
    }

    fn config(failure_threshold: u32) -> PipelineConfig {
        PipelineConfig {
            breaker: CircuitBreakerConfig::new()
                .with_failure_threshold(failure_threshold)
                .with_timeout(Duration::from_secs(30)),
            retry: RetryPolicy::new()
                .with_max_attempts(3)
                .with_base_delay(Duration::from_millis(10))
                .with_jitter_factor(0.0),
            ..Default::default()
        }
    }

    fn pipeline(failures: u32, failure_threshold: u32) -> (SignalPipeline<String>, Arc<AtomicU32>, MemoryAuditSink) {
        let calls = Arc::new(AtomicU32::new(0));
        let audit = MemoryAuditSink::new();
        let pipeline = SignalPipeline::builder("broker")
            .with_config(config(failure_threshold))
            .with_audit(Arc::new(audit.clone()))
            .with_executor(FlakyBroker {
                calls: calls.clone(),
                failures,
            })
            .build()
            .unwrap();
        (pipeline, calls, audit)
    }

    #[test]
    fn test_build_requires_executor() {
        let result = SignalPipeline::<String>::builder("broker").build();
        assert!(matches!(result, Err(QueueError::Internal(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_happen_inside_one_breaker_call() {
        let (pipeline, calls, _) = pipeline(2, 1);
        let id = pipeline
            .enqueue("BUY AAPL".to_string(), EnqueueOptions::new())
            .unwrap()
            .unwrap();

        assert_eq!(pipeline.queue().process_next().await.unwrap(), StepOutcome::Completed(id));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(pipeline.breaker().state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_defers_entries() {
        let (pipeline, calls, audit) = pipeline(u32::MAX, 1);
        let first = pipeline
            .enqueue("BUY AAPL".to_string(), EnqueueOptions::new())
            .unwrap()
            .unwrap();

        // Exhausted retries count as one breaker failure and open the circuit
        assert_eq!(
            pipeline.queue().process_next().await.unwrap(),
            StepOutcome::Retrying(first.clone())
        );
        assert_eq!(pipeline.breaker().state(), CircuitState::Open);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        assert_eq!(
            pipeline.queue().process_next().await.unwrap(),
            StepOutcome::Deferred(first.clone())
        );
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(pipeline.queue().get(&first).unwrap().retries, 1);

        let status = pipeline.status();
        assert!(!status.breaker.healthy);
        assert_eq!(status.queue.pending, 1);
        assert_eq!(audit.count(AuditKind::BreakerStateChange), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_and_stop() {
        let (pipeline, calls, _) = pipeline(0, 5);
        pipeline
            .enqueue("BUY AAPL".to_string(), EnqueueOptions::new())
            .unwrap();

        pipeline.start();
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(pipeline.status().queue.running);
        pipeline.stop().await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let status = pipeline.status();
        assert!(!status.queue.running);
        assert_eq!(status.queue.stats.processed, 1);
    }
}
