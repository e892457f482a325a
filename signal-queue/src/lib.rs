//! # signal-queue: Reliable Signal Execution
//!
//! **Persistent priority queue guarded by a circuit breaker and jittered retries**
//!
//! Signals (trade orders, webhooks, any side-effecting call) are queued by
//! priority, deduplicated, expired when stale and dead-lettered once their
//! retry budget is spent. Execution against the downstream dependency runs as
//! `breaker(retry(executor))`.
//!
//! ## Features
//!
//! - **Priority ordering**: higher priority first, FIFO within a priority
//! - **Dedupe**: a second pending signal with the same key is dropped
//! - **TTL expiry** and **bounded size** with lowest-priority eviction
//! - **Dead letters** with inspection, requeue and purge
//! - **Persistence**: the full snapshot is rewritten on every mutation; in-flight
//!   entries are recovered as pending on restart
//! - **Circuit breaker** with CLOSED / OPEN / HALF_OPEN and a background monitor
//! - **Retries** with exponential backoff, symmetric jitter and error classification
//! - **Observers and audit**: typed event subjects plus a pluggable audit sink
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use signal_queue::prelude::*;
//!
//! struct Broker;
//!
//! #[async_trait]
//! impl Executor<String> for Broker {
//!     async fn attempt(&self, order: &String) -> ExecResult<()> {
//!         println!("placing {order}");
//!         Ok(())
//!     }
//! }
//!
//! # async fn run() -> QueueResult<()> {
//! let pipeline = SignalPipeline::builder("broker")
//!     .with_config(PipelineConfig::from_env("SIGQ"))
//!     .with_executor(Broker)
//!     .build()?;
//!
//! pipeline.enqueue(
//!     "BUY AAPL 10".to_string(),
//!     EnqueueOptions::new().with_priority(5).with_dedupe_key("BUY-AAPL"),
//! )?;
//!
//! pipeline.start();
//! // ...
//! pipeline.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod audit;
pub mod breaker;
pub mod config;
pub mod error;
pub mod observer;
pub mod pipeline;
pub mod queue;
pub mod retry;
pub mod store;
pub mod types;

#[cfg(feature = "tracing-basic")]
pub mod observability;

pub use audit::{AuditEntry, AuditKind, AuditSink, MemoryAuditSink, TracingAuditSink};
pub use breaker::{BreakerStatus, CircuitBreaker, MonitorHandle};
pub use config::{CircuitBreakerConfig, PipelineConfig, QueueConfig, RetryPolicy};
pub use error::{ExecError, ExecResult, Failure, QueueError, QueueResult, StoreError};
pub use observer::{ListenerId, Subject, Subscription};
pub use pipeline::{Executor, PipelineStatus, ProtectedProcessor, SignalPipeline, SignalPipelineBuilder};
pub use queue::{processor_fn, Payload, Processor, ProcessorFn, SignalQueue, StepOutcome};
pub use retry::RetryManager;
pub use store::{FileStore, MemoryStore, Store};
pub use types::{
    BreakerEvent, CircuitState, EnqueueOptions, EntryId, EntryStatus, QueueEntry, QueueStats, QueueStatus,
    RetryEvent,
};

#[cfg(feature = "tracing-basic")]
pub use observability::init_tracing;

/// Everything needed to wire a pipeline
pub mod prelude {
    pub use crate::{
        CircuitBreaker, Executor, PipelineConfig, Processor, RetryManager, SignalPipeline, SignalQueue,
    };

    pub use crate::{EnqueueOptions, EntryId, ExecError, ExecResult, QueueError, QueueResult, StepOutcome};

    pub use crate::{FileStore, MemoryStore, Store};

    pub use async_trait::async_trait;
}
