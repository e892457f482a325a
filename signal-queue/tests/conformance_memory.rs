use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_stream::StreamExt;
use tokio_test::{assert_err, assert_ok};

use signal_queue::{
    processor_fn, AuditKind, BreakerEvent, CircuitBreaker, CircuitBreakerConfig, CircuitState, EnqueueOptions,
    EntryStatus, ExecError, ExecResult, MemoryAuditSink, MemoryStore, QueueConfig, RetryEvent, RetryManager,
    RetryPolicy, SignalQueue, StepOutcome, Store,
};

/// Test factory functions
fn create_test_queue(config: QueueConfig) -> (SignalQueue<String>, MemoryAuditSink) {
    let audit = MemoryAuditSink::new();
    let queue = SignalQueue::new("signals", config)
        .unwrap()
        .with_audit(Arc::new(audit.clone()));
    (queue, audit)
}

fn create_test_breaker() -> CircuitBreaker {
    CircuitBreaker::new(
        "broker",
        CircuitBreakerConfig::new()
            .with_failure_threshold(3)
            .with_success_threshold(2)
            .with_timeout(Duration::from_millis(1000)),
    )
}

fn create_recorder(seen: Arc<Mutex<Vec<String>>>) -> impl signal_queue::Processor<String> {
    processor_fn(move |payload: String| {
        let seen = seen.clone();
        async move {
            seen.lock().push(payload);
            Ok::<(), ExecError>(())
        }
    })
}

async fn fail_once(breaker: &CircuitBreaker) -> ExecResult<()> {
    breaker.execute(|| async { Err(ExecError::failed("broker down")) }).await
}

async fn succeed_once(breaker: &CircuitBreaker) -> ExecResult<()> {
    breaker.execute(|| async { Ok(()) }).await
}

/// P1. Priority Ordering
#[tokio::test]
async fn test_priority_ordering() {
    let (queue, _) = create_test_queue(QueueConfig::default());
    let seen = Arc::new(Mutex::new(Vec::new()));
    queue.set_processor(create_recorder(seen.clone()));

    // Arrange: priorities 1, 5, 2 in that order
    for priority in [1, 5, 2] {
        assert_ok!(queue.enqueue(priority.to_string(), EnqueueOptions::new().with_priority(priority)));
    }

    // Act: drain
    while let StepOutcome::Completed(_) = queue.process_next().await.unwrap() {}

    // Assert: highest priority first
    assert_eq!(*seen.lock(), vec!["5", "2", "1"]);
    assert_eq!(queue.get_status().stats.processed, 3);
}

/// P2. Deduplication While Pending
#[tokio::test]
async fn test_deduplication() {
    let (queue, audit) = create_test_queue(QueueConfig::default());
    let options = EnqueueOptions::new().with_dedupe_key("BUY-AAPL");

    let first = queue.enqueue("BUY AAPL 10".to_string(), options.clone()).unwrap();
    let second = queue.enqueue("BUY AAPL 10".to_string(), options).unwrap();

    assert!(first.is_some());
    assert!(second.is_none());
    assert_eq!(queue.get_status().stats.deduplicated, 1);
    let with_key = queue
        .entries()
        .into_iter()
        .filter(|e| e.dedupe_key.as_deref() == Some("BUY-AAPL"))
        .count();
    assert_eq!(with_key, 1);
    assert_eq!(audit.count(AuditKind::Enqueued), 1);
}

/// P2b. Dedupe Key Is Free Again Once The Entry Completes
#[tokio::test]
async fn test_dedupe_key_reusable_after_completion() {
    let (queue, _) = create_test_queue(QueueConfig::default());
    queue.set_processor(create_recorder(Arc::new(Mutex::new(Vec::new()))));
    let options = EnqueueOptions::new().with_dedupe_key("BUY-AAPL");

    assert!(queue.enqueue("a".to_string(), options.clone()).unwrap().is_some());
    assert!(matches!(queue.process_next().await.unwrap(), StepOutcome::Completed(_)));
    assert!(queue.enqueue("b".to_string(), options).unwrap().is_some());
}

/// P3. Expiry
#[tokio::test]
async fn test_expiry() {
    let (queue, audit) = create_test_queue(QueueConfig::default());
    let id = queue
        .enqueue("BUY AAPL 10".to_string(), EnqueueOptions::new().with_ttl(Duration::from_millis(50)))
        .unwrap()
        .unwrap();

    // No processor running; let the TTL lapse
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(queue.purge_expired(), 1);

    assert_eq!(queue.get_status().stats.expired, 1);
    assert!(queue.get(&id).is_none());
    assert!(queue.get_dead_letters(usize::MAX).is_empty());

    let expired = audit
        .entries()
        .into_iter()
        .find(|e| e.kind == AuditKind::Expired)
        .unwrap();
    assert_eq!(expired.entry_id, Some(id));
}

/// P4. Dead-Letter Transition And Requeue
#[tokio::test]
async fn test_dead_letter_transition() {
    let (queue, _) = create_test_queue(QueueConfig::default().with_max_retries(3));
    queue.set_processor(processor_fn(|_payload: String| async {
        Err::<(), _>(ExecError::transient("broker timeout"))
    }));
    let id = queue
        .enqueue("BUY AAPL 10".to_string(), EnqueueOptions::new())
        .unwrap()
        .unwrap();

    let mut outcomes = Vec::new();
    for _ in 0..3 {
        outcomes.push(queue.process_next().await.unwrap());
    }

    assert_eq!(
        outcomes,
        vec![
            StepOutcome::Retrying(id.clone()),
            StepOutcome::Retrying(id.clone()),
            StepOutcome::DeadLettered(id.clone()),
        ]
    );
    assert!(queue.get(&id).is_none());
    let dead = queue.get_dead_letters(10);
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].id, id);
    assert_eq!(dead[0].retries, 3);
    assert_eq!(dead[0].status, EntryStatus::Failed);

    // Act: requeue
    assert_ok!(queue.retry_dead_letter(&id));

    let requeued = queue.get(&id).unwrap();
    assert_eq!(requeued.retries, 0);
    assert_eq!(requeued.status, EntryStatus::Pending);
    assert!(queue.get_dead_letters(10).is_empty());
    assert_err!(queue.retry_dead_letter(&id));
}

/// P5. Circuit Breaker Full Cycle
#[tokio::test(start_paused = true)]
async fn test_circuit_breaker_full_cycle() {
    let breaker = create_test_breaker();
    let mut events = breaker.events().stream();

    // Three consecutive failures open the circuit
    for _ in 0..3 {
        assert_err!(fail_once(&breaker).await);
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    // Fail fast before the timeout, without invoking the call
    let invoked = AtomicU32::new(0);
    let result = breaker
        .execute(|| async {
            invoked.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await;
    assert!(matches!(result, Err(ExecError::CircuitOpen { .. })));
    assert_eq!(invoked.load(Ordering::SeqCst), 0);

    // After the timeout the next call is a trial call
    tokio::time::advance(Duration::from_millis(1000)).await;
    assert_ok!(succeed_once(&breaker).await);
    assert_eq!(breaker.state(), CircuitState::HalfOpen);
    assert_ok!(succeed_once(&breaker).await);
    assert_eq!(breaker.state(), CircuitState::Closed);

    // One failure in HALF_OPEN reopens immediately
    for _ in 0..3 {
        assert_err!(fail_once(&breaker).await);
    }
    tokio::time::advance(Duration::from_millis(1000)).await;
    assert_err!(fail_once(&breaker).await);
    assert_eq!(breaker.state(), CircuitState::Open);

    // Observed transitions, in order
    let mut transitions = Vec::new();
    while transitions.len() < 6 {
        match events.next().await {
            Some(BreakerEvent::StateChange { from, to, .. }) => transitions.push((from, to)),
            Some(_) => {}
            None => break,
        }
    }
    assert_eq!(
        transitions,
        vec![
            (CircuitState::Closed, CircuitState::Open),
            (CircuitState::Open, CircuitState::HalfOpen),
            (CircuitState::HalfOpen, CircuitState::Closed),
            (CircuitState::Closed, CircuitState::Open),
            (CircuitState::Open, CircuitState::HalfOpen),
            (CircuitState::HalfOpen, CircuitState::Open),
        ]
    );
}

/// P6. Retry Backoff
#[tokio::test(start_paused = true)]
async fn test_retry_backoff() {
    let manager = RetryManager::new(
        RetryPolicy::new()
            .with_max_attempts(3)
            .with_base_delay(Duration::from_millis(100))
            .with_exponential_base(2.0)
            .with_jitter_factor(0.0),
    );
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let subscription = manager.on_event(move |event| sink.lock().push(event.clone()));

    let started = tokio::time::Instant::now();
    let result: ExecResult<()> = manager
        .execute(|| async { Err(ExecError::failed("503 unavailable")) }, "place order")
        .await;

    assert_err!(result);
    assert_eq!(started.elapsed(), Duration::from_millis(300));

    let events = events.lock().clone();
    let delays: Vec<Duration> = events
        .iter()
        .filter_map(|e| match e {
            RetryEvent::Retry { delay, .. } => Some(*delay),
            _ => None,
        })
        .collect();
    assert_eq!(delays, vec![Duration::from_millis(100), Duration::from_millis(200)]);
    assert!(matches!(events.last(), Some(RetryEvent::Exhausted { attempt: 3, .. })));

    subscription.unsubscribe();
    assert_eq!(manager.events().listener_count(), 0);
}

/// P7. Non-Retryable Short-Circuit
#[tokio::test(start_paused = true)]
async fn test_permanent_error_short_circuits() {
    let manager = RetryManager::new(RetryPolicy::new().with_base_delay(Duration::from_millis(100)));
    let calls = AtomicU32::new(0);
    let started = tokio::time::Instant::now();

    let result: ExecResult<()> = manager
        .execute(
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ExecError::permanent("insufficient funds"))
            },
            "place order",
        )
        .await;

    assert!(matches!(result, Err(ExecError::Permanent(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(started.elapsed(), Duration::ZERO);
}

/// P8. Persistence Round-Trip
#[tokio::test]
async fn test_persistence_round_trip() {
    let store = Arc::new(MemoryStore::new());
    let queue = SignalQueue::<String>::open("orders", QueueConfig::default(), store.clone()).unwrap();
    queue.set_processor(create_recorder(Arc::new(Mutex::new(Vec::new()))));

    for (payload, priority) in [("a", 1), ("b", 3), ("c", 2)] {
        assert_ok!(queue.enqueue(payload.to_string(), EnqueueOptions::new().with_priority(priority)));
    }
    assert_ok!(queue.enqueue("b".to_string(), EnqueueOptions::new().with_dedupe_key("dup")));
    assert_ok!(queue.enqueue("b".to_string(), EnqueueOptions::new().with_dedupe_key("dup")));
    queue.process_next().await.unwrap();

    let before = queue.snapshot();
    drop(queue);

    let reopened = SignalQueue::<String>::open("orders", QueueConfig::default(), store.clone()).unwrap();
    let after = reopened.snapshot();

    assert_eq!(after, before);
    assert_eq!(after.stats.deduplicated, 1);
    assert_eq!(after.stats.processed, 1);
    assert!(store.get("signal_queue:orders").unwrap().is_some());
}
