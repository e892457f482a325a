use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, info, instrument, warn};

use crate::config::RetryPolicy;
use crate::error::{ExecError, ExecResult};
use crate::observer::{Subject, Subscription};
use crate::types::RetryEvent;

/// Bounded, jittered exponential-backoff retries around one async operation.
///
/// Knows nothing about circuit breakers: wrap it inside
/// [`CircuitBreaker::execute`](crate::CircuitBreaker::execute) so that only the
/// final outcome of a retry sequence reaches the breaker.
pub struct RetryManager {
    policy: RetryPolicy,
    events: Subject<RetryEvent>,
}

impl RetryManager {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            events: Subject::new(),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn events(&self) -> &Subject<RetryEvent> {
        &self.events
    }

    /// Shorthand for `events().subscribe(listener)`
    pub fn on_event<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&RetryEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(listener)
    }

    /// Whether another attempt may fix this error.
    ///
    /// Explicit transient/permanent errors keep their class, breaker rejections
    /// are never retried, and unclassified failures are matched against the
    /// policy's codes, statuses and message patterns.
    pub fn is_retryable(&self, err: &ExecError) -> bool {
        match err {
            ExecError::Transient(_) => true,
            ExecError::Permanent(_) | ExecError::CircuitOpen { .. } => false,
            ExecError::Failed(failure) => {
                let code_match = failure
                    .code
                    .as_ref()
                    .is_some_and(|code| self.policy.retryable_codes.iter().any(|c| c == code));
                let status_match = failure
                    .status
                    .is_some_and(|status| self.policy.retryable_statuses.contains(&status));
                let message = failure.message.to_lowercase();
                let message_match = self
                    .policy
                    .retryable_messages
                    .iter()
                    .any(|pattern| message.contains(&pattern.to_lowercase()));

                code_match || status_match || message_match
            }
        }
    }

    /// Delay before the attempt following `attempt` (1-based), without jitter
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let nanos = self.policy.base_delay.as_nanos() as f64 * self.policy.exponential_base.powi(exponent);
        let max_nanos = self.policy.max_delay.as_nanos() as f64;

        if !nanos.is_finite() || nanos >= max_nanos {
            self.policy.max_delay
        } else {
            Duration::from_nanos(nanos.max(0.0).round() as u64)
        }
    }

    /// Delay before the attempt following `attempt`, with symmetric jitter
    pub fn compute_delay(&self, attempt: u32) -> Duration {
        let delay = self.base_delay(attempt);
        let jitter_range = delay.as_nanos() as f64 * self.policy.jitter_factor.clamp(0.0, 1.0);
        if jitter_range <= 0.0 {
            return delay;
        }

        let jitter = rand::thread_rng().gen_range(-jitter_range..=jitter_range);
        let jittered = (delay.as_nanos() as f64 + jitter).max(0.0);
        Duration::from_nanos(jittered.round() as u64)
    }

    /// Run `operation` until it succeeds, fails permanently, or runs out of
    /// attempts. The last error is returned unchanged.
    #[instrument(skip(self, operation), fields(max_attempts = self.policy.max_attempts))]
    pub async fn execute<T, F, Fut>(&self, mut operation: F, context: &str) -> ExecResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ExecResult<T>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        info!("{} succeeded on attempt {}", context, attempt);
                    }
                    self.events.emit(RetryEvent::Success {
                        context: context.to_string(),
                        attempt,
                    });
                    return Ok(value);
                }
                Err(err) if !self.is_retryable(&err) => {
                    debug!("{} failed with non-retryable error: {}", context, err);
                    return Err(err);
                }
                Err(err) if attempt >= max_attempts => {
                    warn!("{} exhausted {} attempts: {}", context, attempt, err);
                    self.events.emit(RetryEvent::Exhausted {
                        context: context.to_string(),
                        attempt,
                        error: err.to_string(),
                    });
                    return Err(err);
                }
                Err(err) => {
                    let delay = self.compute_delay(attempt);
                    warn!(
                        "{} failed on attempt {}/{}, retrying in {:?}: {}",
                        context, attempt, max_attempts, delay, err
                    );
                    self.events.emit(RetryEvent::Retry {
                        context: context.to_string(),
                        attempt,
                        delay,
                        error: err.to_string(),
                    });
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for RetryManager {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}
