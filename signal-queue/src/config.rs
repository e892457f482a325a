//! # Pipeline configuration
//!
//! Every component takes a plain config struct with sensible defaults and
//! `with_*` setters. [`PipelineConfig`] bundles the three of them and can be
//! layered from environment variables using a caller-chosen prefix:
//!
//! ```bash
//! export SIGQ__QUEUE__MAX_SIZE=500
//! export SIGQ__BREAKER__TIMEOUT_MS=30000
//! export SIGQ__RETRY__JITTER_FACTOR=0.2
//! ```
//!
//! ```rust
//! use signal_queue::PipelineConfig;
//! let config = PipelineConfig::from_env("SIGQ");
//! assert!(config.queue.max_size > 0);
//! ```

use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

/// Configuration for a [`SignalQueue`](crate::SignalQueue)
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    /// Interval of the polling loop
    pub poll_interval: Duration,
    /// Maximum entries in the live queue
    pub max_size: usize,
    /// TTL applied when the caller does not pass one
    pub default_ttl: Duration,
    /// Failed attempts before an entry is dead-lettered
    pub max_retries: u32,
    /// Dead letters kept; the oldest are dropped beyond this
    pub max_dead_letters: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            max_size: 1000,
            default_ttl: Duration::from_secs(300), // 5 minutes
            max_retries: 3,
            max_dead_letters: 1000,
        }
    }
}

impl QueueConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_max_dead_letters(mut self, max_dead_letters: usize) -> Self {
        self.max_dead_letters = max_dead_letters;
        self
    }
}

/// Configuration for a [`CircuitBreaker`](crate::CircuitBreaker)
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in CLOSED before opening
    pub failure_threshold: u32,
    /// Consecutive successes in HALF_OPEN before closing
    pub success_threshold: u32,
    /// Time spent OPEN before a trial call is allowed
    pub timeout: Duration,
    /// How often the background monitor checks an OPEN breaker
    pub monitor_interval: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(60),
            monitor_interval: Duration::from_secs(1),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval = interval;
        self
    }
}

/// Backoff and retryability rules for a [`RetryManager`](crate::RetryManager)
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Symmetric jitter as a fraction of the delay (0.0 to 1.0)
    pub jitter_factor: f64,
    pub exponential_base: f64,
    /// Error codes treated as transient (exact match)
    pub retryable_codes: Vec<String>,
    /// HTTP-like statuses treated as transient
    pub retryable_statuses: Vec<u16>,
    /// Case-insensitive message substrings treated as transient
    pub retryable_messages: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            jitter_factor: 0.1,
            exponential_base: 2.0,
            retryable_codes: ["ECONNRESET", "ETIMEDOUT", "ECONNREFUSED", "EPIPE", "ENOTFOUND", "EAI_AGAIN"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            retryable_statuses: vec![408, 429, 500, 502, 503, 504],
            retryable_messages: ["timeout", "rate limit", "unavailable", "network", "temporarily"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Clamped to `[0.0, 1.0]`
    pub fn with_jitter_factor(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor.clamp(0.0, 1.0);
        self
    }

    pub fn with_exponential_base(mut self, base: f64) -> Self {
        self.exponential_base = base;
        self
    }

    pub fn with_retryable_code(mut self, code: impl Into<String>) -> Self {
        self.retryable_codes.push(code.into());
        self
    }

    pub fn with_retryable_status(mut self, status: u16) -> Self {
        self.retryable_statuses.push(status);
        self
    }

    pub fn with_retryable_message(mut self, pattern: impl Into<String>) -> Self {
        self.retryable_messages.push(pattern.into());
        self
    }
}

/// Bundle of component configs for a [`SignalPipeline`](crate::SignalPipeline)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineConfig {
    pub queue: QueueConfig,
    pub breaker: CircuitBreakerConfig,
    pub retry: RetryPolicy,
}

impl PipelineConfig {
    /// Defaults overridden by `<PREFIX>__SECTION__KEY` variables
    pub fn from_env(prefix: &str) -> Self {
        let mut config = Self::default();
        config.apply_env(prefix);
        config
    }

    /// Override fields from the process environment
    pub fn apply_env(&mut self, prefix: &str) {
        self.apply_vars(prefix, std::env::vars());
    }

    /// Override fields from an explicit set of variables
    pub fn apply_vars<I>(&mut self, prefix: &str, vars: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let head = format!("{}__", prefix);
        for (key, value) in vars {
            let Some(stripped) = key.strip_prefix(&head) else {
                continue;
            };
            let normalized = stripped.to_lowercase().replace("__", ".");
            self.apply_one(&normalized, value.trim());
        }
    }

    fn apply_one(&mut self, key: &str, value: &str) {
        match key {
            "queue.poll_interval_ms" => set_millis(&mut self.queue.poll_interval, key, value),
            "queue.max_size" => set_parsed(&mut self.queue.max_size, key, value),
            "queue.default_ttl_ms" => set_millis(&mut self.queue.default_ttl, key, value),
            "queue.max_retries" => set_parsed(&mut self.queue.max_retries, key, value),
            "queue.max_dead_letters" => set_parsed(&mut self.queue.max_dead_letters, key, value),
            "breaker.failure_threshold" => set_parsed(&mut self.breaker.failure_threshold, key, value),
            "breaker.success_threshold" => set_parsed(&mut self.breaker.success_threshold, key, value),
            "breaker.timeout_ms" => set_millis(&mut self.breaker.timeout, key, value),
            "breaker.monitor_interval_ms" => set_millis(&mut self.breaker.monitor_interval, key, value),
            "retry.max_attempts" => set_parsed(&mut self.retry.max_attempts, key, value),
            "retry.base_delay_ms" => set_millis(&mut self.retry.base_delay, key, value),
            "retry.max_delay_ms" => set_millis(&mut self.retry.max_delay, key, value),
            "retry.jitter_factor" => {
                set_parsed(&mut self.retry.jitter_factor, key, value);
                self.retry.jitter_factor = self.retry.jitter_factor.clamp(0.0, 1.0);
            }
            "retry.exponential_base" => set_parsed(&mut self.retry.exponential_base, key, value),
            _ => warn!("Ignoring unknown pipeline config key: {}", key),
        }
    }
}

fn set_parsed<T: FromStr>(slot: &mut T, key: &str, value: &str) {
    match value.parse::<T>() {
        Ok(parsed) => *slot = parsed,
        Err(_) => warn!("Ignoring unparseable value for {}: {:?}", key, value),
    }
}

fn set_millis(slot: &mut Duration, key: &str, value: &str) {
    match value.parse::<u64>() {
        Ok(ms) => *slot = Duration::from_millis(ms),
        Err(_) => warn!("Ignoring unparseable value for {}: {:?}", key, value),
    }
}
