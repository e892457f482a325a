use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Calls pass through
    Closed,
    /// Dependency believed down; calls fail fast
    Open,
    /// Timeout elapsed; calls are trial calls
    HalfOpen,
}

impl CircuitState {
    pub fn name(self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Notifications emitted by a [`CircuitBreaker`](crate::CircuitBreaker)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BreakerEvent {
    StateChange {
        name: String,
        from: CircuitState,
        to: CircuitState,
    },

    Success {
        name: String,
        state: CircuitState,
    },

    Failure {
        name: String,
        state: CircuitState,
        error: String,
    },
}

impl BreakerEvent {
    /// Get event type name as string
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::StateChange { .. } => "stateChange",
            Self::Success { .. } => "success",
            Self::Failure { .. } => "failure",
        }
    }

    /// Name of the breaker that emitted the event
    pub fn breaker(&self) -> &str {
        match self {
            Self::StateChange { name, .. } => name,
            Self::Success { name, .. } => name,
            Self::Failure { name, .. } => name,
        }
    }
}

/// Notifications emitted by a [`RetryManager`](crate::RetryManager)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RetryEvent {
    /// Attempt failed and another one is scheduled after `delay`
    Retry {
        context: String,
        attempt: u32,
        delay: Duration,
        error: String,
    },

    Success {
        context: String,
        attempt: u32,
    },

    /// Last allowed attempt failed
    Exhausted {
        context: String,
        attempt: u32,
        error: String,
    },
}

impl RetryEvent {
    /// Get event type name as string
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Retry { .. } => "retry",
            Self::Success { .. } => "success",
            Self::Exhausted { .. } => "exhausted",
        }
    }

    /// Attempt number the event refers to
    pub fn attempt(&self) -> u32 {
        match self {
            Self::Retry { attempt, .. } => *attempt,
            Self::Success { attempt, .. } => *attempt,
            Self::Exhausted { attempt, .. } => *attempt,
        }
    }
}
