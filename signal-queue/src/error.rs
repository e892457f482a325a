use std::time::Duration;
use thiserror::Error;

use crate::types::EntryId;

/// Result type for queue operations
pub type QueueResult<T> = Result<T, QueueError>;

/// Result type for protected calls (executor, retry, breaker)
pub type ExecResult<T> = Result<T, ExecError>;

/// Infrastructure errors for queue operations
#[derive(Error, Debug, Clone)]
pub enum QueueError {
    #[error("Entry not found: {0}")]
    EntryNotFound(EntryId),

    #[error("Queue is full ({max_size} entries) and nothing can be evicted")]
    QueueFull { max_size: usize },

    #[error("A pending entry already uses dedupe key {key}")]
    Duplicate { key: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Errors raised by a [`Store`](crate::store::Store) implementation
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Details of a failed call against the downstream dependency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub message: String,
    /// Error code reported by the dependency (e.g. `ECONNRESET`)
    pub code: Option<String>,
    /// HTTP-like status reported by the dependency
    pub status: Option<u16>,
}

impl Failure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            status: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(code) = &self.code {
            write!(f, " (code {})", code)?;
        }
        if let Some(status) = self.status {
            write!(f, " (status {})", status)?;
        }
        Ok(())
    }
}

/// Outcome of a failed protected call - determines retry and breaker behavior
#[derive(Error, Debug, Clone)]
pub enum ExecError {
    /// Retryable failure, asserted by the executor
    #[error("Transient error: {0}")]
    Transient(Failure),

    /// Non-retryable failure, asserted by the executor
    #[error("Permanent error: {0}")]
    Permanent(Failure),

    /// Unclassified failure; the retry policy rules decide
    #[error("Execution failed: {0}")]
    Failed(Failure),

    /// The circuit breaker rejected the call without running it
    #[error("Circuit '{name}' is open, next attempt in {retry_in:?}")]
    CircuitOpen { name: String, retry_in: Duration },
}

impl ExecError {
    /// Create a transient error
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(Failure::new(msg))
    }

    /// Create a permanent error
    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(Failure::new(msg))
    }

    /// Create an unclassified error
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(Failure::new(msg))
    }

    /// Check if this is the breaker's own rejection
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// Failure details, if the error came from the dependency
    pub fn failure(&self) -> Option<&Failure> {
        match self {
            Self::Transient(f) | Self::Permanent(f) | Self::Failed(f) => Some(f),
            Self::CircuitOpen { .. } => None,
        }
    }

    /// Get the error message
    pub fn message(&self) -> String {
        match self.failure() {
            Some(failure) => failure.message.clone(),
            None => self.to_string(),
        }
    }
}
