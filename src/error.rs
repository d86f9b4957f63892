//! Error types for foreman
//!
//! Every failure carries a typed kind attached where the failure
//! originates, so retry eligibility is an exhaustive match instead of
//! substring sniffing on error messages. The partition matters: the
//! breaker and the scheduler retry only what [`ForemanError::is_transient`]
//! admits, and a [`ForemanError::Timeout`] is counted as a failure but
//! never retried.

use std::io;
use std::time::Duration;

pub type Result<T> = std::result::Result<T, ForemanError>;

#[derive(Debug, thiserror::Error)]
pub enum ForemanError {
    /// Transient condition (connection reset, worker busy, downstream
    /// unavailable, rate limited). Eligible for bounded retry at the
    /// breaker and scheduler layers.
    #[error("transient error: {0}")]
    Transient(String),

    /// An operation exceeded its deadline. Counted as a failure, never
    /// retried by the breaker.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The circuit is open; fail fast. Carries the time remaining until
    /// the next probe is admitted so callers can back off.
    #[error("circuit breaker is open, next probe in {retry_in:?}")]
    CircuitOpen { retry_in: Duration },

    /// A bounded wait queue refused a new entry.
    #[error("queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    /// The pool could not grow and its wait queue is at capacity.
    #[error("resource pool exhausted")]
    PoolExhausted,

    /// A worker process died while a request was in flight on it.
    #[error("worker process crashed: {0}")]
    WorkerCrash(String),

    /// A worker reported a skill-level execution failure.
    #[error("skill execution failed: {0}")]
    Skill(String),

    /// A batch response did not line up with its request (count mismatch
    /// or positional id mismatch).
    #[error("batch response mismatch: {0}")]
    BatchMismatch(String),

    /// Dispatching an entire batch failed; every item in that batch is
    /// rejected with this.
    #[error("batch dispatch failed: {0}")]
    BatchFailed(String),

    /// A worker process failed to start or to become ready in time.
    /// Fatal to pool initialization.
    #[error("worker spawn failed: {0}")]
    Spawn(String),

    /// The scheduler gave up on a task after exhausting its retries.
    #[error("task failed after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    /// The component is shutting down and no longer accepts work.
    #[error("shutting down")]
    ShuttingDown,

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ForemanError {
    /// Whether this failure is worth retrying.
    ///
    /// Timeouts are deliberately excluded: retrying a call that already
    /// consumed its whole deadline amplifies load on a struggling
    /// downstream. Backpressure, admission and validation errors describe
    /// the caller's situation, not the downstream's, so retrying them
    /// unchanged cannot succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ForemanError::Transient(_) => true,
            ForemanError::WorkerCrash(_) => true,
            ForemanError::Io(e) => is_io_transient(e),

            ForemanError::Timeout(_)
            | ForemanError::CircuitOpen { .. }
            | ForemanError::QueueFull { .. }
            | ForemanError::PoolExhausted
            | ForemanError::Skill(_)
            | ForemanError::BatchMismatch(_)
            | ForemanError::BatchFailed(_)
            | ForemanError::Spawn(_)
            | ForemanError::RetriesExhausted { .. }
            | ForemanError::ShuttingDown
            | ForemanError::Config(_)
            | ForemanError::Serialization(_) => false,
        }
    }

    /// Whether this failure is a deadline expiry.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ForemanError::Timeout(_))
    }

    /// Whether this failure should count against a circuit breaker.
    ///
    /// Admission rejections are the breaker's own verdicts, not
    /// observations about the guarded operation.
    pub fn counts_as_breaker_failure(&self) -> bool {
        !matches!(self, ForemanError::CircuitOpen { .. })
    }
}

fn is_io_transient(err: &io::Error) -> bool {
    use io::ErrorKind::*;
    matches!(
        err.kind(),
        ConnectionRefused
            | ConnectionReset
            | ConnectionAborted
            | NotConnected
            | BrokenPipe
            | TimedOut
            | Interrupted
            | WouldBlock
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_partition() {
        assert!(ForemanError::Transient("connection reset".into()).is_transient());
        assert!(ForemanError::WorkerCrash("exit 1".into()).is_transient());
        assert!(!ForemanError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(!ForemanError::PoolExhausted.is_transient());
        assert!(!ForemanError::QueueFull { capacity: 10 }.is_transient());
        assert!(!ForemanError::Skill("bad input".into()).is_transient());
        assert!(!ForemanError::ShuttingDown.is_transient());
    }

    #[test]
    fn test_timeout_is_failure_but_not_retryable() {
        let err = ForemanError::Timeout(Duration::from_millis(100));
        assert!(err.is_timeout());
        assert!(err.counts_as_breaker_failure());
        assert!(!err.is_transient());
    }

    #[test]
    fn test_circuit_open_does_not_count_as_failure() {
        let err = ForemanError::CircuitOpen {
            retry_in: Duration::from_secs(30),
        };
        assert!(!err.counts_as_breaker_failure());
        assert!(!err.is_transient());
    }

    #[test]
    fn test_io_kind_classification() {
        let reset = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        assert!(ForemanError::Io(reset).is_transient());

        let denied = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        assert!(!ForemanError::Io(denied).is_transient());
    }
}
