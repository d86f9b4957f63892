//! Circuit breaker for fault tolerance
//!
//! Wraps an arbitrary async operation with timeout racing and fail-fast
//! admission control. Three states:
//! - Closed: operations pass through, consecutive failures are counted
//! - Open: operations are rejected immediately until the cooldown elapses
//! - HalfOpen: a bounded probe window during which operations are let
//!   through to test recovery
//!
//! The Open → HalfOpen transition is lazy: it happens on the first
//! admission check after `next_retry`, not on a timer. The failure
//! threshold trips the circuit only while Closed; a failure run in
//! HalfOpen resets the success counter but does not re-open the circuit.
//! Transient failures are retried internally a bounded number of times
//! with a capped retry timeout; timeouts are recorded as failures with
//! their own error kind and are never retried.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::error::{ForemanError, Result};

/// Retained response-time samples for the running average.
const RESPONSE_SAMPLES: usize = 100;
/// Retained failure/success samples exposed via [`BreakerStats`].
const RECENT_SAMPLES: usize = 5;

/// State of the circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests pass through normally.
    Closed,
    /// Requests fail immediately until `next_retry`.
    Open { next_retry: Instant },
    /// Probing; admits requests only within the probe window from `entered`.
    HalfOpen { entered: Instant },
}

impl CircuitState {
    pub fn name(&self) -> &'static str {
        match self {
            CircuitState::Closed => "Closed",
            CircuitState::Open { .. } => "Open",
            CircuitState::HalfOpen { .. } => "HalfOpen",
        }
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures while Closed before the circuit opens.
    pub failure_threshold: u32,
    /// Consecutive successes while HalfOpen before the circuit closes.
    pub success_threshold: u32,
    /// How long the circuit stays Open before probing is allowed.
    pub cooldown: Duration,
    /// Default per-operation deadline.
    pub timeout: Duration,
    /// How long after entering HalfOpen probe calls are admitted.
    pub probe_window: Duration,
    /// Internal retry budget for transient failures.
    pub max_retries: u32,
    /// Ceiling applied to the timeout of internal retries.
    pub retry_timeout_cap: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            cooldown: Duration::from_secs(30),
            timeout: Duration::from_secs(10),
            probe_window: Duration::from_secs(5),
            max_retries: 2,
            retry_timeout_cap: Duration::from_secs(5),
        }
    }
}

/// One recorded failure, kept for [`BreakerStats::recent_failures`].
#[derive(Debug, Clone)]
pub struct FailureSample {
    pub error: String,
    pub response_time: Duration,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    response_times: VecDeque<Duration>,
    recent_failures: VecDeque<FailureSample>,
    recent_successes: VecDeque<Duration>,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            response_times: VecDeque::with_capacity(RESPONSE_SAMPLES),
            recent_failures: VecDeque::with_capacity(RECENT_SAMPLES),
            recent_successes: VecDeque::with_capacity(RECENT_SAMPLES),
        }
    }

    fn record_response_time(&mut self, elapsed: Duration) {
        if self.response_times.len() == RESPONSE_SAMPLES {
            self.response_times.pop_front();
        }
        self.response_times.push_back(elapsed);
    }
}

/// Snapshot of breaker counters and posture.
#[derive(Debug, Clone)]
pub struct BreakerStats {
    pub state: &'static str,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub failure_rate: f64,
    pub success_rate: f64,
    pub average_response_time: Duration,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    /// Time until the next probe is admitted, while Open.
    pub next_retry_in: Option<Duration>,
    pub recent_failures: Vec<FailureSample>,
    pub recent_successes: Vec<Duration>,
}

/// Circuit breaker guarding one downstream resource.
///
/// State lives behind a plain mutex that is never held across an await:
/// the guarded operation runs outside the lock, and only the bookkeeping
/// before and after takes it. That keeps every state query synchronous,
/// which the resource pool relies on when filtering handles.
///
/// # Example
/// ```no_run
/// use foreman::breaker::{BreakerConfig, CircuitBreaker};
/// use foreman::error::ForemanError;
///
/// # async fn example() -> Result<(), ForemanError> {
/// let breaker = CircuitBreaker::new("downstream", BreakerConfig::default());
/// let result = breaker
///     .execute(|| async { Ok::<_, ForemanError>(42) })
///     .await?;
/// assert_eq!(result, 42);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    name: Arc<str>,
    config: Arc<BreakerConfig>,
    inner: Arc<Mutex<BreakerInner>>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration.
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into().into(),
            config: Arc::new(config),
            inner: Arc::new(Mutex::new(BreakerInner::new())),
        }
    }

    /// Create a circuit breaker with default configuration.
    pub fn new_default(name: impl Into<String>) -> Self {
        Self::new(name, BreakerConfig::default())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Execute an operation under the configured timeout.
    pub async fn execute<F, Fut, T>(&self, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_with_timeout(op, self.config.timeout).await
    }

    /// Execute an operation, racing it against `timeout`.
    ///
    /// A timeout is recorded as a failure of kind
    /// [`ForemanError::Timeout`] and is not retried. Transient failures
    /// are retried up to the configured budget while the circuit is not
    /// Open, with the retry timeout capped so a struggling downstream is
    /// not held for the full deadline again.
    pub async fn execute_with_timeout<F, Fut, T>(&self, op: F, timeout: Duration) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 0;
        let mut current_timeout = timeout;

        loop {
            self.check_admission()?;
            attempt += 1;

            let started = Instant::now();
            let error = match tokio::time::timeout(current_timeout, op()).await {
                Ok(Ok(value)) => {
                    self.on_success(started.elapsed());
                    return Ok(value);
                }
                Ok(Err(e)) => e,
                Err(_) => ForemanError::Timeout(current_timeout),
            };

            if error.counts_as_breaker_failure() {
                self.on_failure(started.elapsed(), &error);
            }

            let retry = error.is_transient() && attempt <= self.config.max_retries && !self.is_open();
            if !retry {
                return Err(error);
            }

            current_timeout = current_timeout.min(self.config.retry_timeout_cap);
            debug!(
                breaker = %self.name,
                attempt,
                timeout_ms = current_timeout.as_millis() as u64,
                "retrying transient failure"
            );
        }
    }

    /// Fail-fast admission check; lazily moves Open → HalfOpen once the
    /// cooldown has elapsed.
    fn check_admission(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::Closed => {
                inner.total_requests += 1;
                Ok(())
            }
            CircuitState::Open { next_retry } => {
                let now = Instant::now();
                if now >= next_retry {
                    self.transition(&mut inner, CircuitState::HalfOpen { entered: now });
                    inner.total_requests += 1;
                    Ok(())
                } else {
                    Err(ForemanError::CircuitOpen {
                        retry_in: next_retry - now,
                    })
                }
            }
            CircuitState::HalfOpen { entered } => {
                if entered.elapsed() <= self.config.probe_window {
                    inner.total_requests += 1;
                    Ok(())
                } else {
                    // Probe window exhausted; stop admitting until reset.
                    Err(ForemanError::CircuitOpen {
                        retry_in: Duration::ZERO,
                    })
                }
            }
        }
    }

    fn on_success(&self, elapsed: Duration) {
        let mut inner = self.inner.lock().unwrap();
        inner.successful_requests += 1;
        inner.consecutive_successes += 1;
        inner.consecutive_failures = 0;
        inner.record_response_time(elapsed);
        if inner.recent_successes.len() == RECENT_SAMPLES {
            inner.recent_successes.pop_front();
        }
        inner.recent_successes.push_back(elapsed);

        if matches!(inner.state, CircuitState::HalfOpen { .. })
            && inner.consecutive_successes >= self.config.success_threshold
        {
            self.transition(&mut inner, CircuitState::Closed);
        }
    }

    fn on_failure(&self, elapsed: Duration, error: &ForemanError) {
        let mut inner = self.inner.lock().unwrap();
        inner.failed_requests += 1;
        inner.consecutive_failures += 1;
        inner.consecutive_successes = 0;
        inner.record_response_time(elapsed);
        if inner.recent_failures.len() == RECENT_SAMPLES {
            inner.recent_failures.pop_front();
        }
        inner.recent_failures.push_back(FailureSample {
            error: error.to_string(),
            response_time: elapsed,
        });

        // The threshold trips the circuit only while Closed. In HalfOpen
        // the state changes only through the success threshold or a reset.
        if inner.state == CircuitState::Closed
            && inner.consecutive_failures >= self.config.failure_threshold
        {
            self.transition(
                &mut inner,
                CircuitState::Open {
                    next_retry: Instant::now() + self.config.cooldown,
                },
            );
        }
    }

    fn transition(&self, inner: &mut BreakerInner, next: CircuitState) {
        let from = inner.state.name();
        inner.state = next;
        match next {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
                inner.consecutive_successes = 0;
            }
            CircuitState::HalfOpen { .. } => {
                inner.consecutive_failures = 0;
                inner.consecutive_successes = 0;
            }
            CircuitState::Open { .. } => {}
        }
        info!(breaker = %self.name, from, to = next.name(), "circuit state changed");
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().unwrap().state
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state(), CircuitState::Closed)
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state(), CircuitState::Open { .. })
    }

    pub fn is_half_open(&self) -> bool {
        matches!(self.state(), CircuitState::HalfOpen { .. })
    }

    /// Force the circuit open (test hook).
    pub fn force_open(&self) {
        let mut inner = self.inner.lock().unwrap();
        self.transition(
            &mut inner,
            CircuitState::Open {
                next_retry: Instant::now() + self.config.cooldown,
            },
        );
    }

    /// Force the circuit closed (test hook).
    pub fn force_close(&self) {
        let mut inner = self.inner.lock().unwrap();
        self.transition(&mut inner, CircuitState::Closed);
    }

    /// Force the circuit half-open, starting a fresh probe window (test hook).
    pub fn force_half_open(&self) {
        let mut inner = self.inner.lock().unwrap();
        self.transition(
            &mut inner,
            CircuitState::HalfOpen {
                entered: Instant::now(),
            },
        );
    }

    /// Return to a pristine Closed state, dropping all counters and samples.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        *inner = BreakerInner::new();
    }

    /// Counter snapshot with derived rates.
    pub fn stats(&self) -> BreakerStats {
        let inner = self.inner.lock().unwrap();
        let settled = inner.successful_requests + inner.failed_requests;
        let (failure_rate, success_rate) = if settled > 0 {
            (
                inner.failed_requests as f64 / settled as f64,
                inner.successful_requests as f64 / settled as f64,
            )
        } else {
            (0.0, 0.0)
        };
        let average_response_time = if inner.response_times.is_empty() {
            Duration::ZERO
        } else {
            inner.response_times.iter().sum::<Duration>() / inner.response_times.len() as u32
        };
        let next_retry_in = match inner.state {
            CircuitState::Open { next_retry } => {
                Some(next_retry.saturating_duration_since(Instant::now()))
            }
            _ => None,
        };

        BreakerStats {
            state: inner.state.name(),
            total_requests: inner.total_requests,
            successful_requests: inner.successful_requests,
            failed_requests: inner.failed_requests,
            failure_rate,
            success_rate,
            average_response_time,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            next_retry_in,
            recent_failures: inner.recent_failures.iter().cloned().collect(),
            recent_successes: inner.recent_successes.iter().copied().collect(),
        }
    }
}
