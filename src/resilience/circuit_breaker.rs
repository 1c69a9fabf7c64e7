//! # Circuit Breaker Implementation
//!
//! Fault isolation for calls to a failing dependency. Three states:
//! Closed (normal operation), Open (failing fast) and Half-Open (one trial
//! call testing recovery).
//!
//! All state lives behind a single mutex that is only held for bookkeeping,
//! never across the protected operation, so concurrent callers always observe
//! a consistent state and failure count.

use crate::resilience::{CircuitBreakerConfig, CircuitBreakerMetrics};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Circuit breaker states representing the current operational mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - all calls are allowed through
    Closed,
    /// Failure mode - all calls fail fast without executing
    Open,
    /// Testing recovery - a single trial call is allowed through
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        };
        f.write_str(label)
    }
}

/// Errors returned by [`CircuitBreaker::call`]
#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    /// Circuit is open; the operation was not invoked
    #[error("Circuit breaker is open for {component}")]
    CircuitOpen { component: String },

    /// Operation failed and was recorded
    #[error("Operation failed: {0}")]
    OperationFailed(E),

    /// Operation exceeded the call timeout and was recorded as a failure
    #[error("Operation timed out after {timeout:?} for {component}")]
    TimedOut { component: String, timeout: Duration },
}

impl<E> CircuitBreakerError<E> {
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, CircuitBreakerError::CircuitOpen { .. })
    }

    pub fn operation_error(&self) -> Option<&E> {
        match self {
            CircuitBreakerError::OperationFailed(error) => Some(error),
            _ => None,
        }
    }

    pub fn into_operation_error(self) -> Option<E> {
        match self {
            CircuitBreakerError::OperationFailed(error) => Some(error),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    /// Consecutive failures while closed
    failure_count: u32,
    last_failure_time: Option<Instant>,
    opened_at: Option<Instant>,
    /// A half-open trial call is running
    trial_in_flight: bool,
    half_open_successes: u32,
    metrics: CircuitBreakerMetrics,
}

/// Admission decision for one call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    Trial,
}

/// Releases a half-open trial slot if the call future is dropped mid-flight
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut inner = self.breaker.inner.lock();
            inner.trial_in_flight = false;
            debug!(component = %self.breaker.name, "Half-open trial call abandoned");
        }
    }
}

/// Core circuit breaker implementation
#[derive(Debug)]
pub struct CircuitBreaker {
    /// Component name for logging and metrics
    name: String,

    config: CircuitBreakerConfig,

    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let name = name.into();
        info!(
            component = %name,
            failure_threshold = config.failure_threshold,
            recovery_timeout_ms = config.recovery_timeout.as_millis() as u64,
            success_threshold = config.success_threshold,
            "🛡️ Circuit breaker initialized"
        );

        Self {
            name,
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure_time: None,
                opened_at: None,
                trial_in_flight: false,
                half_open_successes: 0,
                metrics: CircuitBreakerMetrics::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current circuit state
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Consecutive failures counted while closed
    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    /// Time since the most recent recorded failure
    pub fn time_since_last_failure(&self) -> Option<Duration> {
        self.inner
            .lock()
            .last_failure_time
            .map(|at| Instant::now().saturating_duration_since(at))
    }

    /// Execute an operation with circuit breaker protection.
    ///
    /// While open the operation is not invoked and `CircuitOpen` is returned.
    /// The operation's own error is always propagated after being recorded.
    pub async fn call<F, T, E, Fut>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let admission = self.admit().ok_or_else(|| CircuitBreakerError::CircuitOpen {
            component: self.name.clone(),
        })?;
        let mut guard = TrialGuard {
            breaker: self,
            armed: admission == Admission::Trial,
        };

        let start_time = Instant::now();
        let result = operation().await;
        let duration = start_time.elapsed();

        guard.armed = false;
        match &result {
            Ok(_) => self.record_success(admission, duration),
            Err(_) => self.record_failure(admission, duration),
        }

        result.map_err(CircuitBreakerError::OperationFailed)
    }

    /// Like [`call`](Self::call) but bounds the operation by `timeout`.
    ///
    /// A timeout drops the operation's future and counts as a failure.
    pub async fn call_with_timeout<F, T, E, Fut>(
        &self,
        timeout: Duration,
        operation: F,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let result = self
            .call(|| async move {
                match tokio::time::timeout(timeout, operation()).await {
                    Ok(result) => result.map_err(Some),
                    Err(_) => Err(None),
                }
            })
            .await;

        match result {
            Ok(value) => Ok(value),
            Err(CircuitBreakerError::OperationFailed(Some(error))) => {
                Err(CircuitBreakerError::OperationFailed(error))
            }
            Err(CircuitBreakerError::OperationFailed(None)) => {
                warn!(
                    component = %self.name,
                    timeout_ms = timeout.as_millis() as u64,
                    "⏱️ Operation timed out"
                );
                Err(CircuitBreakerError::TimedOut {
                    component: self.name.clone(),
                    timeout,
                })
            }
            Err(CircuitBreakerError::CircuitOpen { component }) => {
                Err(CircuitBreakerError::CircuitOpen { component })
            }
            Err(CircuitBreakerError::TimedOut { component, timeout }) => {
                Err(CircuitBreakerError::TimedOut { component, timeout })
            }
        }
    }

    /// Decide whether a call may proceed, performing the open to half-open
    /// transition once the recovery timeout has elapsed
    fn admit(&self) -> Option<Admission> {
        let mut inner = self.inner.lock();

        let admission = match inner.state {
            CircuitState::Closed => Some(Admission::Normal),
            CircuitState::Open => {
                // Late failures push recovery back; a forced open counts from
                // the moment it was forced
                let recovered = inner
                    .last_failure_time
                    .max(inner.opened_at)
                    .map(|since| since.elapsed() > self.config.recovery_timeout)
                    .unwrap_or(true);
                if recovered {
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    inner.trial_in_flight = true;
                    Some(Admission::Trial)
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    None
                } else {
                    inner.trial_in_flight = true;
                    Some(Admission::Trial)
                }
            }
        };

        match admission {
            Some(Admission::Trial) => inner.metrics.half_open_calls += 1,
            Some(Admission::Normal) => {}
            None => {
                inner.metrics.rejected_calls += 1;
                debug!(component = %self.name, state = %inner.state, "⛔ Call rejected");
            }
        }

        admission
    }

    fn record_success(&self, admission: Admission, duration: Duration) {
        let mut inner = self.inner.lock();
        inner.metrics.total_calls += 1;
        inner.metrics.success_count += 1;
        inner.metrics.total_duration += duration;

        debug!(
            component = %self.name,
            duration_ms = duration.as_millis() as u64,
            "🟢 Operation succeeded"
        );

        match (inner.state, admission) {
            (CircuitState::Closed, _) => {
                inner.failure_count = 0;
            }
            (CircuitState::HalfOpen, Admission::Trial) => {
                inner.trial_in_flight = false;
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.success_threshold {
                    self.transition(&mut inner, CircuitState::Closed);
                }
            }
            // Late result of a call admitted before the circuit tripped
            _ => {}
        }
    }

    fn record_failure(&self, admission: Admission, duration: Duration) {
        let mut inner = self.inner.lock();
        inner.metrics.total_calls += 1;
        inner.metrics.failure_count += 1;
        inner.metrics.total_duration += duration;
        inner.last_failure_time = Some(Instant::now());

        debug!(
            component = %self.name,
            duration_ms = duration.as_millis() as u64,
            "🔴 Operation failed"
        );

        match (inner.state, admission) {
            (CircuitState::Closed, _) => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            (CircuitState::HalfOpen, Admission::Trial) => {
                inner.trial_in_flight = false;
                self.transition(&mut inner, CircuitState::Open);
            }
            _ => {}
        }
    }

    /// Apply a state change. Caller holds the lock.
    fn transition(&self, inner: &mut BreakerState, to: CircuitState) {
        let from = inner.state;
        inner.state = to;
        inner.metrics.state_transitions += 1;

        match to {
            CircuitState::Closed => {
                inner.failure_count = 0;
                inner.opened_at = None;
                inner.trial_in_flight = false;
                inner.half_open_successes = 0;
                info!(
                    component = %self.name,
                    from = %from,
                    total_calls = inner.metrics.total_calls,
                    "🟢 Circuit breaker closed (recovered)"
                );
            }
            CircuitState::Open => {
                inner.opened_at = Some(Instant::now());
                inner.trial_in_flight = false;
                inner.half_open_successes = 0;
                error!(
                    component = %self.name,
                    from = %from,
                    consecutive_failures = inner.failure_count,
                    failure_threshold = self.config.failure_threshold,
                    recovery_timeout_ms = self.config.recovery_timeout.as_millis() as u64,
                    "🔴 Circuit breaker opened (failing fast)"
                );
            }
            CircuitState::HalfOpen => {
                inner.half_open_successes = 0;
                info!(
                    component = %self.name,
                    success_threshold = self.config.success_threshold,
                    "🟡 Circuit breaker half-open (testing recovery)"
                );
            }
        }
    }

    /// Force circuit to open state (for emergency situations)
    pub fn force_open(&self) {
        warn!(component = %self.name, "🚨 Circuit breaker forced open");
        let mut inner = self.inner.lock();
        self.transition(&mut inner, CircuitState::Open);
    }

    /// Force circuit to closed state (for emergency recovery)
    pub fn force_closed(&self) {
        warn!(component = %self.name, "🚨 Circuit breaker forced closed");
        let mut inner = self.inner.lock();
        self.transition(&mut inner, CircuitState::Closed);
    }

    /// Current metrics snapshot
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let inner = self.inner.lock();
        let mut snapshot = inner.metrics.clone();
        snapshot.current_state = inner.state;
        snapshot.consecutive_failures = u64::from(inner.failure_count);
        snapshot.with_derived()
    }

    /// Closed with a failure rate below 10% (or too few calls to tell)
    pub fn is_healthy(&self) -> bool {
        let inner = self.inner.lock();
        if inner.state != CircuitState::Closed {
            return false;
        }

        let metrics = &inner.metrics;
        if metrics.total_calls < 10 {
            return true;
        }

        (metrics.failure_count as f64 / metrics.total_calls as f64) < 0.1
    }
}
