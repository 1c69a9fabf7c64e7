//! Error types for the resilience framework.
//!

use crate::execution::TaskError;
use crate::resilience::CircuitBreakerError;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ResilienceError {
    /// Retryable failure reported by an operation
    #[error("Transient failure: {0}")]
    Transient(String),
    /// Non-retryable failure reported by an operation
    #[error("Permanent failure: {0}")]
    Permanent(String),
    /// Requested more tokens than the bucket can ever hold
    #[error("Rate limit misconfigured: requested {requested} tokens but burst size is {burst_size}")]
    RateLimitMisconfigured { requested: u32, burst_size: u32 },
    #[error("Circuit breaker is open for {component}")]
    CircuitOpen { component: String },
    #[error("Task queue full: capacity {capacity}")]
    QueueFull { capacity: usize },
    #[error("Task queue is shutting down")]
    QueueShutdown,
    #[error("Background task manager is shutting down")]
    ManagerShutdown,
    #[error("Operation timed out after {0:?}")]
    OperationTimeout(Duration),
    #[error("Operation cancelled")]
    Cancelled,
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl ResilienceError {
    /// Whether a Retrier using the default classification should try again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ResilienceError::Transient(_) | ResilienceError::OperationTimeout(_)
        )
    }
}

impl From<crate::config::ConfigurationError> for ResilienceError {
    fn from(error: crate::config::ConfigurationError) -> Self {
        ResilienceError::Configuration(error.to_string())
    }
}

impl From<CircuitBreakerError<ResilienceError>> for ResilienceError {
    fn from(error: CircuitBreakerError<ResilienceError>) -> Self {
        match error {
            CircuitBreakerError::CircuitOpen { component } => {
                ResilienceError::CircuitOpen { component }
            }
            CircuitBreakerError::OperationFailed(inner) => inner,
            CircuitBreakerError::TimedOut { timeout, .. } => {
                ResilienceError::OperationTimeout(timeout)
            }
        }
    }
}

impl From<TaskError<ResilienceError>> for ResilienceError {
    fn from(error: TaskError<ResilienceError>) -> Self {
        match error {
            TaskError::Operation(inner) => inner,
            TaskError::Panicked(message) => {
                ResilienceError::Permanent(format!("operation panicked: {message}"))
            }
            TaskError::Cancelled => ResilienceError::Cancelled,
        }
    }
}

pub type Result<T> = std::result::Result<T, ResilienceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ResilienceError::Transient("503".to_string()).is_retryable());
        assert!(ResilienceError::OperationTimeout(Duration::from_secs(1)).is_retryable());
        assert!(!ResilienceError::Permanent("400".to_string()).is_retryable());
        assert!(!ResilienceError::CircuitOpen {
            component: "llm".to_string()
        }
        .is_retryable());
        assert!(!ResilienceError::QueueFull { capacity: 10 }.is_retryable());
    }

    #[test]
    fn test_flatten_breaker_errors() {
        let open: CircuitBreakerError<ResilienceError> = CircuitBreakerError::CircuitOpen {
            component: "upload".to_string(),
        };
        assert_eq!(
            ResilienceError::from(open),
            ResilienceError::CircuitOpen {
                component: "upload".to_string()
            }
        );

        let timed_out: CircuitBreakerError<ResilienceError> = CircuitBreakerError::TimedOut {
            component: "llm".to_string(),
            timeout: Duration::from_secs(2),
        };
        assert_eq!(
            ResilienceError::from(timed_out),
            ResilienceError::OperationTimeout(Duration::from_secs(2))
        );
    }

    #[test]
    fn test_flatten_task_errors() {
        assert_eq!(
            ResilienceError::from(TaskError::Cancelled),
            ResilienceError::Cancelled
        );
        assert_eq!(
            ResilienceError::from(TaskError::Operation(ResilienceError::QueueShutdown)),
            ResilienceError::QueueShutdown
        );

        let panicked = ResilienceError::from(TaskError::<ResilienceError>::Panicked(
            "boom".to_string(),
        ));
        assert_eq!(
            panicked,
            ResilienceError::Permanent("operation panicked: boom".to_string())
        );
        assert!(!panicked.is_retryable());
    }

    #[test]
    fn test_error_messages() {
        let err = ResilienceError::RateLimitMisconfigured {
            requested: 20,
            burst_size: 10,
        };
        assert_eq!(
            err.to_string(),
            "Rate limit misconfigured: requested 20 tokens but burst size is 10"
        );
        assert_eq!(
            ResilienceError::QueueFull { capacity: 5 }.to_string(),
            "Task queue full: capacity 5"
        );
    }
}
