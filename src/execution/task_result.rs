//! Result and priority types shared by the Retrier and the task queue.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Dequeue priority. Higher priorities are dequeued first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    Normal,
    High,
    Critical,
}

impl Default for TaskPriority {
    fn default() -> Self {
        TaskPriority::Normal
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TaskPriority::Low => "low",
            TaskPriority::Normal => "normal",
            TaskPriority::High => "high",
            TaskPriority::Critical => "critical",
        };
        f.write_str(label)
    }
}

/// Outcome of one executed operation.
///
/// Holds either the value or the captured error, never both, along with how
/// long execution took and how many retries were performed.
#[derive(Debug, Clone)]
pub struct TaskResult<T, E> {
    outcome: Result<T, E>,
    execution_time: Duration,
    retries: u32,
}

impl<T, E> TaskResult<T, E> {
    pub fn success(value: T, execution_time: Duration, retries: u32) -> Self {
        Self {
            outcome: Ok(value),
            execution_time,
            retries,
        }
    }

    pub fn failure(error: E, execution_time: Duration, retries: u32) -> Self {
        Self {
            outcome: Err(error),
            execution_time,
            retries,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn value(&self) -> Option<&T> {
        self.outcome.as_ref().ok()
    }

    pub fn error(&self) -> Option<&E> {
        self.outcome.as_ref().err()
    }

    pub fn execution_time(&self) -> Duration {
        self.execution_time
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn outcome(&self) -> &Result<T, E> {
        &self.outcome
    }

    pub fn into_result(self) -> Result<T, E> {
        self.outcome
    }

    /// Map the error type, keeping timing and retry count
    pub fn map_err<F, O>(self, op: O) -> TaskResult<T, F>
    where
        O: FnOnce(E) -> F,
    {
        TaskResult {
            outcome: self.outcome.map_err(op),
            execution_time: self.execution_time,
            retries: self.retries,
        }
    }
}

/// Failure delivered through a queue completion handle
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TaskError<E> {
    /// The operation returned an error
    #[error("operation failed: {0}")]
    Operation(E),
    /// The operation panicked; the worker survived
    #[error("operation panicked: {0}")]
    Panicked(String),
    /// The task was cancelled before it could finish
    #[error("task cancelled")]
    Cancelled,
}

impl<E> TaskError<E> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskError::Cancelled)
    }

    pub fn operation_error(&self) -> Option<&E> {
        match self {
            TaskError::Operation(error) => Some(error),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(TaskPriority::Critical > TaskPriority::High);
        assert!(TaskPriority::High > TaskPriority::Normal);
        assert!(TaskPriority::Normal > TaskPriority::Low);
        assert_eq!(TaskPriority::default(), TaskPriority::Normal);
        assert_eq!(TaskPriority::High.to_string(), "high");
    }

    #[test]
    fn test_result_value_and_error_are_exclusive() {
        let ok: TaskResult<u32, String> = TaskResult::success(7, Duration::from_millis(5), 1);
        assert!(ok.is_success());
        assert_eq!(ok.value(), Some(&7));
        assert!(ok.error().is_none());
        assert_eq!(ok.retries(), 1);

        let failed: TaskResult<u32, String> =
            TaskResult::failure("boom".to_string(), Duration::from_millis(5), 2);
        assert!(!failed.is_success());
        assert!(failed.value().is_none());
        assert_eq!(failed.error().map(String::as_str), Some("boom"));
    }

    #[test]
    fn test_map_err_keeps_metadata() {
        let failed: TaskResult<(), &str> = TaskResult::failure("x", Duration::from_secs(3), 2);
        let mapped = failed.map_err(|e| TaskError::Operation(e.to_string()));
        assert_eq!(mapped.retries(), 2);
        assert_eq!(mapped.execution_time(), Duration::from_secs(3));
        assert_eq!(
            mapped.error().and_then(TaskError::operation_error).map(String::as_str),
            Some("x")
        );
    }

    #[test]
    fn test_task_error_display() {
        let err: TaskError<String> = TaskError::Operation("503".to_string());
        assert_eq!(err.to_string(), "operation failed: 503");
        assert!(TaskError::<String>::Cancelled.is_cancelled());
    }
}
