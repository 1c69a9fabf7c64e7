//! # Execution
//!
//! Runs work on behalf of callers: the bounded priority queue with its worker
//! pool, and the background task manager for fire-and-forget and periodic
//! tasks. Both isolate panics so one misbehaving operation never takes down a
//! worker or the manager.

pub mod background;
pub mod task_result;
pub mod worker_pool;

pub use background::{
    BackgroundConfig, BackgroundHandle, BackgroundShutdownReport, BackgroundTaskInfo,
    BackgroundTaskManager, BackgroundTaskStatus, PeriodicJob,
};
pub use task_result::{TaskError, TaskPriority, TaskResult};
pub use worker_pool::{
    PriorityTaskQueue, QueueStats, ShutdownReport, TaskHandle, WorkerPoolConfig,
};

use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

/// Poll `future` to completion, turning a panic into its message
pub(crate) async fn catch_panic<Fut, T>(future: Fut) -> Result<T, String>
where
    Fut: Future<Output = T>,
{
    AssertUnwindSafe(future)
        .catch_unwind()
        .await
        .map_err(|payload| panic_message(payload.as_ref()))
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
