//! # Priority Task Queue and Worker Pool
//!
//! Bounded-concurrency execution of submitted operations.
//!
//! Submissions are kept in a bounded binary heap ordered by priority and then
//! by submission sequence, so equal priorities run first-in first-out. A
//! fixed set of `max_concurrency` worker loops pulls from the heap; each
//! worker runs one operation at a time, which is what bounds concurrency.
//!
//! A counting semaphore carries one permit per queued entry. Workers acquire
//! a permit before popping, so they park without polling while the queue is
//! empty. On shutdown each worker is handed one extra permit; a worker that
//! finds the heap empty after acquiring a permit exits, which lets the pool
//! drain everything already queued before the loops stop.
//!
//! ```text
//! submit() ──► [BinaryHeap + Semaphore] ──► worker 0..N ──► completion handle
//! ```

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::{join_all, BoxFuture};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{ConfigResult, ConfigurationError};
use crate::error::{ResilienceError, Result};
use crate::execution::{catch_panic, TaskError, TaskPriority, TaskResult};
use crate::logging::log_error;
use crate::resilience::config::duration_millis;

/// Worker pool configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// Number of worker loops, and therefore the maximum number of
    /// operations running at once
    pub max_concurrency: usize,

    /// Maximum number of queued (not yet running) entries
    pub max_queue_size: usize,

    /// Default drain timeout used by [`PriorityTaskQueue::shutdown_default`]
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            max_queue_size: 1000,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerPoolConfig {
    pub fn new(max_concurrency: usize, max_queue_size: usize) -> Self {
        Self {
            max_concurrency,
            max_queue_size,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_concurrency == 0 {
            return Err(ConfigurationError::invalid_value(
                "worker_pool.max_concurrency",
                self.max_concurrency,
                "must be greater than 0",
            ));
        }

        if self.max_queue_size == 0 {
            return Err(ConfigurationError::invalid_value(
                "worker_pool.max_queue_size",
                self.max_queue_size,
                "must be greater than 0",
            ));
        }

        Ok(())
    }
}

/// Point-in-time counters for a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QueueStats {
    /// Entries accepted by `submit`
    pub total_submitted: u64,
    /// Operations that returned a value
    pub completed: u64,
    /// Operations that returned an error or panicked
    pub failed: u64,
    /// Entries resolved as cancelled during shutdown
    pub cancelled: u64,
    /// Submissions refused because the queue was full
    pub rejected: u64,
    /// Operations running right now
    pub currently_active: usize,
    /// Entries waiting for a worker
    pub queue_size: usize,
}

/// What happened during [`PriorityTaskQueue::shutdown`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// All queued and in-flight work finished within the timeout
    pub drained: bool,
    /// Operations that were running when workers were aborted
    pub cancelled_in_flight: usize,
    /// Entries that never started
    pub cancelled_queued: usize,
}

enum JobOutcome {
    Succeeded,
    Failed,
    Panicked(String),
}

type Job = Box<dyn FnOnce() -> BoxFuture<'static, JobOutcome> + Send>;

struct QueueEntry {
    priority: TaskPriority,
    sequence: u64,
    job: Job,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    // Max-heap: higher priority first, then lower sequence first
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

#[derive(Default)]
struct QueueCounters {
    total_submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    rejected: AtomicU64,
    active: AtomicUsize,
    queued: AtomicUsize,
    /// Operations dropped mid-run by a worker abort
    aborted_in_flight: AtomicUsize,
}

struct QueueShared {
    name: String,
    config: WorkerPoolConfig,
    pending: Mutex<BinaryHeap<QueueEntry>>,
    /// One permit per queued entry, plus one per worker once shutdown begins
    ready: Semaphore,
    accepting: AtomicBool,
    sequence: AtomicU64,
    counters: QueueCounters,
}

impl QueueShared {
    fn pop(&self) -> Option<QueueEntry> {
        let mut pending = self.pending.lock();
        let entry = pending.pop();
        if entry.is_some() {
            self.counters.queued.fetch_sub(1, Ordering::AcqRel);
        }
        entry
    }
}

/// Tracks one running operation. Keeps `currently_active` accurate on every
/// exit path and counts the operation as cancelled if it is dropped before
/// reporting an outcome.
struct InFlightGuard<'a> {
    counters: &'a QueueCounters,
    finished: bool,
}

impl<'a> InFlightGuard<'a> {
    fn enter(counters: &'a QueueCounters) -> Self {
        counters.active.fetch_add(1, Ordering::AcqRel);
        Self {
            counters,
            finished: false,
        }
    }

    fn finish(mut self, outcome: &JobOutcome) {
        self.finished = true;
        let counter = match outcome {
            JobOutcome::Succeeded => &self.counters.completed,
            JobOutcome::Failed | JobOutcome::Panicked(_) => &self.counters.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
            self.counters
                .aborted_in_flight
                .fetch_add(1, Ordering::AcqRel);
        }
        self.counters.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Completion handle for a submitted operation.
///
/// Resolves to the operation's [`TaskResult`]. If the entry is dropped without
/// running (queue shut down or aborted) it resolves to [`TaskError::Cancelled`].
#[derive(Debug)]
pub struct TaskHandle<T, E> {
    sequence: u64,
    priority: TaskPriority,
    receiver: oneshot::Receiver<TaskResult<T, TaskError<E>>>,
}

impl<T, E> TaskHandle<T, E> {
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn priority(&self) -> TaskPriority {
        self.priority
    }
}

impl<T, E> Future for TaskHandle<T, E> {
    type Output = TaskResult<T, TaskError<E>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(TaskResult::failure(
                TaskError::Cancelled,
                Duration::ZERO,
                0,
            )),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Bounded priority queue drained by a fixed pool of workers
///
/// # Examples
///
/// ```rust
/// use taskguard::execution::{PriorityTaskQueue, TaskPriority, WorkerPoolConfig};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let queue = PriorityTaskQueue::new("uploads", WorkerPoolConfig::new(2, 100))?;
///     queue.start()?;
///
///     let handle = queue.submit_with_priority(TaskPriority::High, || async {
///         Ok::<_, std::io::Error>(42)
///     })?;
///     assert_eq!(handle.await.value(), Some(&42));
///
///     queue.shutdown(std::time::Duration::from_secs(5)).await;
///     Ok(())
/// }
/// ```
pub struct PriorityTaskQueue {
    shared: Arc<QueueShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl std::fmt::Debug for PriorityTaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriorityTaskQueue")
            .field("name", &self.shared.name)
            .field("config", &self.shared.config)
            .field("started", &self.started.load(Ordering::Relaxed))
            .field("stats", &self.stats())
            .finish()
    }
}

impl PriorityTaskQueue {
    /// Create a queue. Workers are not running until [`start`](Self::start).
    pub fn new(name: impl Into<String>, config: WorkerPoolConfig) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            shared: Arc::new(QueueShared {
                name: name.into(),
                pending: Mutex::new(BinaryHeap::with_capacity(config.max_queue_size.min(1024))),
                ready: Semaphore::new(0),
                accepting: AtomicBool::new(true),
                sequence: AtomicU64::new(0),
                counters: QueueCounters::default(),
                config,
            }),
            workers: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.shared.config
    }

    /// Spawn `max_concurrency` worker loops on the current runtime
    pub fn start(&self) -> Result<()> {
        if !self.shared.accepting.load(Ordering::Acquire) {
            return Err(ResilienceError::QueueShutdown);
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(ResilienceError::Configuration(format!(
                "task queue '{}' already started",
                self.shared.name
            )));
        }

        let worker_count = self.shared.config.max_concurrency;
        let mut workers = self.workers.lock();
        for worker_id in 0..worker_count {
            let shared = Arc::clone(&self.shared);
            workers.push(tokio::spawn(worker_loop(shared, worker_id)));
        }

        info!(
            queue = %self.shared.name,
            workers = worker_count,
            max_queue_size = self.shared.config.max_queue_size,
            "Task queue started"
        );
        Ok(())
    }

    /// Submit with [`TaskPriority::Normal`]
    pub fn submit<F, Fut, T, E>(&self, operation: F) -> Result<TaskHandle<T, E>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        self.submit_with_priority(TaskPriority::Normal, operation)
    }

    /// Queue `operation` and return its completion handle.
    ///
    /// Never blocks: a full queue rejects with [`ResilienceError::QueueFull`],
    /// a queue that is shutting down with [`ResilienceError::QueueShutdown`].
    pub fn submit_with_priority<F, Fut, T, E>(
        &self,
        priority: TaskPriority,
        operation: F,
    ) -> Result<TaskHandle<T, E>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();
        let job: Job = Box::new(move || {
            Box::pin(async move {
                let started = Instant::now();
                let (result, outcome) = match catch_panic(async move { operation().await }).await
                {
                    Ok(Ok(value)) => (
                        TaskResult::success(value, started.elapsed(), 0),
                        JobOutcome::Succeeded,
                    ),
                    Ok(Err(error)) => (
                        TaskResult::failure(TaskError::Operation(error), started.elapsed(), 0),
                        JobOutcome::Failed,
                    ),
                    Err(panic) => (
                        TaskResult::failure(
                            TaskError::Panicked(panic.clone()),
                            started.elapsed(),
                            0,
                        ),
                        JobOutcome::Panicked(panic),
                    ),
                };
                // The submitter may have dropped its handle
                let _ = sender.send(result);
                outcome
            })
        });

        let sequence = {
            let mut pending = self.shared.pending.lock();
            if !self.shared.accepting.load(Ordering::Acquire) {
                return Err(ResilienceError::QueueShutdown);
            }
            if pending.len() >= self.shared.config.max_queue_size {
                self.shared.counters.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(
                    queue = %self.shared.name,
                    capacity = self.shared.config.max_queue_size,
                    "Task queue full, rejecting submission"
                );
                return Err(ResilienceError::QueueFull {
                    capacity: self.shared.config.max_queue_size,
                });
            }

            let sequence = self.shared.sequence.fetch_add(1, Ordering::Relaxed);
            pending.push(QueueEntry {
                priority,
                sequence,
                job,
            });
            self.shared.counters.queued.fetch_add(1, Ordering::AcqRel);
            self.shared
                .counters
                .total_submitted
                .fetch_add(1, Ordering::Relaxed);
            sequence
        };
        self.shared.ready.add_permits(1);

        debug!(queue = %self.shared.name, sequence, %priority, "Task submitted");

        Ok(TaskHandle {
            sequence,
            priority,
            receiver,
        })
    }

    /// Current counters; never waits on workers
    pub fn stats(&self) -> QueueStats {
        let counters = &self.shared.counters;
        QueueStats {
            total_submitted: counters.total_submitted.load(Ordering::Relaxed),
            completed: counters.completed.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            cancelled: counters.cancelled.load(Ordering::Relaxed),
            rejected: counters.rejected.load(Ordering::Relaxed),
            currently_active: counters.active.load(Ordering::Acquire),
            queue_size: counters.queued.load(Ordering::Acquire),
        }
    }

    pub fn is_accepting(&self) -> bool {
        self.shared.accepting.load(Ordering::Acquire)
    }

    /// [`shutdown`](Self::shutdown) with the configured timeout
    pub async fn shutdown_default(&self) -> ShutdownReport {
        self.shutdown(self.shared.config.shutdown_timeout).await
    }

    /// Stop accepting work, drain for up to `timeout`, then cancel the rest.
    ///
    /// When this returns every handle issued by the queue is resolved.
    pub async fn shutdown(&self, timeout: Duration) -> ShutdownReport {
        {
            let _pending = self.shared.pending.lock();
            self.shared.accepting.store(false, Ordering::Release);
        }

        let mut workers = std::mem::take(&mut *self.workers.lock());
        info!(
            queue = %self.shared.name,
            workers = workers.len(),
            queued = self.shared.counters.queued.load(Ordering::Acquire),
            timeout_ms = timeout.as_millis() as u64,
            "Shutting down task queue"
        );

        // One exit permit per worker, consumed after the heap is empty
        self.shared.ready.add_permits(workers.len());

        let drained = tokio::time::timeout(timeout, join_all(workers.iter_mut()))
            .await
            .is_ok();

        let mut cancelled_in_flight = 0;
        if !drained {
            warn!(
                queue = %self.shared.name,
                in_flight = self.shared.counters.active.load(Ordering::Acquire),
                "Task queue did not drain within timeout, aborting workers"
            );
            let aborted_before = self
                .shared
                .counters
                .aborted_in_flight
                .load(Ordering::Acquire);
            for worker in &workers {
                worker.abort();
            }
            // Aborted tasks drop their futures, resolving in-flight handles.
            // Workers that already exited were polled to completion above.
            for worker in workers.iter_mut().filter(|worker| !worker.is_finished()) {
                let _ = worker.await;
            }
            cancelled_in_flight = self
                .shared
                .counters
                .aborted_in_flight
                .load(Ordering::Acquire)
                - aborted_before;
        }

        self.shared.ready.close();
        let mut cancelled_queued = 0;
        while self.shared.pop().is_some() {
            cancelled_queued += 1;
        }

        self.shared
            .counters
            .cancelled
            .fetch_add(cancelled_queued as u64, Ordering::Relaxed);

        let report = ShutdownReport {
            drained: drained && cancelled_queued == 0,
            cancelled_in_flight,
            cancelled_queued,
        };
        info!(
            queue = %self.shared.name,
            drained = report.drained,
            cancelled_in_flight,
            cancelled_queued,
            "Task queue shut down"
        );
        report
    }
}

impl Drop for PriorityTaskQueue {
    fn drop(&mut self) {
        self.shared.accepting.store(false, Ordering::Release);
        // Wakes parked workers; they exit after their current operation
        self.shared.ready.close();
    }
}

async fn worker_loop(shared: Arc<QueueShared>, worker_id: usize) {
    debug!(queue = %shared.name, worker_id, "Worker started");

    loop {
        match shared.ready.acquire().await {
            Ok(permit) => permit.forget(),
            Err(_) => break,
        }

        let Some(entry) = shared.pop() else {
            break;
        };

        let in_flight = InFlightGuard::enter(&shared.counters);
        debug!(
            queue = %shared.name,
            worker_id,
            sequence = entry.sequence,
            priority = %entry.priority,
            "Worker picked up task"
        );

        let outcome = (entry.job)().await;
        in_flight.finish(&outcome);
        if let JobOutcome::Panicked(panic) = outcome {
            log_error(
                &shared.name,
                "task_execution",
                &panic,
                Some("operation panicked, worker continues"),
            );
        }
    }

    debug!(queue = %shared.name, worker_id, "Worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ResilienceError;
    use std::sync::atomic::AtomicUsize;
    use tokio_test::{assert_pending, assert_ready};

    fn queue(max_concurrency: usize, max_queue_size: usize) -> PriorityTaskQueue {
        PriorityTaskQueue::new("test", WorkerPoolConfig::new(max_concurrency, max_queue_size))
            .unwrap()
    }

    #[test]
    fn test_entry_ordering() {
        let entry = |priority, sequence| QueueEntry {
            priority,
            sequence,
            job: Box::new(|| Box::pin(async { JobOutcome::Succeeded })),
        };

        let mut heap = BinaryHeap::new();
        heap.push(entry(TaskPriority::Low, 0));
        heap.push(entry(TaskPriority::High, 1));
        heap.push(entry(TaskPriority::Normal, 2));
        heap.push(entry(TaskPriority::High, 3));
        heap.push(entry(TaskPriority::Critical, 4));

        let order: Vec<(TaskPriority, u64)> =
            std::iter::from_fn(|| heap.pop().map(|e| (e.priority, e.sequence))).collect();
        assert_eq!(
            order,
            vec![
                (TaskPriority::Critical, 4),
                (TaskPriority::High, 1),
                (TaskPriority::High, 3),
                (TaskPriority::Normal, 2),
                (TaskPriority::Low, 0),
            ]
        );
    }

    #[tokio::test]
    async fn test_submit_and_await_result() {
        let queue = queue(2, 10);
        queue.start().unwrap();

        let ok = queue.submit(|| async { Ok::<_, String>(21 * 2) }).unwrap();
        let err = queue
            .submit(|| async { Err::<u32, _>("upstream 500".to_string()) })
            .unwrap();

        let ok = ok.await;
        assert!(ok.is_success());
        assert_eq!(ok.value(), Some(&42));

        let err = err.await;
        assert_eq!(
            err.error(),
            Some(&TaskError::Operation("upstream 500".to_string()))
        );

        queue.shutdown(Duration::from_secs(1)).await;
        let stats = queue.stats();
        assert_eq!(stats.total_submitted, 2);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test]
    async fn test_panic_does_not_kill_worker() {
        let queue = queue(1, 10);
        queue.start().unwrap();

        let panicking = queue
            .submit(|| async {
                panic!("handler exploded");
                #[allow(unreachable_code)]
                Ok::<(), String>(())
            })
            .unwrap();
        let after = queue.submit(|| async { Ok::<_, String>("still alive") }).unwrap();

        assert_eq!(
            panicking.await.error(),
            Some(&TaskError::Panicked("handler exploded".to_string()))
        );
        assert_eq!(after.await.value(), Some(&"still alive"));
        queue.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_priority_order_with_fifo_ties() {
        let queue = queue(1, 10);
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for (label, priority) in [
            ("low", TaskPriority::Low),
            ("high-1", TaskPriority::High),
            ("normal", TaskPriority::Normal),
            ("high-2", TaskPriority::High),
        ] {
            let order = Arc::clone(&order);
            handles.push(
                queue
                    .submit_with_priority(priority, move || async move {
                        order.lock().push(label);
                        Ok::<_, String>(())
                    })
                    .unwrap(),
            );
        }

        queue.start().unwrap();
        for handle in handles {
            assert!(handle.await.is_success());
        }

        assert_eq!(*order.lock(), vec!["high-1", "high-2", "normal", "low"]);
        queue.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_concurrency_never_exceeds_workers() {
        let queue = Arc::new(queue(3, 100));
        queue.start().unwrap();

        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();

        for _ in 0..20 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            handles.push(
                queue
                    .submit(move || async move {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok::<_, String>(())
                    })
                    .unwrap(),
            );
        }

        let sampler = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                let mut max_seen = 0;
                for _ in 0..50 {
                    max_seen = max_seen.max(queue.stats().currently_active);
                    tokio::time::sleep(Duration::from_millis(3)).await;
                }
                max_seen
            })
        };

        for handle in handles {
            assert!(handle.await.is_success());
        }
        let sampled = sampler.await.unwrap();

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(sampled <= 3, "sampled {sampled} active workers");
        assert_eq!(queue.stats().completed, 20);
        queue.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_full_queue_rejects_immediately() {
        let queue = queue(1, 2);

        let _a = queue.submit(|| async { Ok::<_, String>(()) }).unwrap();
        let _b = queue.submit(|| async { Ok::<_, String>(()) }).unwrap();
        let rejected = queue.submit(|| async { Ok::<_, String>(()) });

        assert!(matches!(
            rejected,
            Err(ResilienceError::QueueFull { capacity: 2 })
        ));
        assert_eq!(queue.stats().rejected, 1);
        assert_eq!(queue.stats().queue_size, 2);
        queue.shutdown(Duration::from_millis(10)).await;
    }

    #[tokio::test]
    async fn test_shutdown_drains_queued_work() {
        let queue = queue(2, 50);
        queue.start().unwrap();

        let handles: Vec<_> = (0..10)
            .map(|i| {
                queue
                    .submit(move || async move {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        Ok::<_, String>(i)
                    })
                    .unwrap()
            })
            .collect();

        let report = queue.shutdown(Duration::from_secs(5)).await;
        assert!(report.drained);
        assert_eq!(report.cancelled_queued, 0);

        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.await.value(), Some(&i));
        }
        assert!(matches!(
            queue.submit(|| async { Ok::<_, String>(()) }),
            Err(ResilienceError::QueueShutdown)
        ));
    }

    #[tokio::test]
    async fn test_shutdown_timeout_cancels_everything_outstanding() {
        let queue = queue(1, 50);
        queue.start().unwrap();

        let stuck = queue
            .submit(|| async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok::<_, String>(())
            })
            .unwrap();
        let waiting: Vec<_> = (0..3)
            .map(|_| queue.submit(|| async { Ok::<_, String>(()) }).unwrap())
            .collect();

        // Let the worker pick up the stuck task
        tokio::time::sleep(Duration::from_millis(20)).await;
        let report = queue.shutdown(Duration::from_millis(50)).await;

        assert!(!report.drained);
        assert_eq!(report.cancelled_in_flight, 1);
        assert_eq!(report.cancelled_queued, 3);

        let mut stuck = tokio_test::task::spawn(stuck);
        let result = assert_ready!(stuck.poll());
        assert!(result.error().is_some_and(TaskError::is_cancelled));

        for handle in waiting {
            let mut handle = tokio_test::task::spawn(handle);
            let result = assert_ready!(handle.poll());
            assert!(result.error().is_some_and(TaskError::is_cancelled));
        }

        let stats = queue.stats();
        assert_eq!(stats.cancelled, 4);
        assert_eq!(stats.currently_active, 0);
        assert_eq!(stats.queue_size, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_timeout_with_idle_and_stuck_workers() {
        let queue = queue(2, 10);
        queue.start().unwrap();

        let stuck = queue
            .submit(|| async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok::<_, String>(())
            })
            .unwrap();
        let quick: Vec<_> = (0..4)
            .map(|i| queue.submit(move || async move { Ok::<_, String>(i) }).unwrap())
            .collect();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queue.stats().currently_active, 1);

        // The idle worker exits inside the timeout; only the stuck one is aborted
        let report = queue.shutdown(Duration::from_millis(50)).await;
        assert!(!report.drained);
        assert_eq!(report.cancelled_in_flight, 1);
        assert_eq!(report.cancelled_queued, 0);

        assert!(stuck.await.error().is_some_and(TaskError::is_cancelled));
        for (i, handle) in quick.into_iter().enumerate() {
            assert_eq!(handle.await.value(), Some(&i));
        }

        let stats = queue.stats();
        assert_eq!(stats.completed, 4);
        assert_eq!(stats.cancelled, 1);
        assert_eq!(
            stats.completed + stats.failed + stats.cancelled,
            stats.total_submitted
        );
        assert_eq!(stats.currently_active, 0);
    }

    #[tokio::test]
    async fn test_handle_pending_until_started() {
        let queue = queue(1, 10);
        let mut handle = tokio_test::task::spawn(
            queue.submit(|| async { Ok::<_, String>("ran") }).unwrap(),
        );
        assert_pending!(handle.poll());

        queue.start().unwrap();
        assert_eq!(handle.await.value(), Some(&"ran"));
        assert!(queue.start().is_err());
        queue.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_shutdown_before_start_cancels_queue() {
        let queue = queue(2, 10);
        let handle = queue.submit(|| async { Ok::<_, String>(()) }).unwrap();

        let report = queue.shutdown(Duration::from_millis(10)).await;
        assert_eq!(report.cancelled_queued, 1);
        assert!(handle.await.error().is_some_and(TaskError::is_cancelled));
        assert!(matches!(queue.start(), Err(ResilienceError::QueueShutdown)));
    }

    #[test]
    fn test_config_validation() {
        assert!(WorkerPoolConfig::new(0, 10).validate().is_err());
        assert!(WorkerPoolConfig::new(1, 0).validate().is_err());
        assert!(WorkerPoolConfig::default().validate().is_ok());
        assert!(PriorityTaskQueue::new("bad", WorkerPoolConfig::new(0, 1)).is_err());
    }
}
