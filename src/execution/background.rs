//! # Background Task Manager
//!
//! Supervises fire-and-forget and periodic operations that run independently
//! of the priority queue (cache refreshes, cleanup sweeps, heartbeat pings).
//!
//! Every task is tracked from creation until it reaches a terminal status.
//! Tracking is released by a drop guard living inside the spawned future, so
//! the entry disappears on success, failure, panic and abort alike without the
//! caller polling anything.
//!
//! Periodic loops isolate failures: an iteration that errors or panics is
//! logged, counted and recorded as `last_error`, and the loop keeps ticking.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{ConfigResult, ConfigurationError};
use crate::error::{ResilienceError, Result};
use crate::execution::catch_panic;
use crate::logging::log_task_event;
use crate::resilience::config::duration_millis;

/// Background manager configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackgroundConfig {
    /// Default grace period used by [`BackgroundTaskManager::shutdown_default`]
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl BackgroundConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.shutdown_timeout.is_zero() {
            return Err(ConfigurationError::invalid_value(
                "background.shutdown_timeout",
                "0ms",
                "must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// Lifecycle status of a background task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackgroundTaskStatus {
    Running,
    /// Finished normally, or a periodic loop stopped by shutdown
    Completed,
    /// A one-shot task returned an error or panicked
    Failed,
    /// Aborted by [`BackgroundHandle::cancel`] or a shutdown timeout
    Cancelled,
}

impl BackgroundTaskStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, BackgroundTaskStatus::Running)
    }

    fn as_str(&self) -> &'static str {
        match self {
            BackgroundTaskStatus::Running => "running",
            BackgroundTaskStatus::Completed => "completed",
            BackgroundTaskStatus::Failed => "failed",
            BackgroundTaskStatus::Cancelled => "cancelled",
        }
    }
}

/// Work run on a fixed interval by [`BackgroundTaskManager::create_periodic_job`]
#[async_trait]
pub trait PeriodicJob: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn run(&self) -> anyhow::Result<()>;
}

/// Serializable snapshot of a tracked task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackgroundTaskInfo {
    pub id: Uuid,
    pub name: String,
    pub status: BackgroundTaskStatus,
    pub created_at: DateTime<Utc>,
    pub interval_ms: Option<u64>,
    pub iterations: u64,
    pub failures: u64,
    pub last_error: Option<String>,
}

#[derive(Debug)]
struct TaskState {
    id: Uuid,
    name: String,
    created_at: DateTime<Utc>,
    interval: Option<Duration>,
    status: watch::Sender<BackgroundTaskStatus>,
    iterations: AtomicU64,
    failures: AtomicU64,
    last_error: Mutex<Option<String>>,
    abort: Mutex<Option<AbortHandle>>,
}

impl TaskState {
    fn record_failure(&self, message: String) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        *self.last_error.lock() = Some(message);
    }
}

/// Handle to a tracked background task. Cheap to clone.
#[derive(Debug, Clone)]
pub struct BackgroundHandle {
    state: Arc<TaskState>,
}

impl BackgroundHandle {
    pub fn id(&self) -> Uuid {
        self.state.id
    }

    pub fn name(&self) -> &str {
        &self.state.name
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.state.created_at
    }

    pub fn status(&self) -> BackgroundTaskStatus {
        *self.state.status.borrow()
    }

    pub fn is_finished(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn is_periodic(&self) -> bool {
        self.state.interval.is_some()
    }

    /// Completed runs of the operation, successful or not
    pub fn iterations(&self) -> u64 {
        self.state.iterations.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.state.failures.load(Ordering::Relaxed)
    }

    /// Message of the most recent failed run
    pub fn last_error(&self) -> Option<String> {
        self.state.last_error.lock().clone()
    }

    /// Wait until the task reaches a terminal status
    pub async fn wait(&self) -> BackgroundTaskStatus {
        let mut status = self.state.status.subscribe();
        let terminal = match status.wait_for(BackgroundTaskStatus::is_terminal).await {
            Ok(current) => *current,
            Err(_) => self.status(),
        };
        terminal
    }

    /// Abort this task. The status becomes `Cancelled` unless it already finished.
    pub fn cancel(&self) {
        if let Some(abort) = self.state.abort.lock().as_ref() {
            abort.abort();
        }
    }

    pub fn info(&self) -> BackgroundTaskInfo {
        BackgroundTaskInfo {
            id: self.id(),
            name: self.state.name.clone(),
            status: self.status(),
            created_at: self.state.created_at,
            interval_ms: self.state.interval.map(|i| i.as_millis() as u64),
            iterations: self.iterations(),
            failures: self.failures(),
            last_error: self.last_error(),
        }
    }
}

type TaskMap = DashMap<Uuid, BackgroundHandle>;

/// Removes the tracking entry and publishes the terminal status on drop
struct TrackingGuard {
    tasks: Arc<TaskMap>,
    state: Arc<TaskState>,
    outcome: BackgroundTaskStatus,
}

impl TrackingGuard {
    fn finish(&mut self, outcome: BackgroundTaskStatus) {
        self.outcome = outcome;
    }
}

impl Drop for TrackingGuard {
    fn drop(&mut self) {
        self.tasks.remove(&self.state.id);
        let outcome = self.outcome;
        self.state.status.send_modify(|status| {
            if !status.is_terminal() {
                *status = outcome;
            }
        });
        log_task_event(
            "background_finished",
            &self.state.name,
            outcome.as_str(),
            self.state.last_error.lock().as_deref(),
        );
    }
}

/// Result of [`BackgroundTaskManager::shutdown`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackgroundShutdownReport {
    /// Tasks tracked when shutdown began
    pub tracked: usize,
    /// Tasks still running at the timeout and aborted
    pub aborted: usize,
}

impl BackgroundShutdownReport {
    pub fn graceful(&self) -> bool {
        self.aborted == 0
    }
}

/// Supervisor for independent background work
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
/// use taskguard::execution::{BackgroundConfig, BackgroundTaskManager};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let manager = BackgroundTaskManager::new(BackgroundConfig::default())?;
///
///     let refresh = manager.create_periodic_task(
///         "refresh_trends",
///         || async { anyhow::Ok(()) },
///         Duration::from_secs(60),
///     )?;
///
///     manager.shutdown(Duration::from_secs(5)).await;
///     assert!(refresh.is_finished());
///     Ok(())
/// }
/// ```
#[derive(Debug)]
pub struct BackgroundTaskManager {
    config: BackgroundConfig,
    tasks: Arc<TaskMap>,
    /// Creation holds the read side; shutdown flips it under the write side
    accepting: RwLock<bool>,
    stop: watch::Sender<bool>,
}

impl BackgroundTaskManager {
    pub fn new(config: BackgroundConfig) -> Result<Self> {
        config.validate()?;
        let (stop, _) = watch::channel(false);

        Ok(Self {
            config,
            tasks: Arc::new(DashMap::new()),
            accepting: RwLock::new(true),
            stop,
        })
    }

    pub fn config(&self) -> &BackgroundConfig {
        &self.config
    }

    /// Launch a one-shot task
    pub fn create_task<Fut>(&self, name: impl Into<String>, operation: Fut) -> Result<BackgroundHandle>
    where
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.spawn_tracked(name.into(), None, move |mut guard, _stop| async move {
            let outcome = match catch_panic(operation).await {
                Ok(Ok(())) => BackgroundTaskStatus::Completed,
                Ok(Err(error)) => {
                    warn!(task = %guard.state.name, error = %error, "Background task failed");
                    guard.state.record_failure(format!("{error:#}"));
                    BackgroundTaskStatus::Failed
                }
                Err(panic) => {
                    warn!(task = %guard.state.name, panic = %panic, "Background task panicked");
                    guard.state.record_failure(format!("panicked: {panic}"));
                    BackgroundTaskStatus::Failed
                }
            };
            guard.state.iterations.fetch_add(1, Ordering::Relaxed);
            guard.finish(outcome);
        })
    }

    /// Run `operation` immediately and then every `interval` until shutdown or cancel
    pub fn create_periodic_task<F, Fut>(
        &self,
        name: impl Into<String>,
        operation: F,
        interval: Duration,
    ) -> Result<BackgroundHandle>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if interval.is_zero() {
            return Err(ResilienceError::Configuration(
                "periodic task interval must be greater than 0".to_string(),
            ));
        }

        self.spawn_tracked(name.into(), Some(interval), move |mut guard, mut stop| async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = async { stop.wait_for(|stopping| *stopping).await.is_ok() } => break,
                    _ = ticker.tick() => {}
                }

                let iteration = guard.state.iterations.load(Ordering::Relaxed) + 1;
                match catch_panic(operation()).await {
                    Ok(Ok(())) => {
                        debug!(task = %guard.state.name, iteration, "Periodic iteration completed");
                    }
                    Ok(Err(error)) => {
                        warn!(
                            task = %guard.state.name,
                            iteration,
                            error = %error,
                            "Periodic iteration failed, continuing"
                        );
                        guard.state.record_failure(format!("{error:#}"));
                    }
                    Err(panic) => {
                        warn!(
                            task = %guard.state.name,
                            iteration,
                            panic = %panic,
                            "Periodic iteration panicked, continuing"
                        );
                        guard.state.record_failure(format!("panicked: {panic}"));
                    }
                }
                guard.state.iterations.fetch_add(1, Ordering::Relaxed);
            }

            guard.finish(BackgroundTaskStatus::Completed);
        })
    }

    /// Schedule a [`PeriodicJob`] on `interval`, named after the job
    pub fn create_periodic_job<J>(&self, job: Arc<J>, interval: Duration) -> Result<BackgroundHandle>
    where
        J: PeriodicJob,
    {
        let name = job.name().to_string();
        self.create_periodic_task(
            name,
            move || {
                let job = Arc::clone(&job);
                async move { job.run().await }
            },
            interval,
        )
    }

    /// Handles of tasks that have not finished yet
    pub fn get_active_tasks(&self) -> Vec<BackgroundHandle> {
        self.tasks
            .iter()
            .map(|entry| entry.value().clone())
            .filter(|handle| !handle.is_finished())
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_accepting(&self) -> bool {
        *self.accepting.read()
    }

    /// [`shutdown`](Self::shutdown) with the configured timeout
    pub async fn shutdown_default(&self) -> BackgroundShutdownReport {
        self.shutdown(self.config.shutdown_timeout).await
    }

    /// Stop periodic loops, give everything `timeout` to finish, then abort the rest.
    ///
    /// Every handle tracked when this is called is terminal when it returns.
    pub async fn shutdown(&self, timeout: Duration) -> BackgroundShutdownReport {
        *self.accepting.write() = false;
        self.stop.send_replace(true);

        let handles: Vec<BackgroundHandle> = self
            .tasks
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        let tracked = handles.len();

        info!(
            tracked,
            timeout_ms = timeout.as_millis() as u64,
            "Shutting down background task manager"
        );

        let graceful = tokio::time::timeout(timeout, join_all(handles.iter().map(|h| h.wait())))
            .await
            .is_ok();

        let mut aborted = 0;
        if !graceful {
            for handle in handles.iter().filter(|h| !h.is_finished()) {
                warn!(task = %handle.name(), id = %handle.id(), "Aborting background task after shutdown timeout");
                handle.cancel();
                aborted += 1;
            }
            join_all(handles.iter().map(|h| h.wait())).await;
        }

        info!(tracked, aborted, "Background task manager shut down");
        BackgroundShutdownReport { tracked, aborted }
    }

    fn spawn_tracked<B, Fut>(
        &self,
        name: String,
        interval: Option<Duration>,
        body: B,
    ) -> Result<BackgroundHandle>
    where
        B: FnOnce(TrackingGuard, watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let accepting = self.accepting.read();
        if !*accepting {
            return Err(ResilienceError::ManagerShutdown);
        }

        let (status, _) = watch::channel(BackgroundTaskStatus::Running);
        let state = Arc::new(TaskState {
            id: Uuid::new_v4(),
            name,
            created_at: Utc::now(),
            interval,
            status,
            iterations: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            last_error: Mutex::new(None),
            abort: Mutex::new(None),
        });
        let handle = BackgroundHandle {
            state: Arc::clone(&state),
        };

        // Tracked before spawn so a fast task cannot finish before it is registered
        self.tasks.insert(state.id, handle.clone());

        let guard = TrackingGuard {
            tasks: Arc::clone(&self.tasks),
            state: Arc::clone(&state),
            // Outcome if the future is dropped before finishing
            outcome: BackgroundTaskStatus::Cancelled,
        };
        let task = tokio::spawn(body(guard, self.stop.subscribe()));
        *state.abort.lock() = Some(task.abort_handle());
        drop(accepting);

        log_task_event(
            "background_created",
            &state.name,
            BackgroundTaskStatus::Running.as_str(),
            interval
                .map(|i| format!("periodic every {}ms", i.as_millis()))
                .as_deref(),
        );

        Ok(handle)
    }
}

impl Drop for BackgroundTaskManager {
    fn drop(&mut self) {
        self.stop.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn manager() -> BackgroundTaskManager {
        BackgroundTaskManager::new(BackgroundConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_one_shot_task_is_untracked_on_completion() {
        let manager = manager();
        let handle = manager
            .create_task("warm_cache", async { anyhow::Ok(()) })
            .unwrap();

        assert_eq!(handle.wait().await, BackgroundTaskStatus::Completed);
        assert_eq!(handle.iterations(), 1);
        assert!(manager.get_active_tasks().is_empty());
        assert_eq!(manager.active_count(), 0);
    }

    #[tokio::test]
    async fn test_one_shot_failure_is_recorded() {
        let manager = manager();
        let failed = manager
            .create_task("sync", async { Err::<(), _>(anyhow::anyhow!("storage unavailable")) })
            .unwrap();
        let panicked = manager
            .create_task("explode", async {
                panic!("bad state");
                #[allow(unreachable_code)]
                anyhow::Ok(())
            })
            .unwrap();

        assert_eq!(failed.wait().await, BackgroundTaskStatus::Failed);
        assert_eq!(failed.last_error().as_deref(), Some("storage unavailable"));
        assert_eq!(panicked.wait().await, BackgroundTaskStatus::Failed);
        assert_eq!(panicked.last_error().as_deref(), Some("panicked: bad state"));
        assert_eq!(manager.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_task_survives_failed_iteration() {
        let manager = manager();
        let calls = Arc::new(AtomicU32::new(0));

        let handle = manager
            .create_periodic_task(
                "cleanup",
                {
                    let calls = Arc::clone(&calls);
                    move || {
                        let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                        async move {
                            if n == 2 {
                                anyhow::bail!("transient cleanup failure");
                            }
                            if n == 3 {
                                panic!("cleanup panicked");
                            }
                            anyhow::Ok(())
                        }
                    }
                },
                Duration::from_secs(10),
            )
            .unwrap();

        // Immediate run plus four intervals
        tokio::time::sleep(Duration::from_secs(41)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(handle.iterations(), 5);
        assert_eq!(handle.failures(), 2);
        assert_eq!(handle.last_error().as_deref(), Some("panicked: cleanup panicked"));
        assert_eq!(handle.status(), BackgroundTaskStatus::Running);
        assert_eq!(manager.get_active_tasks().len(), 1);

        let report = manager.shutdown(Duration::from_secs(1)).await;
        assert!(report.graceful());
        assert_eq!(handle.status(), BackgroundTaskStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_aborts_stragglers() {
        let manager = manager();
        let stuck = manager
            .create_task("stuck", async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                anyhow::Ok(())
            })
            .unwrap();
        let quick = manager
            .create_task("quick", async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                anyhow::Ok(())
            })
            .unwrap();
        let periodic = manager
            .create_periodic_task("tick", || async { anyhow::Ok(()) }, Duration::from_secs(1))
            .unwrap();

        let report = manager.shutdown(Duration::from_secs(5)).await;

        assert_eq!(report.tracked, 3);
        assert_eq!(report.aborted, 1);
        assert_eq!(stuck.status(), BackgroundTaskStatus::Cancelled);
        assert_eq!(quick.status(), BackgroundTaskStatus::Completed);
        assert_eq!(periodic.status(), BackgroundTaskStatus::Completed);
        assert!(manager.get_active_tasks().is_empty());
    }

    #[tokio::test]
    async fn test_creation_after_shutdown_is_refused() {
        let manager = manager();
        manager.shutdown(Duration::from_millis(10)).await;

        assert!(matches!(
            manager.create_task("late", async { anyhow::Ok(()) }),
            Err(ResilienceError::ManagerShutdown)
        ));
        assert!(!manager.is_accepting());
    }

    #[tokio::test]
    async fn test_cancel_single_task() {
        let manager = manager();
        let handle = manager
            .create_task("long", async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                anyhow::Ok(())
            })
            .unwrap();

        handle.cancel();
        assert_eq!(handle.wait().await, BackgroundTaskStatus::Cancelled);
        assert_eq!(manager.active_count(), 0);
    }

    struct Heartbeat {
        beats: AtomicU32,
    }

    #[async_trait]
    impl PeriodicJob for Heartbeat {
        fn name(&self) -> &str {
            "heartbeat"
        }

        async fn run(&self) -> anyhow::Result<()> {
            self.beats.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_job_trait() {
        let manager = manager();
        let job = Arc::new(Heartbeat {
            beats: AtomicU32::new(0),
        });

        let handle = manager
            .create_periodic_job(Arc::clone(&job), Duration::from_secs(5))
            .unwrap();
        assert_eq!(handle.name(), "heartbeat");
        assert!(handle.is_periodic());

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(job.beats.load(Ordering::SeqCst), 3);

        let info = handle.info();
        assert_eq!(info.interval_ms, Some(5000));
        assert_eq!(info.failures, 0);

        manager.shutdown(Duration::from_secs(1)).await;
    }

    #[test]
    fn test_zero_interval_is_rejected() {
        let manager = manager();
        assert!(manager
            .create_periodic_task("bad", || async { anyhow::Ok(()) }, Duration::ZERO)
            .is_err());
        assert!(BackgroundConfig {
            shutdown_timeout: Duration::ZERO
        }
        .validate()
        .is_err());
    }
}
