//! Polling loop that recovers stuck jobs and feeds pending ones to the executor.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, mpsc};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::jobs::{ExecutionOutcome, JobExecutor, JobStore};

use super::shutdown::{ShutdownListener, WorkerHandle, shutdown_channel};

/// Progress message written on a job that stuck recovery put back in the queue.
pub const STUCK_RESET_MESSAGE: &str = "Reset after exceeding stuck timeout; waiting to be retried";

/// Worker loop configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Name for logging and the thread name
    pub name: String,
    /// Sleep between ticks
    pub poll_interval: Duration,
    /// Maximum pending jobs handled per tick
    pub batch_size: usize,
    /// IN_PROGRESS jobs older than this are presumed abandoned
    pub stuck_timeout: Duration,
    /// Bounded wait for the loop to exit on stop
    pub shutdown_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "job-worker".to_string(),
            poll_interval: Duration::from_secs(5),
            batch_size: 10,
            stuck_timeout: Duration::from_secs(60 * 60),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_stuck_timeout(mut self, stuck_timeout: Duration) -> Self {
        self.stuck_timeout = stuck_timeout;
        self
    }

    pub fn with_shutdown_timeout(mut self, shutdown_timeout: Duration) -> Self {
        self.shutdown_timeout = shutdown_timeout;
        self
    }
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub recovered: usize,
    pub claimed: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub errors: usize,
    pub last_error: Option<String>,
}

impl TickReport {
    fn record_error(&mut self, error: String) {
        self.errors += 1;
        self.last_error = Some(error);
    }
}

/// Lifecycle state of the worker as seen by health checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    #[default]
    NotStarted,
    Running,
    Stopping,
    Stopped,
    /// The loop thread could not be spawned; no jobs will run.
    FailedToStart,
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerHealth {
    pub state: WorkerState,
    pub ticks: u64,
    pub last_tick_at: Option<DateTime<Utc>>,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub jobs_recovered: u64,
    pub tick_errors: u64,
    pub last_error: Option<String>,
}

impl WorkerHealth {
    pub fn is_healthy(&self) -> bool {
        self.state == WorkerState::Running
    }
}

/// Health shared between the loop thread and its owner.
pub type SharedHealth = Arc<Mutex<WorkerHealth>>;

pub(crate) fn lock_health(health: &SharedHealth) -> MutexGuard<'_, WorkerHealth> {
    health.lock().unwrap_or_else(|e| e.into_inner())
}

/// Background job worker.
///
/// Each tick first resets stuck jobs to PENDING, then hands up to
/// `batch_size` pending jobs, oldest first, to the executor. Handlers run on
/// the worker's own thread, one at a time.
pub struct Worker<S: JobStore> {
    executor: Arc<JobExecutor<S>>,
    config: WorkerConfig,
    health: SharedHealth,
}

impl<S: JobStore + 'static> Worker<S> {
    pub fn new(executor: Arc<JobExecutor<S>>, config: WorkerConfig) -> Self {
        Self::with_health(executor, config, SharedHealth::default())
    }

    pub fn with_health(
        executor: Arc<JobExecutor<S>>,
        config: WorkerConfig,
        health: SharedHealth,
    ) -> Self {
        Self {
            executor,
            config,
            health,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn health(&self) -> WorkerHealth {
        lock_health(&self.health).clone()
    }

    /// Run one recovery sweep plus one discovery pass.
    pub fn tick(&self) -> TickReport {
        self.run_tick(|| false)
    }

    fn run_tick(&self, should_stop: impl Fn() -> bool) -> TickReport {
        let mut report = TickReport::default();
        self.recover_stuck(&mut report);
        self.process_pending(&mut report, should_stop);
        self.record(&report);
        report
    }

    fn recover_stuck(&self, report: &mut TickReport) {
        let store = self.executor.store();
        let stuck = match store.list_stuck(self.config.stuck_timeout) {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(worker = %self.config.name, error = %e, "failed to list stuck jobs");
                report.record_error(e.to_string());
                return;
            }
        };

        for job in stuck {
            match store.reset_stuck(job.id, STUCK_RESET_MESSAGE) {
                Ok(true) => {
                    warn!(
                        worker = %self.config.name,
                        job_id = %job.id,
                        job_type = %job.job_type,
                        claimed_since = ?job.claimed_since(),
                        "reset stuck job to pending"
                    );
                    report.recovered += 1;
                }
                Ok(false) => {
                    debug!(job_id = %job.id, "stuck job finished before reset");
                }
                Err(e) => {
                    error!(job_id = %job.id, error = %e, "failed to reset stuck job");
                    report.record_error(e.to_string());
                }
            }
        }
    }

    fn process_pending(&self, report: &mut TickReport, should_stop: impl Fn() -> bool) {
        let candidates = match self.executor.store().list_claimable(self.config.batch_size) {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(worker = %self.config.name, error = %e, "failed to list pending jobs");
                report.record_error(e.to_string());
                return;
            }
        };

        for job in candidates {
            if should_stop() {
                debug!(worker = %self.config.name, "shutdown requested; leaving remaining jobs pending");
                break;
            }
            match self.executor.execute(job.id) {
                Ok(ExecutionOutcome::Completed) => {
                    report.claimed += 1;
                    report.completed += 1;
                }
                Ok(ExecutionOutcome::Failed { .. }) => {
                    report.claimed += 1;
                    report.failed += 1;
                }
                Ok(ExecutionOutcome::Skipped) => report.skipped += 1,
                Err(e) => {
                    error!(job_id = %job.id, error = %e, "job execution aborted by store error");
                    report.record_error(e.to_string());
                }
            }
        }
    }

    fn record(&self, report: &TickReport) {
        let mut health = lock_health(&self.health);
        health.ticks += 1;
        health.last_tick_at = Some(Utc::now());
        health.jobs_completed += report.completed as u64;
        health.jobs_failed += report.failed as u64;
        health.jobs_recovered += report.recovered as u64;
        health.tick_errors += report.errors as u64;
        if report.last_error.is_some() {
            health.last_error = report.last_error.clone();
        }
    }

    /// Spawn the worker loop on a dedicated thread.
    ///
    /// A spawn failure is recorded in the shared health as `FailedToStart`
    /// before being returned.
    pub fn spawn(self) -> std::io::Result<WorkerHandle> {
        let (signal, listener) = shutdown_channel();
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let name = self.config.name.clone();
        let health = self.health.clone();

        lock_health(&health).state = WorkerState::Running;
        let spawned = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                self.run_loop(&listener);
                let _ = done_tx.send(());
            });

        match spawned {
            Ok(join) => Ok(WorkerHandle::new(name, signal, done_rx, join)),
            Err(e) => {
                error!(worker = %name, error = %e, "failed to spawn job worker thread");
                let mut h = lock_health(&health);
                h.state = WorkerState::FailedToStart;
                h.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    fn run_loop(&self, listener: &ShutdownListener) {
        info!(
            worker = %self.config.name,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "job worker started"
        );

        while !listener.is_triggered() {
            let tick = panic::catch_unwind(AssertUnwindSafe(|| {
                self.run_tick(|| listener.is_triggered())
            }));
            match tick {
                Ok(report) if report != TickReport::default() => {
                    debug!(worker = %self.config.name, report = ?report, "tick finished");
                }
                Ok(_) => {}
                Err(_) => {
                    error!(worker = %self.config.name, "tick panicked; continuing after sleep");
                    let mut h = lock_health(&self.health);
                    h.tick_errors += 1;
                    h.last_error = Some("tick panicked".to_string());
                }
            }

            if listener.wait(self.config.poll_interval) {
                break;
            }
        }

        lock_health(&self.health).state = WorkerState::Stopped;
        info!(worker = %self.config.name, "job worker loop exited");
    }
}
