//! Process-level controls for the job worker.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use crate::config::JobsConfig;
use crate::jobs::{HandlerRegistry, JobExecutor, JobStore};

use super::job_worker::{SharedHealth, Worker, WorkerConfig, WorkerHealth, WorkerState, lock_health};
use super::shutdown::{ShutdownCoordinator, ShutdownOutcome, ShutdownSignal};

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("job worker is already running")]
    AlreadyRunning,

    #[error("failed to spawn job worker thread: {0}")]
    Spawn(String),
}

/// Owned job worker held by the hosting process.
///
/// At most one loop runs per `JobWorker`. Dropping it requests shutdown
/// without waiting; call [`JobWorker::stop_worker`] for a bounded join.
pub struct JobWorker<S: JobStore + 'static> {
    executor: Arc<JobExecutor<S>>,
    config: WorkerConfig,
    health: SharedHealth,
    coordinator: Option<ShutdownCoordinator>,
}

impl<S: JobStore + 'static> JobWorker<S> {
    pub fn new(store: S, registry: HandlerRegistry, config: WorkerConfig) -> Self {
        Self {
            executor: Arc::new(JobExecutor::new(store, registry)),
            config,
            health: SharedHealth::default(),
            coordinator: None,
        }
    }

    pub fn from_config(store: S, registry: HandlerRegistry, config: &JobsConfig) -> Self {
        Self::new(store, registry, config.worker_config())
    }

    /// Executor for running a job synchronously outside the loop.
    pub fn executor(&self) -> &Arc<JobExecutor<S>> {
        &self.executor
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.coordinator.as_ref().is_some_and(ShutdownCoordinator::is_running)
    }

    pub fn health(&self) -> WorkerHealth {
        lock_health(&self.health).clone()
    }

    /// Start the background loop polling every `poll_interval`.
    pub fn start_worker(&mut self, poll_interval: Duration) -> Result<(), WorkerError> {
        if self.is_running() {
            return Err(WorkerError::AlreadyRunning);
        }

        self.config.poll_interval = poll_interval;
        // Fresh health per run so a detached thread from a forced stop cannot
        // overwrite the new run's state.
        self.health = SharedHealth::default();

        let worker = Worker::with_health(self.executor.clone(), self.config.clone(), self.health.clone());
        match worker.spawn() {
            Ok(handle) => {
                info!(
                    worker = %self.config.name,
                    poll_interval_ms = poll_interval.as_millis() as u64,
                    "job worker started"
                );
                self.coordinator = Some(ShutdownCoordinator::new(handle, self.config.shutdown_timeout));
                Ok(())
            }
            Err(e) => {
                error!(worker = %self.config.name, error = %e, "job worker failed to start");
                Err(WorkerError::Spawn(e.to_string()))
            }
        }
    }

    /// Stop the loop, waiting at most the configured shutdown timeout.
    ///
    /// After a forced stop the detached loop may still be running a handler;
    /// health stays `Stopping` until the loop itself exits.
    pub fn stop_worker(&mut self) -> ShutdownOutcome {
        let Some(mut coordinator) = self.coordinator.take() else {
            return ShutdownOutcome::NotRunning;
        };

        lock_health(&self.health).state = WorkerState::Stopping;
        let outcome = coordinator.stop();
        if outcome == ShutdownOutcome::Graceful {
            lock_health(&self.health).state = WorkerState::Stopped;
        }
        outcome
    }

    /// Hook SIGINT/SIGTERM to stop the running loop. See
    /// [`ShutdownCoordinator::install_signal_handlers`].
    pub fn install_signal_handlers(&self) -> bool {
        self.coordinator
            .as_ref()
            .is_some_and(ShutdownCoordinator::install_signal_handlers)
    }

    pub fn shutdown_signal(&self) -> Option<ShutdownSignal> {
        self.coordinator.as_ref().and_then(ShutdownCoordinator::signal)
    }
}

impl<S: JobStore + 'static> Drop for JobWorker<S> {
    fn drop(&mut self) {
        if let Some(signal) = self.shutdown_signal() {
            signal.trigger();
        }
    }
}
