//! Shutdown plumbing for the job worker thread.
//!
//! A [`ShutdownSignal`] flips a shared flag and wakes the worker out of its
//! inter-tick wait. [`ShutdownCoordinator`] owns the running worker, hooks
//! termination signals when an async runtime is available, and performs a
//! bounded join on stop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

use tracing::{info, warn};

/// Create a connected signal/listener pair.
pub fn shutdown_channel() -> (ShutdownSignal, ShutdownListener) {
    let requested = Arc::new(AtomicBool::new(false));
    let (wake_tx, wake_rx) = mpsc::channel();
    (
        ShutdownSignal {
            requested: requested.clone(),
            wake: wake_tx,
        },
        ShutdownListener {
            requested,
            wake: wake_rx,
        },
    )
}

/// Cloneable trigger that asks the worker loop to stop.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    requested: Arc<AtomicBool>,
    wake: mpsc::Sender<()>,
}

impl ShutdownSignal {
    pub fn trigger(&self) {
        self.requested.store(true, Ordering::SeqCst);
        // The receiver is gone once the worker has exited; nothing to wake.
        let _ = self.wake.send(());
    }

    pub fn is_triggered(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

/// Worker-side half of the shutdown channel.
#[derive(Debug)]
pub struct ShutdownListener {
    requested: Arc<AtomicBool>,
    wake: mpsc::Receiver<()>,
}

impl ShutdownListener {
    pub fn is_triggered(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Sleep for up to `timeout`, returning early with `true` if shutdown is
    /// requested. Dropping every signal also counts as a shutdown request.
    pub fn wait(&self, timeout: Duration) -> bool {
        if self.is_triggered() {
            return true;
        }
        match self.wake.recv_timeout(timeout) {
            Ok(()) => true,
            Err(mpsc::RecvTimeoutError::Timeout) => self.is_triggered(),
            Err(mpsc::RecvTimeoutError::Disconnected) => true,
        }
    }
}

/// How a stop request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// The loop finished its current work and exited within the timeout.
    Graceful,
    /// The loop did not exit in time; its thread was detached.
    Forced,
    /// There was no running worker.
    NotRunning,
}

/// Handle to a spawned worker thread.
#[derive(Debug)]
pub struct WorkerHandle {
    name: String,
    signal: ShutdownSignal,
    done: mpsc::Receiver<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    pub(crate) fn new(
        name: String,
        signal: ShutdownSignal,
        done: mpsc::Receiver<()>,
        join: thread::JoinHandle<()>,
    ) -> Self {
        Self {
            name,
            signal,
            done,
            join: Some(join),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn signal(&self) -> ShutdownSignal {
        self.signal.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(|j| j.is_finished())
    }

    /// Request shutdown and wait up to `timeout` for the loop to exit.
    pub fn stop(mut self, timeout: Duration) -> ShutdownOutcome {
        self.signal.trigger();

        let exited = match self.done.recv_timeout(timeout) {
            Ok(()) => true,
            // The thread dropped its sender without reporting: it is gone.
            Err(mpsc::RecvTimeoutError::Disconnected) => true,
            Err(mpsc::RecvTimeoutError::Timeout) => false,
        };

        if !exited {
            warn!(
                worker = %self.name,
                timeout_ms = timeout.as_millis() as u64,
                "job worker did not stop in time; detaching thread"
            );
            // Dropping the JoinHandle detaches the thread.
            self.join.take();
            return ShutdownOutcome::Forced;
        }

        if let Some(j) = self.join.take() {
            if j.join().is_err() {
                warn!(worker = %self.name, "job worker thread panicked during shutdown");
                return ShutdownOutcome::Forced;
            }
        }
        info!(worker = %self.name, "job worker stopped gracefully");
        ShutdownOutcome::Graceful
    }
}

/// Owns a running worker and coordinates its shutdown.
#[derive(Debug)]
pub struct ShutdownCoordinator {
    handle: Option<WorkerHandle>,
    join_timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(handle: WorkerHandle, join_timeout: Duration) -> Self {
        Self {
            handle: Some(handle),
            join_timeout,
        }
    }

    pub fn signal(&self) -> Option<ShutdownSignal> {
        self.handle.as_ref().map(WorkerHandle::signal)
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the worker when the process receives SIGINT/SIGTERM (Ctrl-C on
    /// non-unix platforms).
    ///
    /// Needs a tokio runtime on the calling thread. Without one this logs and
    /// returns `false`; the worker keeps running and relies on forceful
    /// termination plus stuck-job recovery instead.
    pub fn install_signal_handlers(&self) -> bool {
        self.stop_on(wait_for_termination())
    }

    /// Trigger shutdown once `termination` resolves to `true`.
    ///
    /// The future is spawned on the current tokio runtime; returns `false`
    /// when there is no runtime or no running worker.
    pub fn stop_on<F>(&self, termination: F) -> bool
    where
        F: Future<Output = bool> + Send + 'static,
    {
        let Some(signal) = self.signal() else {
            warn!("no running job worker; termination signals not hooked");
            return false;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("no async runtime available; termination signals will not stop the job worker gracefully");
            return false;
        };

        runtime.spawn(async move {
            if termination.await {
                signal.trigger();
            }
        });
        true
    }

    /// Flip the running flag, interrupt the sleep and join with a bounded wait.
    pub fn stop(&mut self) -> ShutdownOutcome {
        match self.handle.take() {
            Some(handle) => {
                info!(worker = %handle.name(), "stopping job worker");
                handle.stop(self.join_timeout)
            }
            None => ShutdownOutcome::NotRunning,
        }
    }
}

/// Resolves with `true` once a termination signal arrives, or `false` if no
/// signal source could be installed.
async fn wait_for_termination() -> bool {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let sigterm = signal(SignalKind::terminate());
        let sigint = signal(SignalKind::interrupt());
        match (sigterm, sigint) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigint.recv() => info!(signal = "SIGINT", "shutdown signal"),
                    _ = sigterm.recv() => info!(signal = "SIGTERM", "shutdown signal"),
                }
                true
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!(error = %e, "failed to install termination signal handlers");
                false
            }
        }
    }

    #[cfg(not(unix))]
    {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("shutdown signal");
                true
            }
            Err(e) => {
                warn!(error = %e, "failed to install Ctrl+C handler");
                false
            }
        }
    }
}
