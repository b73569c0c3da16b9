//! Background worker that drives the job executor.
//!
//! One dedicated OS thread per process polls the job store, resets stuck
//! jobs and runs pending ones in creation order. Shutdown interrupts the
//! inter-tick wait and joins the thread with a bounded timeout.

pub mod job_worker;
pub mod lifecycle;
pub mod shutdown;

pub use job_worker::{
    STUCK_RESET_MESSAGE, SharedHealth, TickReport, Worker, WorkerConfig, WorkerHealth, WorkerState,
};
pub use lifecycle::{JobWorker, WorkerError};
pub use shutdown::{
    ShutdownCoordinator, ShutdownListener, ShutdownOutcome, ShutdownSignal, WorkerHandle,
    shutdown_channel,
};
