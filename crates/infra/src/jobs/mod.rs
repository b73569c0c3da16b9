//! Durable background jobs for long-running AI operations.
//!
//! ## Design
//!
//! - Jobs are tenant-scoped and typed
//! - The store is the only coordination point between worker processes
//! - Claiming is an atomic conditional update, so a job runs once per claim
//! - Jobs stuck IN_PROGRESS past a timeout are reset to PENDING (at-least-once)
//!
//! ## Components
//!
//! - `Job`: the durable record and its state transitions
//! - `JobStore`: persistence (in-memory or Postgres)
//! - `HandlerRegistry`: maps job types to task handlers
//! - `JobExecutor`: claims one job, runs its handler, records the outcome
//! - `status`: submission and polling boundaries

pub mod executor;
pub mod postgres;
pub mod registry;
pub mod status;
pub mod store;
pub mod types;

pub use executor::{ExecutionOutcome, HANDLER_PANIC, JobExecutor, UNKNOWN_JOB_TYPE};
pub use postgres::PostgresJobStore;
pub use registry::{HandlerError, HandlerRegistry, JobHandler, JobInput, ProgressReporter};
pub use status::{JobStatusView, job_status, submit_job};
pub use store::{InMemoryJobStore, JobStore, JobStoreError};
pub use types::{ErrorDetails, Job, JobId, JobStatus, JobType, NewJob, TransitionRejected};
