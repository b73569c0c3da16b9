//! Job executor: claims one job, runs its handler, records the outcome.

use std::panic::{self, AssertUnwindSafe};

use tracing::{debug, info, warn};

use super::registry::{HandlerRegistry, JobInput, ProgressReporter};
use super::store::{JobStore, JobStoreError};
use super::types::{ErrorDetails, JobId, JobStatus};

/// `error_type` recorded for a job whose type has no registered handler.
pub const UNKNOWN_JOB_TYPE: &str = "UnknownJobType";

/// `error_type` recorded for a handler that panicked.
pub const HANDLER_PANIC: &str = "Panic";

/// What happened to a job handed to [`JobExecutor::execute`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// Handler returned a result and it was recorded.
    Completed,
    /// Handler (or dispatch) failed and the failure was recorded.
    Failed { error_type: String },
    /// Job was not PENDING or another worker claimed it first.
    Skipped,
}

/// Runs claimed jobs against the handler registry.
///
/// Handler failures, including panics, end as a FAILED job and never escape
/// `execute`. Only store errors are returned to the caller.
pub struct JobExecutor<S: JobStore> {
    store: S,
    registry: HandlerRegistry,
}

impl<S: JobStore> JobExecutor<S> {
    pub fn new(store: S, registry: HandlerRegistry) -> Self {
        Self { store, registry }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Claim and run one job.
    pub fn execute(&self, job_id: JobId) -> Result<ExecutionOutcome, JobStoreError> {
        let job = self.store.get(job_id)?;
        if job.status != JobStatus::Pending {
            debug!(job_id = %job_id, status = %job.status, "job no longer pending; skipping");
            return Ok(ExecutionOutcome::Skipped);
        }

        if !self.store.mark_in_progress(job_id)? {
            debug!(job_id = %job_id, "job claimed by another worker; skipping");
            return Ok(ExecutionOutcome::Skipped);
        }

        let mut input = JobInput::from(&job);
        input.attempt = job.attempts + 1;

        let Some(handler) = self.registry.get(&job.job_type) else {
            let message = format!("Unknown job type: {}", job.job_type);
            warn!(job_id = %job_id, job_type = %job.job_type, "no handler registered for job type");
            let details = ErrorDetails::new(UNKNOWN_JOB_TYPE, message.clone());
            return self.record_failure(job_id, &message, details);
        };

        info!(
            job_id = %job_id,
            job_type = %job.job_type,
            tenant_id = %job.tenant_id,
            attempt = input.attempt,
            "running job"
        );

        let progress = ProgressReporter::new(&self.store, job_id);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(&input, &progress)));

        match outcome {
            Ok(Ok(result)) => {
                if self.store.complete(job_id, result)? {
                    info!(job_id = %job_id, job_type = %job.job_type, "job completed");
                    Ok(ExecutionOutcome::Completed)
                } else {
                    warn!(job_id = %job_id, "job already terminal; discarding handler result");
                    Ok(ExecutionOutcome::Skipped)
                }
            }
            Ok(Err(err)) => {
                let (message, details) = err.into_details();
                self.record_failure(job_id, &message, details)
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                let details = ErrorDetails::new(HANDLER_PANIC, message.clone())
                    .with_trace(format!("handler for {} panicked: {message}", job.job_type));
                self.record_failure(job_id, &message, details)
            }
        }
    }

    fn record_failure(
        &self,
        job_id: JobId,
        message: &str,
        details: ErrorDetails,
    ) -> Result<ExecutionOutcome, JobStoreError> {
        let error_type = details.error_type.clone();
        if self.store.fail(job_id, message, details)? {
            warn!(job_id = %job_id, error_type = %error_type, error = %message, "job failed");
            Ok(ExecutionOutcome::Failed { error_type })
        } else {
            warn!(job_id = %job_id, "job already terminal; discarding handler failure");
            Ok(ExecutionOutcome::Skipped)
        }
    }
}

impl<S: JobStore> std::fmt::Debug for JobExecutor<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobExecutor")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}
