//! Handler registry and the contract handlers are written against.

use std::collections::HashMap;
use std::fmt;

use tracing::warn;

use jobrunner_core::{SubjectId, TenantId, UserId};

use super::store::{JobStore, JobStoreError};
use super::types::{ErrorDetails, Job, JobId, JobType};

/// Job handler function type.
///
/// Handlers must be idempotent: a job reset by stuck recovery runs again.
pub type JobHandler =
    Box<dyn Fn(&JobInput, &ProgressReporter<'_>) -> Result<serde_json::Value, HandlerError> + Send + Sync>;

/// Identifying fields a handler receives. Handlers load their own domain data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobInput {
    pub job_id: JobId,
    pub job_type: JobType,
    pub tenant_id: TenantId,
    pub subject_id: Option<SubjectId>,
    pub requester_id: UserId,
    /// 1 on the first run, higher after stuck recovery.
    pub attempt: u32,
}

impl From<&Job> for JobInput {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id,
            job_type: job.job_type.clone(),
            tenant_id: job.tenant_id,
            subject_id: job.subject_id,
            requester_id: job.requester_id,
            attempt: job.attempts,
        }
    }
}

/// Progress callback handed to a running handler.
///
/// Every call is its own durable write, visible to pollers immediately.
pub struct ProgressReporter<'a> {
    store: &'a dyn JobStore,
    job_id: JobId,
}

impl<'a> ProgressReporter<'a> {
    pub fn new(store: &'a dyn JobStore, job_id: JobId) -> Self {
        Self { store, job_id }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Record a message with a completion percentage (0-100).
    pub fn report(&self, message: &str, percent: u8) -> Result<(), JobStoreError> {
        self.store.update_progress(self.job_id, message, Some(percent))
    }

    /// Record a message without touching the percentage.
    pub fn message(&self, message: &str) -> Result<(), JobStoreError> {
        self.store.update_progress(self.job_id, message, None)
    }
}

impl fmt::Debug for ProgressReporter<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("job_id", &self.job_id)
            .finish_non_exhaustive()
    }
}

/// Failure reported by a handler.
///
/// Any `std::error::Error + Send + Sync` (and `anyhow::Error`) converts into
/// it with `?`; the short type name of the error becomes `error_type`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError {
    pub error_type: String,
    pub message: String,
    pub trace: Option<String>,
}

impl HandlerError {
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
            trace: None,
        }
    }

    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = Some(trace.into());
        self
    }

    pub fn into_details(self) -> (String, ErrorDetails) {
        let details = ErrorDetails {
            error_type: self.error_type,
            message: self.message.clone(),
            trace: self.trace,
        };
        (self.message, details)
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error_type, self.message)
    }
}

impl<E> From<E> for HandlerError
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    fn from(err: E) -> Self {
        let full_name = std::any::type_name::<E>();
        let err: Box<dyn std::error::Error + Send + Sync> = err.into();
        let message = err.to_string();

        let mut trace = format!("{full_name}: {message}");
        let mut source = err.source();
        while let Some(cause) = source {
            trace.push_str("\ncaused by: ");
            trace.push_str(&cause.to_string());
            source = cause.source();
        }
        let backtrace = std::backtrace::Backtrace::capture();
        if backtrace.status() == std::backtrace::BacktraceStatus::Captured {
            trace.push_str("\n\n");
            trace.push_str(&backtrace.to_string());
        }

        Self {
            error_type: short_type_name(full_name),
            message,
            trace: Some(trace),
        }
    }
}

/// `my_crate::errors::ParseError<T>` -> `ParseError`.
///
/// Types literally named `Error` keep their crate or module for context:
/// `std::io::error::Error` -> `io::Error`, `anyhow::Error` -> `anyhow::Error`.
fn short_type_name(full: &str) -> String {
    let base = full.split('<').next().unwrap_or(full);
    let mut segments = base.rsplit("::");
    let last = segments.next().unwrap_or(base);
    if last != "Error" {
        return last.to_string();
    }
    match segments.find(|s| *s != "error") {
        Some(module) => format!("{module}::{last}"),
        None => last.to_string(),
    }
}

/// Mapping from job type to handler, populated once at startup.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<JobType, JobHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for a job type, replacing any previous one.
    ///
    /// Only recognized job types can be registered.
    pub fn register<F>(&mut self, job_type: JobType, handler: F)
    where
        F: Fn(&JobInput, &ProgressReporter<'_>) -> Result<serde_json::Value, HandlerError>
            + Send
            + Sync
            + 'static,
    {
        if !job_type.is_recognized() {
            warn!(job_type = %job_type, "refusing to register handler for unrecognized job type");
            return;
        }
        self.handlers.insert(job_type, Box::new(handler));
    }

    /// Builder-style `register`.
    pub fn with<F>(mut self, job_type: JobType, handler: F) -> Self
    where
        F: Fn(&JobInput, &ProgressReporter<'_>) -> Result<serde_json::Value, HandlerError>
            + Send
            + Sync
            + 'static,
    {
        self.register(job_type, handler);
        self
    }

    pub fn get(&self, job_type: &JobType) -> Option<&JobHandler> {
        self.handlers.get(job_type)
    }

    pub fn contains(&self, job_type: &JobType) -> bool {
        self.handlers.contains_key(job_type)
    }

    pub fn registered_types(&self) -> Vec<&JobType> {
        let mut types: Vec<_> = self.handlers.keys().collect();
        types.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        types
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("job_types", &self.registered_types())
            .finish()
    }
}
