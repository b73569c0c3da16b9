//! Job storage abstraction and the in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::types::{ErrorDetails, Job, JobId, JobStatus, NewJob, TransitionRejected};

/// Job store abstraction.
///
/// Every write commits on its own so that pollers observe progress while a
/// job is still running. Calls are blocking; the worker loop owns a dedicated
/// thread for them.
pub trait JobStore: Send + Sync {
    /// Insert a new PENDING job.
    fn create(&self, request: NewJob) -> Result<Job, JobStoreError>;

    /// Get a job by ID.
    fn get(&self, job_id: JobId) -> Result<Job, JobStoreError>;

    /// PENDING jobs, oldest first, at most `limit`.
    fn list_claimable(&self, limit: usize) -> Result<Vec<Job>, JobStoreError>;

    /// IN_PROGRESS jobs whose current claim is older than `timeout`.
    fn list_stuck(&self, timeout: Duration) -> Result<Vec<Job>, JobStoreError>;

    /// Atomically claim a PENDING job.
    ///
    /// Returns `false` when the job was no longer PENDING at write time, which
    /// means another worker won the claim.
    fn mark_in_progress(&self, job_id: JobId) -> Result<bool, JobStoreError>;

    /// Record progress for an IN_PROGRESS job.
    fn update_progress(
        &self,
        job_id: JobId,
        message: &str,
        percent: Option<u8>,
    ) -> Result<(), JobStoreError>;

    /// Terminal success write. Returns `false` if the job was already terminal.
    fn complete(&self, job_id: JobId, result: serde_json::Value) -> Result<bool, JobStoreError>;

    /// Terminal failure write. Returns `false` if the job was already terminal.
    fn fail(
        &self,
        job_id: JobId,
        message: &str,
        details: ErrorDetails,
    ) -> Result<bool, JobStoreError>;

    /// Put a stuck IN_PROGRESS job back to PENDING.
    ///
    /// Returns `false` if the job left IN_PROGRESS in the meantime.
    fn reset_stuck(&self, job_id: JobId, message: &str) -> Result<bool, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("cannot {operation} job {id} in status {status}")]
    InvalidTransition {
        id: JobId,
        status: JobStatus,
        operation: &'static str,
    },
    #[error("storage error: {0}")]
    Storage(String),
}

impl JobStoreError {
    pub(crate) fn rejected(id: JobId, rejected: TransitionRejected) -> Self {
        Self::InvalidTransition {
            id,
            status: rejected.status,
            operation: rejected.operation,
        }
    }

    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, JobStoreError::Storage(_))
    }
}

/// Claims that started before the returned instant count as stuck.
///
/// `None` when the timeout reaches past any representable time, in which case
/// nothing is stuck.
pub(crate) fn stuck_cutoff(timeout: Duration) -> Option<DateTime<Utc>> {
    let window = chrono::Duration::from_std(timeout).ok()?;
    Utc::now().checked_sub_signed(window)
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Insert a fully-formed job, replacing any job with the same id.
    ///
    /// Used to seed fixtures (explicit timestamps, jobs already in progress).
    pub fn insert(&self, job: Job) {
        self.write().insert(job.id, job);
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    // A panicking writer cannot leave a job half-updated (transitions are
    // validated before any field changes), so poisoned locks are recovered.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<JobId, Job>> {
        self.jobs.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<JobId, Job>> {
        self.jobs.write().unwrap_or_else(|e| e.into_inner())
    }

    fn with_job<T>(
        &self,
        job_id: JobId,
        f: impl FnOnce(&mut Job) -> Result<T, JobStoreError>,
    ) -> Result<T, JobStoreError> {
        let mut jobs = self.write();
        let job = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
        f(job)
    }
}

impl JobStore for InMemoryJobStore {
    fn create(&self, request: NewJob) -> Result<Job, JobStoreError> {
        let job = Job::new(request);
        self.write().insert(job.id, job.clone());
        Ok(job)
    }

    fn get(&self, job_id: JobId) -> Result<Job, JobStoreError> {
        self.read()
            .get(&job_id)
            .cloned()
            .ok_or(JobStoreError::NotFound(job_id))
    }

    fn list_claimable(&self, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.read();
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending)
            .cloned()
            .collect();

        // FIFO; ids are time-ordered so they settle equal timestamps.
        result.sort_by_key(|j| (j.created_at, j.id));
        result.truncate(limit);
        Ok(result)
    }

    fn list_stuck(&self, timeout: Duration) -> Result<Vec<Job>, JobStoreError> {
        let Some(cutoff) = stuck_cutoff(timeout) else {
            return Ok(Vec::new());
        };
        let jobs = self.read();
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| {
                j.status == JobStatus::InProgress
                    && j.claimed_since().is_some_and(|claimed| claimed < cutoff)
            })
            .cloned()
            .collect();

        result.sort_by_key(|j| (j.created_at, j.id));
        Ok(result)
    }

    fn mark_in_progress(&self, job_id: JobId) -> Result<bool, JobStoreError> {
        // Check and set under one write lock: at most one claimant wins.
        self.with_job(job_id, |job| Ok(job.mark_in_progress(Utc::now()).is_ok()))
    }

    fn update_progress(
        &self,
        job_id: JobId,
        message: &str,
        percent: Option<u8>,
    ) -> Result<(), JobStoreError> {
        self.with_job(job_id, |job| {
            job.record_progress(message, percent, Utc::now())
                .map_err(|r| JobStoreError::rejected(job_id, r))
        })
    }

    fn complete(&self, job_id: JobId, result: serde_json::Value) -> Result<bool, JobStoreError> {
        self.with_job(job_id, |job| {
            if job.status.is_terminal() {
                return Ok(false);
            }
            job.mark_completed(result, Utc::now())
                .map(|()| true)
                .map_err(|r| JobStoreError::rejected(job_id, r))
        })
    }

    fn fail(
        &self,
        job_id: JobId,
        message: &str,
        details: ErrorDetails,
    ) -> Result<bool, JobStoreError> {
        self.with_job(job_id, |job| {
            if job.status.is_terminal() {
                return Ok(false);
            }
            job.mark_failed(message, details, Utc::now())
                .map(|()| true)
                .map_err(|r| JobStoreError::rejected(job_id, r))
        })
    }

    fn reset_stuck(&self, job_id: JobId, message: &str) -> Result<bool, JobStoreError> {
        self.with_job(job_id, |job| Ok(job.reset_to_pending(message, Utc::now()).is_ok()))
    }
}

impl<S: JobStore + ?Sized> JobStore for Arc<S> {
    fn create(&self, request: NewJob) -> Result<Job, JobStoreError> {
        (**self).create(request)
    }

    fn get(&self, job_id: JobId) -> Result<Job, JobStoreError> {
        (**self).get(job_id)
    }

    fn list_claimable(&self, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        (**self).list_claimable(limit)
    }

    fn list_stuck(&self, timeout: Duration) -> Result<Vec<Job>, JobStoreError> {
        (**self).list_stuck(timeout)
    }

    fn mark_in_progress(&self, job_id: JobId) -> Result<bool, JobStoreError> {
        (**self).mark_in_progress(job_id)
    }

    fn update_progress(
        &self,
        job_id: JobId,
        message: &str,
        percent: Option<u8>,
    ) -> Result<(), JobStoreError> {
        (**self).update_progress(job_id, message, percent)
    }

    fn complete(&self, job_id: JobId, result: serde_json::Value) -> Result<bool, JobStoreError> {
        (**self).complete(job_id, result)
    }

    fn fail(
        &self,
        job_id: JobId,
        message: &str,
        details: ErrorDetails,
    ) -> Result<bool, JobStoreError> {
        (**self).fail(job_id, message, details)
    }

    fn reset_stuck(&self, job_id: JobId, message: &str) -> Result<bool, JobStoreError> {
        (**self).reset_stuck(job_id, message)
    }
}
