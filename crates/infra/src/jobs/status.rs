//! Submission and status boundaries used by the hosting application.
//!
//! Both are thin: submission inserts a PENDING row and returns its id; status
//! is a single-row read shaped for frequent polling.

use chrono::{DateTime, Utc};
use serde::Serialize;

use jobrunner_core::TenantId;

use super::store::{JobStore, JobStoreError};
use super::types::{ErrorDetails, Job, JobId, JobStatus, JobType, NewJob};

/// Client-facing snapshot of a job.
///
/// `result` is only populated for completed jobs and the error fields only
/// for failed ones.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatusView {
    pub id: JobId,
    pub job_type: JobType,
    pub status: JobStatus,
    pub progress_message: Option<String>,
    pub progress_percent: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_details: Option<ErrorDetails>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<Job> for JobStatusView {
    fn from(job: Job) -> Self {
        let completed = job.status == JobStatus::Completed;
        let failed = job.status == JobStatus::Failed;
        Self {
            id: job.id,
            job_type: job.job_type,
            status: job.status,
            progress_message: job.progress_message,
            progress_percent: job.progress_percent,
            result: job.result.filter(|_| completed),
            error_message: job.error_message.filter(|_| failed),
            error_details: job.error_details.filter(|_| failed),
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
        }
    }
}

/// Record a new job and return its id immediately.
pub fn submit_job<S: JobStore + ?Sized>(store: &S, request: NewJob) -> Result<JobId, JobStoreError> {
    let job = store.create(request)?;
    tracing::info!(
        job_id = %job.id,
        job_type = %job.job_type,
        tenant_id = %job.tenant_id,
        "job submitted"
    );
    Ok(job.id)
}

/// Status of a job as seen by a tenant.
///
/// A job owned by another tenant is reported as not found, so ids cannot be
/// probed across tenants.
pub fn job_status<S: JobStore + ?Sized>(
    store: &S,
    tenant_id: TenantId,
    job_id: JobId,
) -> Result<JobStatusView, JobStoreError> {
    let job = store.get(job_id)?;
    if job.tenant_id != tenant_id {
        return Err(JobStoreError::NotFound(job_id));
    }
    Ok(job.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::InMemoryJobStore;
    use jobrunner_core::UserId;

    #[test]
    fn fresh_submission_is_pending_at_zero() {
        let store = InMemoryJobStore::new();
        let tenant = TenantId::new();
        let id = submit_job(
            &store,
            NewJob::new(JobType::GenerateQuestions, tenant, UserId::new()),
        )
        .unwrap();

        let view = job_status(&store, tenant, id).unwrap();
        assert_eq!(view.status, JobStatus::Pending);
        assert_eq!(view.progress_percent, Some(0));
        assert!(view.started_at.is_none());

        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["status"], "PENDING");
        assert_eq!(json["job_type"], "GENERATE_QUESTIONS");
        assert!(json.get("result").is_none());
        assert!(json.get("error_message").is_none());
    }

    #[test]
    fn other_tenants_cannot_see_the_job() {
        let store = InMemoryJobStore::new();
        let owner = TenantId::new();
        let id = submit_job(
            &store,
            NewJob::new(JobType::ScoreAssessment, owner, UserId::new()),
        )
        .unwrap();

        assert_eq!(
            job_status(&store, TenantId::new(), id),
            Err(JobStoreError::NotFound(id))
        );
    }

    #[test]
    fn failed_view_carries_errors_only() {
        let store = InMemoryJobStore::new();
        let tenant = TenantId::new();
        let id = submit_job(
            &store,
            NewJob::new(JobType::SynthesizeDocument, tenant, UserId::new()),
        )
        .unwrap();
        store.mark_in_progress(id).unwrap();
        store
            .fail(id, "bad context", ErrorDetails::new("ValueError", "bad context"))
            .unwrap();

        let view = job_status(&store, tenant, id).unwrap();
        assert_eq!(view.status, JobStatus::Failed);
        assert!(view.result.is_none());
        assert_eq!(view.error_message.as_deref(), Some("bad context"));

        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["error_details"]["errorType"], "ValueError");
        assert!(json["completed_at"].is_string());
    }
}
