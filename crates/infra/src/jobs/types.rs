//! Core job types and state transitions.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use jobrunner_core::{DomainError, SubjectId, TenantId, UserId};

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::from_str(s)
            .map(Self)
            .map_err(|e| DomainError::invalid_id(format!("JobId: {e}")))
    }
}

/// Job type used to route a job to its handler.
///
/// The set is closed. A type string that is not part of it (for instance a
/// row written by a newer deployment) is kept verbatim as `Unrecognized` so
/// the row still loads and can be failed by the executor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum JobType {
    GenerateQuestions,
    SynthesizeDocument,
    ScoreAssessment,
    EvaluateReadiness,
    Unrecognized(String),
}

impl JobType {
    /// Every recognized job type.
    pub const KNOWN: [JobType; 4] = [
        JobType::GenerateQuestions,
        JobType::SynthesizeDocument,
        JobType::ScoreAssessment,
        JobType::EvaluateReadiness,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            JobType::GenerateQuestions => "GENERATE_QUESTIONS",
            JobType::SynthesizeDocument => "SYNTHESIZE_DOCUMENT",
            JobType::ScoreAssessment => "SCORE_ASSESSMENT",
            JobType::EvaluateReadiness => "EVALUATE_READINESS",
            JobType::Unrecognized(raw) => raw,
        }
    }

    pub fn is_recognized(&self) -> bool {
        !matches!(self, JobType::Unrecognized(_))
    }
}

impl From<&str> for JobType {
    fn from(value: &str) -> Self {
        JobType::KNOWN
            .into_iter()
            .find(|known| known.as_str() == value)
            .unwrap_or_else(|| JobType::Unrecognized(value.to_string()))
    }
}

impl From<String> for JobType {
    fn from(value: String) -> Self {
        JobType::from(value.as_str())
    }
}

impl From<JobType> for String {
    fn from(value: JobType) -> Self {
        match value {
            JobType::Unrecognized(raw) => raw,
            other => other.as_str().to_string(),
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Queued, waiting to be claimed
    Pending,
    /// Claimed by a worker and executing
    InProgress,
    /// Finished with a result
    Completed,
    /// Finished with an error
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::InProgress => "IN_PROGRESS",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(JobStatus::Pending),
            "IN_PROGRESS" => Ok(JobStatus::InProgress),
            "COMPLETED" => Ok(JobStatus::Completed),
            "FAILED" => Ok(JobStatus::Failed),
            other => Err(DomainError::validation(format!("unknown job status: {other}"))),
        }
    }
}

/// Structured description of why a job failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetails {
    pub error_type: String,
    pub message: String,
    pub trace: Option<String>,
}

impl ErrorDetails {
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
}

/// Request to create a job, as issued by the submission boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewJob {
    pub job_type: JobType,
    pub tenant_id: TenantId,
    pub requester_id: UserId,
    pub subject_id: Option<SubjectId>,
}

impl NewJob {
    pub fn new(job_type: JobType, tenant_id: TenantId, requester_id: UserId) -> Self {
        Self {
            job_type,
            tenant_id,
            requester_id,
            subject_id: None,
        }
    }

    pub fn with_subject(mut self, subject_id: SubjectId) -> Self {
        self.subject_id = Some(subject_id);
        self
    }
}

/// A rejected state change; the job was left untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionRejected {
    pub status: JobStatus,
    pub operation: &'static str,
}

/// A durable background job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub job_type: JobType,
    pub status: JobStatus,
    pub progress_message: Option<String>,
    /// 0-100; `None` means unknown.
    pub progress_percent: Option<u8>,
    pub tenant_id: TenantId,
    pub subject_id: Option<SubjectId>,
    pub requester_id: UserId,
    /// Present only when completed.
    pub result: Option<serde_json::Value>,
    /// Present only when failed.
    pub error_message: Option<String>,
    pub error_details: Option<ErrorDetails>,
    /// How many times the job has been claimed.
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    /// First claim; never rewritten.
    pub started_at: Option<DateTime<Utc>>,
    /// Most recent claim; stuck detection is measured from here.
    pub last_claimed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a pending job from a submission.
    pub fn new(request: NewJob) -> Self {
        Self::new_at(request, Utc::now())
    }

    /// Create a pending job with an explicit creation time.
    pub fn new_at(request: NewJob, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            job_type: request.job_type,
            status: JobStatus::Pending,
            progress_message: None,
            progress_percent: Some(0),
            tenant_id: request.tenant_id,
            subject_id: request.subject_id,
            requester_id: request.requester_id,
            result: None,
            error_message: None,
            error_details: None,
            attempts: 0,
            created_at: now,
            started_at: None,
            last_claimed_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    /// Time the current claim started, used to decide whether the job is stuck.
    pub fn claimed_since(&self) -> Option<DateTime<Utc>> {
        self.last_claimed_at.or(self.started_at)
    }

    /// PENDING -> IN_PROGRESS.
    pub fn mark_in_progress(&mut self, now: DateTime<Utc>) -> Result<(), TransitionRejected> {
        self.expect_status(JobStatus::Pending, "mark_in_progress")?;
        self.status = JobStatus::InProgress;
        if self.started_at.is_none() {
            self.started_at = Some(now);
        }
        self.last_claimed_at = Some(now);
        self.attempts += 1;
        self.updated_at = now;
        Ok(())
    }

    /// Record handler progress. Percent is clamped to 100 and never moves backwards.
    pub fn record_progress(
        &mut self,
        message: &str,
        percent: Option<u8>,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionRejected> {
        self.expect_status(JobStatus::InProgress, "update_progress")?;
        self.progress_message = Some(message.to_string());
        if let Some(p) = percent {
            let p = p.min(100);
            self.progress_percent = Some(self.progress_percent.map_or(p, |cur| cur.max(p)));
        }
        self.updated_at = now;
        Ok(())
    }

    /// IN_PROGRESS -> COMPLETED.
    pub fn mark_completed(
        &mut self,
        result: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionRejected> {
        self.expect_status(JobStatus::InProgress, "complete")?;
        self.status = JobStatus::Completed;
        self.progress_percent = Some(100);
        self.result = Some(result);
        self.error_message = None;
        self.error_details = None;
        self.completed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// IN_PROGRESS -> FAILED.
    pub fn mark_failed(
        &mut self,
        message: &str,
        details: ErrorDetails,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionRejected> {
        self.expect_status(JobStatus::InProgress, "fail")?;
        self.status = JobStatus::Failed;
        self.result = None;
        self.error_message = Some(message.to_string());
        self.error_details = Some(details);
        self.completed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// IN_PROGRESS -> PENDING after the claimant is presumed dead.
    ///
    /// `started_at` is kept; the next claim refreshes `last_claimed_at`.
    pub fn reset_to_pending(
        &mut self,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionRejected> {
        self.expect_status(JobStatus::InProgress, "reset_stuck")?;
        self.status = JobStatus::Pending;
        self.progress_message = Some(message.to_string());
        self.updated_at = now;
        Ok(())
    }

    fn expect_status(
        &self,
        expected: JobStatus,
        operation: &'static str,
    ) -> Result<(), TransitionRejected> {
        if self.status == expected {
            Ok(())
        } else {
            Err(TransitionRejected {
                status: self.status,
                operation,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn pending_job() -> Job {
        Job::new(NewJob::new(
            JobType::GenerateQuestions,
            TenantId::new(),
            UserId::new(),
        ))
    }

    #[test]
    fn job_type_serializes_as_screaming_snake_case() {
        let json = serde_json::to_value(JobType::GenerateQuestions).unwrap();
        assert_eq!(json, serde_json::json!("GENERATE_QUESTIONS"));

        let parsed: JobType = serde_json::from_value(serde_json::json!("EVALUATE_READINESS")).unwrap();
        assert_eq!(parsed, JobType::EvaluateReadiness);
    }

    #[test]
    fn unknown_job_type_is_kept_verbatim() {
        let parsed = JobType::from("UNKNOWN_TYPE");
        assert_eq!(parsed, JobType::Unrecognized("UNKNOWN_TYPE".to_string()));
        assert!(!parsed.is_recognized());
        assert_eq!(String::from(parsed), "UNKNOWN_TYPE");
    }

    #[test]
    fn status_parses_its_own_representation() {
        for status in [
            JobStatus::Pending,
            JobStatus::InProgress,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("RUNNING".parse::<JobStatus>().is_err());
    }

    #[test]
    fn new_job_starts_pending_at_zero_percent() {
        let job = pending_job();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.progress_percent, Some(0));
        assert_eq!(job.attempts, 0);
        assert!(job.started_at.is_none());
    }

    #[test]
    fn job_lifecycle() {
        let mut job = pending_job();
        let t1 = Utc::now();
        job.mark_in_progress(t1).unwrap();
        assert_eq!(job.status, JobStatus::InProgress);
        assert_eq!(job.started_at, Some(t1));
        assert_eq!(job.attempts, 1);

        job.record_progress("Analyzing...", Some(30), t1).unwrap();
        assert_eq!(job.progress_percent, Some(30));

        let t2 = t1 + chrono::Duration::seconds(5);
        job.mark_completed(serde_json::json!({"count": 7}), t2).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress_percent, Some(100));
        assert_eq!(job.completed_at, Some(t2));
        assert!(job.error_message.is_none());
    }

    #[test]
    fn progress_never_moves_backwards() {
        let mut job = pending_job();
        let now = Utc::now();
        job.mark_in_progress(now).unwrap();
        job.record_progress("half", Some(50), now).unwrap();
        job.record_progress("re-check", Some(20), now).unwrap();
        assert_eq!(job.progress_percent, Some(50));
        assert_eq!(job.progress_message.as_deref(), Some("re-check"));

        job.record_progress("overshoot", Some(250), now).unwrap();
        assert_eq!(job.progress_percent, Some(100));
    }

    #[test]
    fn terminal_jobs_reject_every_transition() {
        let mut job = pending_job();
        let now = Utc::now();
        job.mark_in_progress(now).unwrap();
        job.mark_failed("boom", ErrorDetails::new("Boom", "boom"), now).unwrap();
        let snapshot = job.clone();

        assert!(job.mark_in_progress(now).is_err());
        assert!(job.record_progress("late", Some(90), now).is_err());
        assert!(job.mark_completed(serde_json::json!({}), now).is_err());
        assert!(job.mark_failed("again", ErrorDetails::new("X", "again"), now).is_err());
        assert!(job.reset_to_pending("reset", now).is_err());
        assert_eq!(job, snapshot);
    }

    #[test]
    fn reset_keeps_first_start_and_reclaim_refreshes_claim_time() {
        let mut job = pending_job();
        let first = Utc::now() - chrono::Duration::hours(2);
        job.mark_in_progress(first).unwrap();

        let now = Utc::now();
        job.reset_to_pending("stuck", now).unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.progress_message.as_deref(), Some("stuck"));

        job.mark_in_progress(now).unwrap();
        assert_eq!(job.started_at, Some(first));
        assert_eq!(job.last_claimed_at, Some(now));
        assert_eq!(job.attempts, 2);
    }

    #[test]
    fn error_details_use_camel_case_keys() {
        let details = ErrorDetails::new("ValueError", "bad context").with_trace("at handler");
        let json = serde_json::to_value(details).unwrap();
        assert_eq!(json["errorType"], "ValueError");
        assert_eq!(json["trace"], "at handler");
    }

    #[derive(Debug, Clone)]
    enum Op {
        Claim,
        Progress(u8),
        Complete,
        Fail,
        Reset,
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::Claim),
            (0u8..=120).prop_map(Op::Progress),
            Just(Op::Complete),
            Just(Op::Fail),
            Just(Op::Reset),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: whatever sequence of operations is attempted, a terminal job
        /// never changes again and the first start/completion times are stable.
        #[test]
        fn lifecycle_is_monotonic(ops in prop::collection::vec(op_strategy(), 1..30)) {
            let mut job = pending_job();
            let base = Utc::now();
            let mut first_started = None;
            let mut terminal_snapshot: Option<Job> = None;

            for (i, op) in ops.into_iter().enumerate() {
                let now = base + chrono::Duration::seconds(i as i64);
                let before_percent = job.progress_percent;
                let was_in_progress = job.status == JobStatus::InProgress;

                let _ = match op {
                    Op::Claim => job.mark_in_progress(now),
                    Op::Progress(p) => job.record_progress("step", Some(p), now),
                    Op::Complete => job.mark_completed(serde_json::json!({"ok": true}), now),
                    Op::Fail => job.mark_failed("err", ErrorDetails::new("E", "err"), now),
                    Op::Reset => job.reset_to_pending("reset", now),
                };

                if let Some(snapshot) = &terminal_snapshot {
                    prop_assert_eq!(&job, snapshot);
                }
                if job.status.is_terminal() && terminal_snapshot.is_none() {
                    terminal_snapshot = Some(job.clone());
                }

                if first_started.is_none() {
                    first_started = job.started_at;
                }
                prop_assert_eq!(job.started_at, first_started);

                if was_in_progress && job.status == JobStatus::InProgress {
                    prop_assert!(job.progress_percent >= before_percent);
                }
                prop_assert!(!(job.result.is_some() && job.error_message.is_some()));
                if job.status == JobStatus::Completed {
                    prop_assert_eq!(job.progress_percent, Some(100));
                }
            }
        }
    }
}
