//! Integration tests for the full job pipeline.
//!
//! Tests: submit → worker tick → executor → handler → store → status view
//!
//! Verifies:
//! - Progress and results are durably visible to status polling
//! - Handler failures and unknown types end FAILED without stopping the loop
//! - Batches are FIFO and bounded
//! - Stuck jobs are recovered exactly once and then re-run

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use chrono::Utc;
    use serde_json::json;

    use jobrunner_core::{SubjectId, TenantId, UserId};

    use crate::jobs::{
        ExecutionOutcome, HandlerRegistry, InMemoryJobStore, Job, JobExecutor, JobId, JobStatus,
        JobStore, JobType, NewJob, UNKNOWN_JOB_TYPE, job_status, submit_job,
    };
    use crate::workers::{STUCK_RESET_MESSAGE, Worker, WorkerConfig};

    #[derive(Debug, thiserror::Error)]
    #[error("{0}")]
    struct ValueError(String);

    fn worker_with(
        store: Arc<InMemoryJobStore>,
        registry: HandlerRegistry,
        config: WorkerConfig,
    ) -> Worker<Arc<InMemoryJobStore>> {
        Worker::new(Arc::new(JobExecutor::new(store, registry)), config)
    }

    fn submit(store: &InMemoryJobStore, tenant: TenantId, job_type: JobType) -> JobId {
        submit_job(store, NewJob::new(job_type, tenant, UserId::new())).unwrap()
    }

    #[test]
    fn successful_job_reports_progress_and_result() {
        let store = InMemoryJobStore::arc();
        let tenant = TenantId::new();
        let observed = Arc::new(Mutex::new(None));

        let store_in_handler = store.clone();
        let observed_in_handler = observed.clone();
        let registry = HandlerRegistry::new().with(JobType::GenerateQuestions, move |input, progress| {
            progress.report("Analyzing...", 30)?;
            // A status poll between progress and completion sees the write.
            let mid = job_status(store_in_handler.as_ref(), input.tenant_id, input.job_id)?;
            *observed_in_handler.lock().unwrap() = Some(mid);
            Ok(json!({"count": 7}))
        });

        let id = submit(&store, tenant, JobType::GenerateQuestions);
        let worker = worker_with(store.clone(), registry, WorkerConfig::default());
        let report = worker.tick();
        assert_eq!(report.completed, 1);

        let mid = observed.lock().unwrap().take().unwrap();
        assert_eq!(mid.status, JobStatus::InProgress);
        assert_eq!(mid.progress_percent, Some(30));
        assert_eq!(mid.progress_message.as_deref(), Some("Analyzing..."));
        assert!(mid.result.is_none());

        let done = job_status(store.as_ref(), tenant, id).unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.progress_percent, Some(100));
        assert_eq!(done.result, Some(json!({"count": 7})));
        let started = done.started_at.unwrap();
        let completed = done.completed_at.unwrap();
        assert!(started <= completed);
    }

    #[test]
    fn handler_error_is_visible_to_status_polling() {
        let store = InMemoryJobStore::arc();
        let tenant = TenantId::new();
        let registry = HandlerRegistry::new().with(JobType::SynthesizeDocument, |_input, _progress| {
            Err(ValueError("bad context".to_string()).into())
        });

        let id = submit(&store, tenant, JobType::SynthesizeDocument);
        worker_with(store.clone(), registry, WorkerConfig::default()).tick();

        let view = job_status(store.as_ref(), tenant, id).unwrap();
        assert_eq!(view.status, JobStatus::Failed);
        assert_eq!(view.error_message.as_deref(), Some("bad context"));
        assert!(view.result.is_none());

        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["error_details"]["errorType"], "ValueError");
        assert_eq!(json["error_details"]["message"], "bad context");
    }

    #[test]
    fn batch_of_one_processes_in_creation_order() {
        let store = InMemoryJobStore::arc();
        let tenant = TenantId::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let order_in_handler = order.clone();
        let registry = HandlerRegistry::new().with(JobType::EvaluateReadiness, move |input, _progress| {
            order_in_handler.lock().unwrap().push(input.job_id);
            Ok(json!({"ready": true}))
        });

        let base = Utc::now() - chrono::Duration::minutes(5);
        let older = Job::new_at(NewJob::new(JobType::EvaluateReadiness, tenant, UserId::new()), base);
        let newer = Job::new_at(
            NewJob::new(JobType::EvaluateReadiness, tenant, UserId::new()),
            base + chrono::Duration::seconds(1),
        );
        let (older_id, newer_id) = (older.id, newer.id);
        store.insert(newer);
        store.insert(older);

        let worker = worker_with(
            store.clone(),
            registry,
            WorkerConfig::default().with_batch_size(1),
        );

        worker.tick();
        assert_eq!(store.get(older_id).unwrap().status, JobStatus::Completed);
        assert_eq!(store.get(newer_id).unwrap().status, JobStatus::Pending);

        worker.tick();
        assert_eq!(store.get(newer_id).unwrap().status, JobStatus::Completed);
        assert_eq!(*order.lock().unwrap(), vec![older_id, newer_id]);
    }

    #[test]
    fn stuck_job_is_reset_then_rerun() {
        let store = InMemoryJobStore::arc();
        let tenant = TenantId::new();
        let two_hours_ago = Utc::now() - chrono::Duration::hours(2);

        let mut stuck = Job::new_at(
            NewJob::new(JobType::ScoreAssessment, tenant, UserId::new())
                .with_subject(SubjectId::new()),
            two_hours_ago,
        );
        stuck.mark_in_progress(two_hours_ago).unwrap();
        let id = stuck.id;
        store.insert(stuck);

        // No handler registered: the reset is observable after the first tick.
        let recovering = worker_with(store.clone(), HandlerRegistry::new(), WorkerConfig::default().with_batch_size(0));
        let report = recovering.tick();
        assert_eq!(report.recovered, 1);

        let reset = store.get(id).unwrap();
        assert_eq!(reset.status, JobStatus::Pending);
        assert_eq!(reset.progress_message.as_deref(), Some(STUCK_RESET_MESSAGE));
        assert_eq!(reset.started_at, Some(two_hours_ago));

        // The next sweep finds nothing to recover.
        assert_eq!(recovering.tick().recovered, 0);

        let attempts = Arc::new(Mutex::new(Vec::new()));
        let attempts_in_handler = attempts.clone();
        let registry = HandlerRegistry::new().with(JobType::ScoreAssessment, move |input, _progress| {
            attempts_in_handler.lock().unwrap().push(input.attempt);
            Ok(json!({"score": 0.5}))
        });
        let worker = worker_with(store.clone(), registry, WorkerConfig::default());
        let report = worker.tick();
        assert_eq!(report.recovered, 0);
        assert_eq!(report.completed, 1);

        let done = store.get(id).unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.attempts, 2);
        assert_eq!(done.started_at, Some(two_hours_ago));
        assert_eq!(*attempts.lock().unwrap(), vec![2]);
    }

    #[test]
    fn recovery_respects_the_timeout() {
        let store = InMemoryJobStore::arc();
        let recent = Utc::now() - chrono::Duration::minutes(10);
        let mut job = Job::new_at(
            NewJob::new(JobType::GenerateQuestions, TenantId::new(), UserId::new()),
            recent,
        );
        job.mark_in_progress(recent).unwrap();
        let id = job.id;
        store.insert(job);

        let worker = worker_with(store.clone(), HandlerRegistry::new(), WorkerConfig::default());
        assert_eq!(worker.tick().recovered, 0);
        assert_eq!(store.get(id).unwrap().status, JobStatus::InProgress);

        let impatient = worker_with(
            store.clone(),
            HandlerRegistry::new(),
            WorkerConfig::default()
                .with_stuck_timeout(Duration::from_secs(60))
                .with_batch_size(0),
        );
        assert_eq!(impatient.tick().recovered, 1);
    }

    #[test]
    fn unknown_type_fails_without_stopping_the_loop() {
        let store = InMemoryJobStore::arc();
        let tenant = TenantId::new();
        let runs = Arc::new(AtomicUsize::new(0));

        let runs_in_handler = runs.clone();
        let registry = HandlerRegistry::new().with(JobType::GenerateQuestions, move |_input, _progress| {
            runs_in_handler.fetch_add(1, Ordering::SeqCst);
            Ok(json!({}))
        });

        let unknown = submit(&store, tenant, JobType::from("UNKNOWN_TYPE"));
        let known = submit(&store, tenant, JobType::GenerateQuestions);

        let report = worker_with(store.clone(), registry, WorkerConfig::default()).tick();
        assert_eq!(report.failed, 1);
        assert_eq!(report.completed, 1);
        assert_eq!(report.errors, 0);
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        let failed = store.get(unknown).unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.error_details.unwrap().error_type, UNKNOWN_JOB_TYPE);
        assert_eq!(store.get(known).unwrap().status, JobStatus::Completed);
    }

    #[test]
    fn competing_executors_claim_once() {
        let store = InMemoryJobStore::arc();
        let runs = Arc::new(AtomicUsize::new(0));

        let make_executor = |runs: Arc<AtomicUsize>| {
            JobExecutor::new(
                store.clone(),
                HandlerRegistry::new().with(JobType::GenerateQuestions, move |_input, _progress| {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok(json!({}))
                }),
            )
        };
        let first = Arc::new(make_executor(runs.clone()));
        let second = Arc::new(make_executor(runs.clone()));

        let ids: Vec<JobId> = (0..50)
            .map(|_| submit(&store, TenantId::new(), JobType::GenerateQuestions))
            .collect();

        let spawn = |executor: Arc<JobExecutor<Arc<InMemoryJobStore>>>, ids: Vec<JobId>| {
            std::thread::spawn(move || {
                ids.into_iter()
                    .filter(|id| executor.execute(*id).unwrap() == ExecutionOutcome::Completed)
                    .count()
            })
        };
        let a = spawn(first, ids.clone());
        let b = spawn(second, ids.clone());
        let completed = a.join().unwrap() + b.join().unwrap();

        assert_eq!(completed, ids.len());
        assert_eq!(runs.load(Ordering::SeqCst), ids.len());
        assert!(
            ids.iter()
                .all(|id| store.get(*id).unwrap().attempts == 1)
        );
    }

    #[test]
    fn terminal_write_is_idempotent_end_to_end() {
        let store = InMemoryJobStore::arc();
        let tenant = TenantId::new();
        let id = submit(&store, tenant, JobType::GenerateQuestions);

        assert!(store.mark_in_progress(id).unwrap());
        assert!(store.complete(id, json!({"first": true})).unwrap());
        let first = store.get(id).unwrap();

        assert!(!store.complete(id, json!({"second": true})).unwrap());
        assert!(!store.fail(id, "late", crate::jobs::ErrorDetails::new("Late", "late")).unwrap());

        let after = store.get(id).unwrap();
        assert_eq!(after.result, Some(json!({"first": true})));
        assert_eq!(after.completed_at, first.completed_at);
        assert!(after.error_message.is_none());
    }
}
