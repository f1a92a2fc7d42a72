//! Job store boundary and the in-memory implementation.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};

use jobqueue_core::{
    ErrorCode, Event, EventKind, Job, JobAttempt, JobError, JobFilter, JobId, JobStats, JobStatus,
    NewJob, Usage, WorkerHeartbeat, WorkerId, WorkerState,
};

use super::details;

/// Durable system of record for jobs, attempts, events and worker heartbeats.
///
/// Every status change is a conditional transition: it applies only when the
/// job is in the expected state and is otherwise a safe no-op (`None`) or a
/// `NotFound`. This, not the queue lease, is what makes execution outcomes
/// exactly-once.
#[async_trait::async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a queued job, or return the existing one for the same
    /// `(tenant_id, idempotency_key)`.
    ///
    /// Returns `(job, existed)`. Appends `job.created` only on insert.
    async fn create_job(&self, input: NewJob) -> Result<(Job, bool), JobStoreError>;

    /// Job plus its highest-numbered attempt.
    async fn get_job(&self, job_id: JobId) -> Result<(Job, Option<JobAttempt>), JobStoreError>;

    /// Newest first (`created_at DESC, id DESC`), or ascending when
    /// `filter.oldest_first`. Capped at `filter.limit`; page on with
    /// `filter.after`.
    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError>;

    /// `queued -> running`, bumping `attempt` and opening its attempt row.
    ///
    /// `Ok(None)` when the job is not `queued` (already taken, cancelled, gone).
    async fn mark_running(
        &self,
        job_id: JobId,
        worker_id: &WorkerId,
    ) -> Result<Option<Job>, JobStoreError>;

    /// `running -> succeeded`, finalizing `attempt` with `usage`.
    ///
    /// `NotFound` (and no change) when the job is not `running`, or is running
    /// a later attempt than the one the caller started.
    async fn mark_succeeded(
        &self,
        job_id: JobId,
        attempt: i32,
        worker_id: &WorkerId,
        usage: &Usage,
    ) -> Result<(), JobStoreError>;

    /// `running -> failed`, finalizing `attempt` with the error.
    ///
    /// Same attempt guard as [`JobStore::mark_succeeded`].
    async fn mark_failed(
        &self,
        job_id: JobId,
        attempt: i32,
        worker_id: &WorkerId,
        code: ErrorCode,
        message: &str,
    ) -> Result<(), JobStoreError>;

    /// `queued | running | retry_scheduled -> cancelled`.
    async fn cancel_job(&self, job_id: JobId, reason: &str) -> Result<Job, JobStoreError>;

    /// `failed | retry_scheduled | dlq | cancelled -> queued`, keeping `attempt`.
    ///
    /// Queue membership is the caller's problem.
    async fn retry_job(&self, job_id: JobId) -> Result<Job, JobStoreError>;

    /// Last write wins.
    async fn upsert_worker_heartbeat(
        &self,
        worker_id: &WorkerId,
        state: WorkerState,
        running_job_id: Option<JobId>,
        concurrency: i32,
    ) -> Result<(), JobStoreError>;

    /// Ordered by worker id.
    async fn list_workers(&self) -> Result<Vec<WorkerHeartbeat>, JobStoreError>;

    /// Events of one job, oldest first.
    async fn list_events(&self, job_id: JobId, limit: usize) -> Result<Vec<Event>, JobStoreError>;

    async fn job_stats(&self) -> Result<JobStats, JobStoreError>;

    /// Send `running` jobs nobody vouches for back to `queued`.
    ///
    /// A job qualifies when it started more than `stale_after` ago and no worker
    /// with a heartbeat newer than `stale_after` reports it as its running job.
    /// Its open attempt is finalized as `WORKER_LOST` and `job.requeued` is
    /// appended. Returns the requeued jobs.
    async fn requeue_orphaned(&self, stale_after: Duration) -> Result<Vec<Job>, JobStoreError>;

    async fn ping(&self) -> Result<(), JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStoreError {
    /// Missing, or not in a state the transition accepts.
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<JobStoreError> for JobError {
    fn from(err: JobStoreError) -> Self {
        match err {
            JobStoreError::NotFound(msg) => JobError::NotFound(msg),
            JobStoreError::Conflict(msg) => JobError::Conflict(msg),
            JobStoreError::Validation(msg) => JobError::Validation(msg),
            JobStoreError::Storage(msg) => JobError::Transient(msg),
        }
    }
}

impl From<JobError> for JobStoreError {
    fn from(err: JobError) -> Self {
        match err {
            JobError::NotFound(msg) => JobStoreError::NotFound(msg),
            JobError::Conflict(msg) => JobStoreError::Conflict(msg),
            JobError::Validation(msg) => JobStoreError::Validation(msg),
            JobError::Transient(msg) | JobError::Provider(msg) => JobStoreError::Storage(msg),
        }
    }
}

pub(crate) fn not_in_state(job_id: JobId, expected: &str) -> JobStoreError {
    JobStoreError::NotFound(format!("job {job_id} not found or not {expected}"))
}

pub(crate) fn validate_limit(limit: usize) -> Result<(), JobStoreError> {
    if limit == 0 {
        return Err(JobStoreError::Validation("limit must be positive".to_string()));
    }
    Ok(())
}

pub(crate) fn stale_cutoff(now: DateTime<Utc>, stale_after: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(stale_after)
        .ok()
        .and_then(|grace| now.checked_sub_signed(grace))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[async_trait::async_trait]
impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    async fn create_job(&self, input: NewJob) -> Result<(Job, bool), JobStoreError> {
        (**self).create_job(input).await
    }

    async fn get_job(&self, job_id: JobId) -> Result<(Job, Option<JobAttempt>), JobStoreError> {
        (**self).get_job(job_id).await
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError> {
        (**self).list_jobs(filter).await
    }

    async fn mark_running(
        &self,
        job_id: JobId,
        worker_id: &WorkerId,
    ) -> Result<Option<Job>, JobStoreError> {
        (**self).mark_running(job_id, worker_id).await
    }

    async fn mark_succeeded(
        &self,
        job_id: JobId,
        attempt: i32,
        worker_id: &WorkerId,
        usage: &Usage,
    ) -> Result<(), JobStoreError> {
        (**self).mark_succeeded(job_id, attempt, worker_id, usage).await
    }

    async fn mark_failed(
        &self,
        job_id: JobId,
        attempt: i32,
        worker_id: &WorkerId,
        code: ErrorCode,
        message: &str,
    ) -> Result<(), JobStoreError> {
        (**self).mark_failed(job_id, attempt, worker_id, code, message).await
    }

    async fn cancel_job(&self, job_id: JobId, reason: &str) -> Result<Job, JobStoreError> {
        (**self).cancel_job(job_id, reason).await
    }

    async fn retry_job(&self, job_id: JobId) -> Result<Job, JobStoreError> {
        (**self).retry_job(job_id).await
    }

    async fn upsert_worker_heartbeat(
        &self,
        worker_id: &WorkerId,
        state: WorkerState,
        running_job_id: Option<JobId>,
        concurrency: i32,
    ) -> Result<(), JobStoreError> {
        (**self)
            .upsert_worker_heartbeat(worker_id, state, running_job_id, concurrency)
            .await
    }

    async fn list_workers(&self) -> Result<Vec<WorkerHeartbeat>, JobStoreError> {
        (**self).list_workers().await
    }

    async fn list_events(&self, job_id: JobId, limit: usize) -> Result<Vec<Event>, JobStoreError> {
        (**self).list_events(job_id, limit).await
    }

    async fn job_stats(&self) -> Result<JobStats, JobStoreError> {
        (**self).job_stats().await
    }

    async fn requeue_orphaned(&self, stale_after: Duration) -> Result<Vec<Job>, JobStoreError> {
        (**self).requeue_orphaned(stale_after).await
    }

    async fn ping(&self) -> Result<(), JobStoreError> {
        (**self).ping().await
    }
}

#[derive(Debug, Default)]
struct State {
    jobs: HashMap<JobId, Job>,
    by_idempotency_key: HashMap<(String, String), JobId>,
    attempts: HashMap<JobId, BTreeMap<i32, JobAttempt>>,
    events: Vec<Event>,
    workers: BTreeMap<WorkerId, WorkerHeartbeat>,
}

impl State {
    fn append_event(
        &mut self,
        kind: EventKind,
        job_id: JobId,
        worker_id: Option<&WorkerId>,
        details: impl Into<String>,
        now: DateTime<Utc>,
    ) {
        let id = self.events.len() as i64 + 1;
        self.events.push(Event {
            id,
            event_type: kind.as_str().to_string(),
            job_id: Some(job_id),
            worker_id: worker_id.cloned(),
            details: details.into(),
            created_at: now,
        });
    }

    /// The job, only while it is running `attempt`.
    fn running_job_mut(&mut self, job_id: JobId, attempt: i32) -> Result<&mut Job, JobStoreError> {
        self.jobs
            .get_mut(&job_id)
            .filter(|job| job.status == JobStatus::Running && job.attempt == attempt)
            .ok_or_else(|| not_in_state(job_id, &format!("running attempt {attempt}")))
    }

    /// Current attempt row, inserted if missing.
    fn attempt_mut(&mut self, job_id: JobId, attempt: i32, now: DateTime<Utc>) -> &mut JobAttempt {
        self.attempts
            .entry(job_id)
            .or_default()
            .entry(attempt)
            .or_insert_with(|| JobAttempt::open(job_id, attempt, now))
    }
}

/// In-memory job store for tests/dev.
///
/// Mirrors the conditional semantics of the Postgres store. Each operation
/// runs under one mutex, so every transition is atomic.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    state: Mutex<State>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Every attempt of a job, in attempt order.
    pub fn attempts(&self, job_id: JobId) -> Vec<JobAttempt> {
        self.state
            .lock()
            .map(|state| {
                state
                    .attempts
                    .get(&job_id)
                    .map(|rows| rows.values().cloned().collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, JobStoreError> {
        self.state
            .lock()
            .map_err(|_| JobStoreError::Storage("in-memory job store lock poisoned".to_string()))
    }
}

#[async_trait::async_trait]
impl JobStore for InMemoryJobStore {
    async fn create_job(&self, input: NewJob) -> Result<(Job, bool), JobStoreError> {
        input.validate()?;
        let input = input.normalized();
        let now = Utc::now();
        let mut state = self.lock()?;

        let key = input
            .idempotency_key
            .clone()
            .map(|key| (input.tenant_id.clone(), key));
        if let Some(key) = &key {
            if let Some(existing) = state
                .by_idempotency_key
                .get(key)
                .and_then(|id| state.jobs.get(id))
            {
                return Ok((existing.clone(), true));
            }
        }

        let job = Job::queued(input, now);
        if state.jobs.contains_key(&job.id) {
            return Err(JobStoreError::Conflict(format!("job id {} already exists", job.id)));
        }
        if let Some(key) = key {
            state.by_idempotency_key.insert(key, job.id);
        }
        state.jobs.insert(job.id, job.clone());
        state.append_event(EventKind::Created, job.id, None, details::CREATED, now);
        Ok((job, false))
    }

    async fn get_job(&self, job_id: JobId) -> Result<(Job, Option<JobAttempt>), JobStoreError> {
        let state = self.lock()?;
        let job = state
            .jobs
            .get(&job_id)
            .cloned()
            .ok_or_else(|| JobStoreError::NotFound(format!("job {job_id} not found")))?;
        let latest = state
            .attempts
            .get(&job_id)
            .and_then(|rows| rows.values().next_back())
            .cloned();
        Ok((job, latest))
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError> {
        validate_limit(filter.limit)?;
        let filter = filter.clone().normalized();
        let state = self.lock()?;
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|job| filter.matches(job))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| filter.compare(a, b));
        jobs.truncate(filter.limit);
        Ok(jobs)
    }

    async fn mark_running(
        &self,
        job_id: JobId,
        worker_id: &WorkerId,
    ) -> Result<Option<Job>, JobStoreError> {
        let now = Utc::now();
        let mut state = self.lock()?;
        let Some(job) = state
            .jobs
            .get_mut(&job_id)
            .filter(|job| job.status == JobStatus::Queued)
        else {
            return Ok(None);
        };

        job.status = JobStatus::Running;
        job.started_at = Some(now);
        job.finished_at = None;
        job.attempt += 1;
        job.clear_error();
        let job = job.clone();

        // Upsert: a leftover row for this attempt number is reopened.
        *state.attempt_mut(job_id, job.attempt, now) = JobAttempt::open(job_id, job.attempt, now);
        state.append_event(EventKind::Started, job_id, Some(worker_id), details::STARTED, now);
        Ok(Some(job))
    }

    async fn mark_succeeded(
        &self,
        job_id: JobId,
        attempt: i32,
        worker_id: &WorkerId,
        usage: &Usage,
    ) -> Result<(), JobStoreError> {
        let now = Utc::now();
        let mut state = self.lock()?;
        let job = state.running_job_mut(job_id, attempt)?;
        job.status = JobStatus::Succeeded;
        job.finished_at = Some(now);
        job.clear_error();

        state.attempt_mut(job_id, attempt, now).succeed(usage, now);
        state.append_event(EventKind::Succeeded, job_id, Some(worker_id), details::SUCCEEDED, now);
        Ok(())
    }

    async fn mark_failed(
        &self,
        job_id: JobId,
        attempt: i32,
        worker_id: &WorkerId,
        code: ErrorCode,
        message: &str,
    ) -> Result<(), JobStoreError> {
        let now = Utc::now();
        let mut state = self.lock()?;
        let job = state.running_job_mut(job_id, attempt)?;
        job.status = JobStatus::Failed;
        job.finished_at = Some(now);
        job.error_code = Some(code);
        job.error_message = Some(message.to_string());

        state.attempt_mut(job_id, attempt, now).fail(code, message, now);
        state.append_event(
            EventKind::Failed,
            job_id,
            Some(worker_id),
            details::failed(code),
            now,
        );
        Ok(())
    }

    async fn cancel_job(&self, job_id: JobId, reason: &str) -> Result<Job, JobStoreError> {
        let now = Utc::now();
        let mut state = self.lock()?;
        let job = state
            .jobs
            .get_mut(&job_id)
            .filter(|job| job.status.is_cancellable())
            .ok_or_else(|| not_in_state(job_id, "cancellable"))?;

        let was_running = job.status == JobStatus::Running;
        job.status = JobStatus::Cancelled;
        job.finished_at = Some(now);
        job.error_code = Some(ErrorCode::Cancelled);
        job.error_message = Some(reason.to_string());
        let job = job.clone();

        if was_running {
            if let Some(attempt) = state
                .attempts
                .get_mut(&job_id)
                .and_then(|rows| rows.get_mut(&job.attempt))
            {
                attempt.fail(ErrorCode::Cancelled, reason, now);
            }
        }
        state.append_event(EventKind::Cancelled, job_id, None, reason, now);
        Ok(job)
    }

    async fn retry_job(&self, job_id: JobId) -> Result<Job, JobStoreError> {
        let now = Utc::now();
        let mut state = self.lock()?;
        let job = state
            .jobs
            .get_mut(&job_id)
            .filter(|job| job.status.is_retryable())
            .ok_or_else(|| not_in_state(job_id, "retryable"))?;

        job.status = JobStatus::Queued;
        job.finished_at = None;
        job.clear_error();
        let job = job.clone();

        state.append_event(EventKind::RetryScheduled, job_id, None, details::RETRIED, now);
        Ok(job)
    }

    async fn upsert_worker_heartbeat(
        &self,
        worker_id: &WorkerId,
        state: WorkerState,
        running_job_id: Option<JobId>,
        concurrency: i32,
    ) -> Result<(), JobStoreError> {
        let heartbeat = WorkerHeartbeat {
            worker_id: worker_id.clone(),
            last_heartbeat_at: Utc::now(),
            state,
            running_job_id,
            concurrency,
        };
        self.lock()?.workers.insert(worker_id.clone(), heartbeat);
        Ok(())
    }

    async fn list_workers(&self) -> Result<Vec<WorkerHeartbeat>, JobStoreError> {
        Ok(self.lock()?.workers.values().cloned().collect())
    }

    async fn list_events(&self, job_id: JobId, limit: usize) -> Result<Vec<Event>, JobStoreError> {
        validate_limit(limit)?;
        Ok(self
            .lock()?
            .events
            .iter()
            .filter(|event| event.job_id == Some(job_id))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn job_stats(&self) -> Result<JobStats, JobStoreError> {
        let mut stats = JobStats::default();
        for job in self.lock()?.jobs.values() {
            stats.record(job.status, 1);
        }
        Ok(stats)
    }

    async fn requeue_orphaned(&self, stale_after: Duration) -> Result<Vec<Job>, JobStoreError> {
        let now = Utc::now();
        let cutoff = stale_cutoff(now, stale_after);
        let mut state = self.lock()?;

        let vouched: HashSet<JobId> = state
            .workers
            .values()
            .filter(|w| w.last_heartbeat_at > cutoff)
            .filter_map(|w| w.running_job_id)
            .collect();

        let mut orphaned: Vec<JobId> = state
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::Running)
            .filter(|job| job.started_at.is_some_and(|started| started <= cutoff))
            .filter(|job| !vouched.contains(&job.id))
            .map(|job| job.id)
            .collect();
        orphaned.sort();

        let mut requeued = Vec::with_capacity(orphaned.len());
        for job_id in orphaned {
            let Some(job) = state.jobs.get_mut(&job_id) else {
                continue;
            };
            job.status = JobStatus::Queued;
            job.finished_at = None;
            job.error_code = Some(ErrorCode::WorkerLost);
            job.error_message = Some(details::WORKER_LOST.to_string());
            let job = job.clone();

            state
                .attempt_mut(job_id, job.attempt, now)
                .fail(ErrorCode::WorkerLost, details::WORKER_LOST, now);
            state.append_event(EventKind::Requeued, job_id, None, details::WORKER_LOST, now);
            requeued.push(job);
        }
        Ok(requeued)
    }

    async fn ping(&self) -> Result<(), JobStoreError> {
        self.lock().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn worker() -> WorkerId {
        WorkerId::new("worker-1")
    }

    async fn queued_job(store: &InMemoryJobStore) -> Job {
        store
            .create_job(NewJob::new("t1", "gpt-mock"))
            .await
            .unwrap()
            .0
    }

    fn usage() -> Usage {
        Usage {
            tokens: 321,
            cost_usd: 0.00321,
            provider_meta: json!({"provider": "test"}),
        }
    }

    #[tokio::test]
    async fn create_applies_defaults_and_records_event() {
        let store = InMemoryJobStore::new();
        let (job, existed) = store
            .create_job(NewJob::new("t1", "gpt-mock").with_priority(0))
            .await
            .unwrap();

        assert!(!existed);
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.priority, 3);
        assert_eq!(job.max_attempts, 3);
        assert_eq!(job.payload, json!({}));
        assert_eq!(job.attempt, 0);

        let events = store.list_events(job.id, 10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].is(EventKind::Created));
    }

    #[tokio::test]
    async fn same_key_returns_the_first_job() {
        let store = InMemoryJobStore::new();
        let first = NewJob::new("t1", "m")
            .with_idempotency_key("abc")
            .with_payload(json!({"prompt": "one"}));
        let second = NewJob::new("t1", "m")
            .with_idempotency_key("abc")
            .with_payload(json!({"prompt": "two"}));

        let (a, existed_a) = store.create_job(first).await.unwrap();
        let (b, existed_b) = store.create_job(second).await.unwrap();

        assert!(!existed_a);
        assert!(existed_b);
        assert_eq!(a.id, b.id);
        assert_eq!(b.payload, json!({"prompt": "one"}));
        assert_eq!(store.list_events(a.id, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn keys_are_scoped_per_tenant_and_empty_keys_never_collide() {
        let store = InMemoryJobStore::new();
        let (a, _) = store
            .create_job(NewJob::new("t1", "m").with_idempotency_key("k"))
            .await
            .unwrap();
        let (b, existed) = store
            .create_job(NewJob::new("t2", "m").with_idempotency_key("k"))
            .await
            .unwrap();
        assert!(!existed);
        assert_ne!(a.id, b.id);

        let (c, _) = store.create_job(NewJob::new("t1", "m")).await.unwrap();
        let (d, existed) = store
            .create_job(NewJob::new("t1", "m").with_idempotency_key(""))
            .await
            .unwrap();
        assert!(!existed);
        assert_ne!(c.id, d.id);
    }

    #[tokio::test]
    async fn create_rejects_missing_fields() {
        let store = InMemoryJobStore::new();
        let err = store.create_job(NewJob::new("", "m")).await.unwrap_err();
        assert!(matches!(err, JobStoreError::Validation(_)));
    }

    #[tokio::test]
    async fn mark_running_only_moves_queued_jobs() {
        let store = InMemoryJobStore::new();
        let job = queued_job(&store).await;

        let running = store.mark_running(job.id, &worker()).await.unwrap().unwrap();
        assert_eq!(running.status, JobStatus::Running);
        assert_eq!(running.attempt, 1);
        assert!(running.started_at.is_some());

        assert!(store.mark_running(job.id, &worker()).await.unwrap().is_none());
        assert!(store.mark_running(JobId::new(), &worker()).await.unwrap().is_none());
        assert_eq!(store.attempts(job.id).len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_mark_running_has_exactly_one_winner() {
        let store = InMemoryJobStore::arc();
        let job = queued_job(&store).await;

        let mut handles = Vec::new();
        for n in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .mark_running(job.id, &WorkerId::new(format!("w{n}")))
                    .await
                    .unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(store.attempts(job.id).len(), 1);
    }

    #[tokio::test]
    async fn success_finalizes_the_attempt() {
        let store = InMemoryJobStore::new();
        let job = queued_job(&store).await;
        store.mark_running(job.id, &worker()).await.unwrap();
        store.mark_succeeded(job.id, 1, &worker(), &usage()).await.unwrap();

        let (job, latest) = store.get_job(job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
        assert!(job.finished_at.is_some());
        assert_eq!(job.error_code, None);

        let latest = latest.unwrap();
        assert_eq!(latest.success, Some(true));
        assert_eq!(latest.tokens, 321);
        assert_eq!(latest.provider_meta, json!({"provider": "test"}));
    }

    #[tokio::test]
    async fn failure_records_code_on_job_and_attempt() {
        let store = InMemoryJobStore::new();
        let job = queued_job(&store).await;
        store.mark_running(job.id, &worker()).await.unwrap();
        store
            .mark_failed(job.id, 1, &worker(), ErrorCode::ProviderTimeout, "timed out")
            .await
            .unwrap();

        let (job, latest) = store.get_job(job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_code, Some(ErrorCode::ProviderTimeout));
        assert_eq!(job.error_message.as_deref(), Some("timed out"));
        let latest = latest.unwrap();
        assert_eq!(latest.success, Some(false));
        assert_eq!(latest.error_code, Some(ErrorCode::ProviderTimeout));
    }

    #[tokio::test]
    async fn terminal_jobs_accept_no_further_transitions() {
        let store = InMemoryJobStore::new();
        let job = queued_job(&store).await;
        store.mark_running(job.id, &worker()).await.unwrap();
        store.mark_succeeded(job.id, 1, &worker(), &usage()).await.unwrap();

        assert!(store.mark_running(job.id, &worker()).await.unwrap().is_none());
        assert!(matches!(
            store.mark_succeeded(job.id, 1, &worker(), &usage()).await,
            Err(JobStoreError::NotFound(_))
        ));
        assert!(matches!(
            store
                .mark_failed(job.id, 1, &worker(), ErrorCode::ProviderError, "late")
                .await,
            Err(JobStoreError::NotFound(_))
        ));
        assert!(matches!(
            store.cancel_job(job.id, "too late").await,
            Err(JobStoreError::NotFound(_))
        ));

        let (job, _) = store.get_job(job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn completing_a_queued_job_is_not_found() {
        let store = InMemoryJobStore::new();
        let job = queued_job(&store).await;
        let err = store
            .mark_succeeded(job.id, 1, &worker(), &usage())
            .await
            .unwrap_err();
        assert!(matches!(err, JobStoreError::NotFound(_)));
        assert!(store.attempts(job.id).is_empty());
    }

    #[tokio::test]
    async fn cancelling_a_running_job_closes_its_attempt() {
        let store = InMemoryJobStore::new();
        let job = queued_job(&store).await;
        store.mark_running(job.id, &worker()).await.unwrap();

        let cancelled = store.cancel_job(job.id, "Cancelled by operator").await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert_eq!(cancelled.error_code, Some(ErrorCode::Cancelled));

        let attempts = store.attempts(job.id);
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].success, Some(false));
        assert_eq!(attempts[0].error_code, Some(ErrorCode::Cancelled));

        // The worker's late commit loses.
        assert!(matches!(
            store.mark_succeeded(job.id, 1, &worker(), &usage()).await,
            Err(JobStoreError::NotFound(_))
        ));
        assert_eq!(store.attempts(job.id)[0].success, Some(false));
    }

    #[tokio::test]
    async fn retry_requeues_and_keeps_attempt_count() {
        let store = InMemoryJobStore::new();
        let job = queued_job(&store).await;

        assert!(matches!(
            store.retry_job(job.id).await,
            Err(JobStoreError::NotFound(_))
        ));

        store.mark_running(job.id, &worker()).await.unwrap();
        store
            .mark_failed(job.id, 1, &worker(), ErrorCode::ProviderError, "boom")
            .await
            .unwrap();

        let retried = store.retry_job(job.id).await.unwrap();
        assert_eq!(retried.status, JobStatus::Queued);
        assert_eq!(retried.attempt, 1);
        assert_eq!(retried.error_code, None);
        assert_eq!(retried.finished_at, None);

        let again = store.mark_running(job.id, &worker()).await.unwrap().unwrap();
        assert_eq!(again.attempt, 2);
        assert_eq!(store.attempts(job.id).len(), 2);
    }

    #[tokio::test]
    async fn requeued_attempt_cannot_commit_over_its_successor() {
        let store = InMemoryJobStore::new();
        let job = queued_job(&store).await;
        let lost = WorkerId::new("worker-a");
        let next = WorkerId::new("worker-b");

        let first = store.mark_running(job.id, &lost).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let requeued = store.requeue_orphaned(Duration::from_millis(10)).await.unwrap();
        assert_eq!(requeued.len(), 1);
        let second = store.mark_running(job.id, &next).await.unwrap().unwrap();
        assert_eq!((first.attempt, second.attempt), (1, 2));

        // The lost worker wakes up and reports on attempt 1.
        assert!(matches!(
            store.mark_succeeded(job.id, first.attempt, &lost, &usage()).await,
            Err(JobStoreError::NotFound(_))
        ));
        assert!(matches!(
            store
                .mark_failed(job.id, first.attempt, &lost, ErrorCode::ProviderError, "late")
                .await,
            Err(JobStoreError::NotFound(_))
        ));

        let (current, latest) = store.get_job(job.id).await.unwrap();
        assert_eq!(current.status, JobStatus::Running);
        let latest = latest.unwrap();
        assert_eq!(latest.attempt, 2);
        assert_eq!(latest.finished_at, None);
        assert_eq!(latest.success, None);

        store
            .mark_succeeded(job.id, second.attempt, &next, &usage())
            .await
            .unwrap();
        let attempts = store.attempts(job.id);
        assert_eq!(attempts[0].error_code, Some(ErrorCode::WorkerLost));
        assert_eq!(attempts[1].success, Some(true));

        let events = store.list_events(job.id, 20).await.unwrap();
        assert_eq!(events.iter().filter(|e| e.is(EventKind::Succeeded)).count(), 1);
        assert!(events.iter().all(|e| !e.is(EventKind::Failed)));
    }

    #[tokio::test]
    async fn cancelled_and_retried_attempt_cannot_commit_over_its_successor() {
        let store = InMemoryJobStore::new();
        let job = queued_job(&store).await;
        let first = store.mark_running(job.id, &worker()).await.unwrap().unwrap();

        store.cancel_job(job.id, "operator").await.unwrap();
        store.retry_job(job.id).await.unwrap();
        let second = store
            .mark_running(job.id, &WorkerId::new("worker-2"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.attempt, first.attempt + 1);

        assert!(matches!(
            store
                .mark_failed(job.id, first.attempt, &worker(), ErrorCode::ProviderTimeout, "slow")
                .await,
            Err(JobStoreError::NotFound(_))
        ));

        let (current, latest) = store.get_job(job.id).await.unwrap();
        assert_eq!(current.status, JobStatus::Running);
        assert_eq!(current.error_code, None);
        assert_eq!(latest.unwrap().finished_at, None);
        assert_eq!(store.attempts(job.id)[0].error_code, Some(ErrorCode::Cancelled));
    }

    #[tokio::test]
    async fn list_is_newest_first_and_filtered() {
        let store = InMemoryJobStore::new();
        let mut ids = Vec::new();
        for n in 0..4 {
            let tenant = if n % 2 == 0 { "even" } else { "odd" };
            let (job, _) = store.create_job(NewJob::new(tenant, "m")).await.unwrap();
            ids.push(job.id);
        }

        let all = store.list_jobs(&JobFilter::default()).await.unwrap();
        let listed: Vec<_> = all.iter().map(|j| j.id).collect();
        let mut expected = ids.clone();
        expected.reverse();
        assert_eq!(listed, expected);

        let even = store
            .list_jobs(&JobFilter::default().with_tenant("even"))
            .await
            .unwrap();
        assert_eq!(even.len(), 2);
        assert!(even.iter().all(|j| j.tenant_id == "even"));

        let capped = store
            .list_jobs(&JobFilter::default().with_limit(1))
            .await
            .unwrap();
        assert_eq!(capped.len(), 1);
        assert_eq!(capped[0].id, ids[3]);

        assert!(matches!(
            store.list_jobs(&JobFilter::default().with_limit(0)).await,
            Err(JobStoreError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn oldest_first_pages_cover_every_job_once() {
        let store = InMemoryJobStore::new();
        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(queued_job(&store).await.id);
        }

        let mut filter = JobFilter::default().oldest_first().with_limit(2);
        let mut seen = Vec::new();
        loop {
            let page = store.list_jobs(&filter).await.unwrap();
            seen.extend(page.iter().map(|j| j.id));
            match page.last() {
                Some(last) if page.len() == 2 => filter = filter.after(last),
                _ => break,
            }
        }
        assert_eq!(seen, ids);
    }

    #[tokio::test]
    async fn stats_count_every_status() {
        let store = InMemoryJobStore::new();
        let a = queued_job(&store).await;
        let b = queued_job(&store).await;
        queued_job(&store).await;
        store.mark_running(a.id, &worker()).await.unwrap();
        store.cancel_job(b.id, "no").await.unwrap();

        let stats = store.job_stats().await.unwrap();
        assert_eq!(stats.queued, 1);
        assert_eq!(stats.running, 1);
        assert_eq!(stats.cancelled, 1);
        assert_eq!(stats.total(), 3);
    }

    #[tokio::test]
    async fn heartbeats_are_last_write_wins() {
        let store = InMemoryJobStore::new();
        let job_id = JobId::new();
        store
            .upsert_worker_heartbeat(&worker(), WorkerState::Busy, Some(job_id), 2)
            .await
            .unwrap();
        store
            .upsert_worker_heartbeat(&worker(), WorkerState::Idle, None, 2)
            .await
            .unwrap();
        store
            .upsert_worker_heartbeat(&WorkerId::new("a-worker"), WorkerState::Idle, None, 1)
            .await
            .unwrap();

        let workers = store.list_workers().await.unwrap();
        assert_eq!(workers.len(), 2);
        assert_eq!(workers[0].worker_id.as_str(), "a-worker");
        assert_eq!(workers[1].state, WorkerState::Idle);
        assert_eq!(workers[1].running_job_id, None);
    }

    #[tokio::test]
    async fn orphaned_running_jobs_are_requeued() {
        let store = InMemoryJobStore::new();
        let job = queued_job(&store).await;
        store.mark_running(job.id, &worker()).await.unwrap();

        // Freshly started jobs are left alone.
        let requeued = store.requeue_orphaned(Duration::from_secs(60)).await.unwrap();
        assert!(requeued.is_empty());

        tokio::time::sleep(Duration::from_millis(20)).await;
        let requeued = store.requeue_orphaned(Duration::from_millis(10)).await.unwrap();
        assert_eq!(requeued.len(), 1);
        assert_eq!(requeued[0].status, JobStatus::Queued);
        assert_eq!(requeued[0].error_code, Some(ErrorCode::WorkerLost));

        let attempts = store.attempts(job.id);
        assert_eq!(attempts[0].success, Some(false));
        assert_eq!(attempts[0].error_code, Some(ErrorCode::WorkerLost));

        let events = store.list_events(job.id, 10).await.unwrap();
        assert!(events.last().unwrap().is(EventKind::Requeued));
    }

    #[tokio::test]
    async fn live_heartbeat_protects_its_running_job() {
        let store = InMemoryJobStore::new();
        let job = queued_job(&store).await;
        store.mark_running(job.id, &worker()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        store
            .upsert_worker_heartbeat(&worker(), WorkerState::Busy, Some(job.id), 1)
            .await
            .unwrap();

        let requeued = store.requeue_orphaned(Duration::from_secs(5)).await.unwrap();
        assert!(requeued.is_empty());
        let requeued = store
            .requeue_orphaned(Duration::from_millis(20))
            .await
            .unwrap();
        assert!(requeued.is_empty());

        let (job, _) = store.get_job(job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Running);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            ..ProptestConfig::default()
        })]

        /// Property: creating twice with the same (tenant, key) always resolves to
        /// the first job, whatever the second request carries.
        #[test]
        fn idempotent_creation_resolves_to_one_job(
            tenant in "[a-z]{1,8}",
            key in "[a-zA-Z0-9-]{1,16}",
            first_priority in 0i32..10,
            second_priority in 0i32..10,
            prompt in ".{0,24}",
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let store = InMemoryJobStore::new();

            let (first, second) = runtime.block_on(async {
                let first = store
                    .create_job(
                        NewJob::new(tenant.clone(), "m")
                            .with_idempotency_key(key.clone())
                            .with_priority(first_priority),
                    )
                    .await
                    .unwrap();
                let second = store
                    .create_job(
                        NewJob::new(tenant.clone(), "m")
                            .with_idempotency_key(key.clone())
                            .with_priority(second_priority)
                            .with_payload(json!({ "prompt": prompt })),
                    )
                    .await
                    .unwrap();
                (first, second)
            });

            prop_assert!(!first.1);
            prop_assert!(second.1);
            prop_assert_eq!(first.0.id, second.0.id);
            prop_assert_eq!(&first.0, &second.0);
        }
    }
}
