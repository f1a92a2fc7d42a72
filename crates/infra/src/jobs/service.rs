//! Job service: store + lease queue orchestration.
//!
//! The store is written first and is the source of truth; queue operations
//! follow and are either surfaced (enqueue) or best effort (remove, release).

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use jobqueue_core::{
    Event, Job, JobError, JobFilter, JobId, JobResult, JobSnapshot, JobStats, NewJob,
    WorkerHeartbeat,
};

use super::store::JobStore;
use crate::queue::LeaseQueue;

/// Reason recorded on operator cancellations.
pub const CANCEL_REASON: &str = "Cancelled by operator";

/// Service over trait objects, as wired by the binaries.
pub type DynJobService = JobService<Arc<dyn JobStore>, Arc<dyn LeaseQueue>>;

/// Backend reachability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Health {
    pub store: bool,
    pub queue: bool,
}

impl Health {
    pub fn is_healthy(&self) -> bool {
        self.store && self.queue
    }
}

#[derive(Debug, Clone)]
pub struct JobService<S, Q> {
    store: S,
    queue: Q,
}

impl<S, Q> JobService<S, Q>
where
    S: JobStore,
    Q: LeaseQueue,
{
    pub fn new(store: S, queue: Q) -> Self {
        Self { store, queue }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn queue(&self) -> &Q {
        &self.queue
    }

    /// Create (or replay) a job and enqueue it if it is new.
    ///
    /// Returns `(job, idempotent_replay)`. If the enqueue fails the job is
    /// still durable; the error is surfaced and the reconciler's stranded-job
    /// sweep picks it up later.
    pub async fn create_job(&self, input: NewJob) -> JobResult<(Job, bool)> {
        input.validate()?;
        let (job, existed) = self.store.create_job(input).await?;

        if !existed {
            self.queue.enqueue(job.id).await.map_err(|e| {
                JobError::transient(format!("job {} stored but not enqueued: {e}", job.id))
            })?;
            info!(job_id = %job.id, tenant_id = %job.tenant_id, "job created");
        }
        Ok((job, existed))
    }

    pub async fn get_job(&self, job_id: JobId) -> JobResult<JobSnapshot> {
        let (job, latest_attempt) = self.store.get_job(job_id).await?;
        Ok(JobSnapshot {
            job,
            latest_attempt,
        })
    }

    pub async fn list_jobs(&self, filter: JobFilter) -> JobResult<Vec<Job>> {
        if filter.limit == 0 {
            return Err(JobError::validation("limit must be a positive integer"));
        }
        Ok(self.store.list_jobs(&filter).await?)
    }

    /// Cancel in the store, then clean the queue up on a best-effort basis.
    pub async fn cancel_job(&self, job_id: JobId) -> JobResult<Job> {
        let job = self.store.cancel_job(job_id, CANCEL_REASON).await?;

        if let Err(error) = self.queue.remove(job_id).await {
            warn!(job_id = %job_id, error = %error, "failed to remove cancelled job from ready queue");
        }
        if let Err(error) = self.queue.release_lease(job_id).await {
            warn!(job_id = %job_id, error = %error, "failed to release cancelled job lease");
        }
        info!(job_id = %job_id, "job cancelled");
        Ok(job)
    }

    /// Send a job back to `queued` and enqueue it exactly once.
    pub async fn retry_job(&self, job_id: JobId) -> JobResult<Job> {
        let job = self.store.retry_job(job_id).await?;

        // De-dup stale entries left by earlier runs before enqueueing.
        if let Err(error) = self.queue.remove(job_id).await {
            warn!(job_id = %job_id, error = %error, "failed to remove stale queued retry job");
        }
        self.queue.enqueue(job_id).await.map_err(|e| {
            JobError::transient(format!("job {job_id} re-queued but not enqueued: {e}"))
        })?;
        info!(job_id = %job_id, attempt = job.attempt, "job retried");
        Ok(job)
    }

    /// Events of an existing job, oldest first.
    pub async fn list_events(&self, job_id: JobId, limit: usize) -> JobResult<Vec<Event>> {
        if limit == 0 {
            return Err(JobError::validation("limit must be a positive integer"));
        }
        self.store.get_job(job_id).await?;
        Ok(self.store.list_events(job_id, limit).await?)
    }

    pub async fn list_workers(&self) -> JobResult<Vec<WorkerHeartbeat>> {
        Ok(self.store.list_workers().await?)
    }

    pub async fn job_stats(&self) -> JobResult<JobStats> {
        Ok(self.store.job_stats().await?)
    }

    pub async fn health(&self) -> Health {
        let store = match self.store.ping().await {
            Ok(()) => true,
            Err(error) => {
                warn!(error = %error, "job store ping failed");
                false
            }
        };
        let queue = match self.queue.ping().await {
            Ok(()) => true,
            Err(error) => {
                warn!(error = %error, "queue ping failed");
                false
            }
        };
        Health { store, queue }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use jobqueue_core::{JobStatus, WorkerId};

    use crate::jobs::InMemoryJobStore;
    use crate::queue::InMemoryLeaseQueue;

    fn service() -> JobService<Arc<InMemoryJobStore>, Arc<InMemoryLeaseQueue>> {
        JobService::new(InMemoryJobStore::arc(), Arc::new(InMemoryLeaseQueue::new()))
    }

    #[tokio::test]
    async fn create_enqueues_only_new_jobs() {
        let service = service();
        let input = NewJob::new("t1", "m").with_idempotency_key("abc");

        let (job, replay) = service.create_job(input.clone()).await.unwrap();
        assert!(!replay);
        let (again, replay) = service.create_job(input).await.unwrap();
        assert!(replay);
        assert_eq!(job.id, again.id);

        assert_eq!(service.queue().len(), 1);
        assert!(service.queue().contains(job.id).await.unwrap());
    }

    #[tokio::test]
    async fn create_validates_before_touching_the_store() {
        let service = service();
        let err = service.create_job(NewJob::new("t1", "")).await.unwrap_err();
        assert!(matches!(err, JobError::Validation(_)));
        assert!(service.queue().is_empty());
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let service = service();
        assert!(matches!(
            service.get_job(JobId::new()).await,
            Err(JobError::NotFound(_))
        ));
        assert!(matches!(
            service.list_events(JobId::new(), 10).await,
            Err(JobError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn cancel_removes_queue_entry_and_lease() {
        let service = service();
        let (job, _) = service.create_job(NewJob::new("t1", "m")).await.unwrap();
        service
            .queue()
            .acquire_lease(job.id, &WorkerId::new("w"))
            .await
            .unwrap();

        let cancelled = service.cancel_job(job.id).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert_eq!(cancelled.error_message.as_deref(), Some(CANCEL_REASON));
        assert!(service.queue().is_empty());
        assert_eq!(service.queue().lease_holder(job.id), None);

        assert!(matches!(
            service.cancel_job(job.id).await,
            Err(JobError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn retry_enqueues_exactly_once() {
        let service = service();
        let (job, _) = service.create_job(NewJob::new("t1", "m")).await.unwrap();
        service.cancel_job(job.id).await.unwrap();

        // A stale duplicate from before the cancel.
        service.queue().enqueue(job.id).await.unwrap();
        service.queue().enqueue(job.id).await.unwrap();

        let retried = service.retry_job(job.id).await.unwrap();
        assert_eq!(retried.status, JobStatus::Queued);
        assert_eq!(service.queue().len(), 1);
        assert_eq!(
            service.queue().dequeue(Duration::ZERO).await.unwrap(),
            Some(job.id)
        );
    }

    #[tokio::test]
    async fn zero_limit_is_rejected() {
        let service = service();
        let err = service
            .list_jobs(JobFilter::default().with_limit(0))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Validation(_)));
    }

    #[tokio::test]
    async fn health_reports_both_backends() {
        let health = service().health().await;
        assert!(health.is_healthy());
    }
}
