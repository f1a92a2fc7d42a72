//! Ready queue plus per-job exclusive leases.
//!
//! ## Queue is a cache of intent, store is truth
//!
//! Queue membership and lease tokens are advisory. A job id can sit in the ready
//! list more than once, can be missing from it while the store says `queued`,
//! and a lease can expire while the job is still `running`. None of that is a
//! correctness problem: the only thing that decides whether a worker may run a
//! job is the store's conditional `queued -> running` transition. The lease just
//! saves the store a round trip when two workers pop the same id.
//!
//! Delivery is therefore at-least-once. The reconciler re-enqueues jobs that
//! fell out of the list.
//!
//! ## Backends
//!
//! - [`InMemoryLeaseQueue`]: in-process, for tests and the dev API stack
//! - `RedisLeaseQueue` (feature `redis`): `LPUSH`/`BRPOP` on one list key,
//!   leases as `SET job:lease:<id> <worker> NX PX <ttl>`

use std::sync::Arc;
use std::time::Duration;

use jobqueue_core::{JobError, JobId, WorkerId};

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use in_memory::InMemoryLeaseQueue;
#[cfg(feature = "redis")]
pub use self::redis::RedisLeaseQueue;

/// Default ready-list key.
pub const DEFAULT_READY_QUEUE_KEY: &str = "queue:ready";

/// Default lease TTL.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(30);

/// Key under which the lease for `job_id` is stored.
pub fn lease_key(job_id: JobId) -> String {
    format!("job:lease:{job_id}")
}

/// Queue backend error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error("queue connection error: {0}")]
    Connection(String),

    #[error("queue command error: {0}")]
    Command(String),

    /// The list held something that is not a job id.
    #[error("queue protocol error: {0}")]
    Protocol(String),
}

impl From<QueueError> for JobError {
    fn from(err: QueueError) -> Self {
        JobError::transient(err.to_string())
    }
}

/// Ready list + lease operations.
///
/// `enqueue` pushes at the head and `dequeue` pops from the tail, so the list
/// is FIFO. Duplicates are permitted.
#[async_trait::async_trait]
pub trait LeaseQueue: Send + Sync {
    /// Push a job id onto the ready list.
    async fn enqueue(&self, job_id: JobId) -> Result<(), QueueError>;

    /// Remove every occurrence of `job_id` from the ready list.
    async fn remove(&self, job_id: JobId) -> Result<usize, QueueError>;

    /// Pop the oldest entry, blocking up to `timeout`.
    ///
    /// `Ok(None)` on timeout is the normal idle case. A zero timeout does not
    /// block.
    async fn dequeue(&self, timeout: Duration) -> Result<Option<JobId>, QueueError>;

    /// Try to take the lease on `job_id` for `worker_id`.
    ///
    /// `false` means another holder has it and it has not expired.
    async fn acquire_lease(&self, job_id: JobId, worker_id: &WorkerId)
    -> Result<bool, QueueError>;

    /// Drop the lease on `job_id`. No-op if there is none.
    async fn release_lease(&self, job_id: JobId) -> Result<(), QueueError>;

    /// Whether `job_id` is currently in the ready list.
    async fn contains(&self, job_id: JobId) -> Result<bool, QueueError>;

    async fn ping(&self) -> Result<(), QueueError>;
}

#[async_trait::async_trait]
impl<Q> LeaseQueue for Arc<Q>
where
    Q: LeaseQueue + ?Sized,
{
    async fn enqueue(&self, job_id: JobId) -> Result<(), QueueError> {
        (**self).enqueue(job_id).await
    }

    async fn remove(&self, job_id: JobId) -> Result<usize, QueueError> {
        (**self).remove(job_id).await
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<JobId>, QueueError> {
        (**self).dequeue(timeout).await
    }

    async fn acquire_lease(
        &self,
        job_id: JobId,
        worker_id: &WorkerId,
    ) -> Result<bool, QueueError> {
        (**self).acquire_lease(job_id, worker_id).await
    }

    async fn release_lease(&self, job_id: JobId) -> Result<(), QueueError> {
        (**self).release_lease(job_id).await
    }

    async fn contains(&self, job_id: JobId) -> Result<bool, QueueError> {
        (**self).contains(job_id).await
    }

    async fn ping(&self) -> Result<(), QueueError> {
        (**self).ping().await
    }
}

/// Parse a raw list entry into a job id.
pub(crate) fn parse_entry(raw: &str) -> Result<JobId, QueueError> {
    raw.parse()
        .map_err(|_| QueueError::Protocol(format!("ready list entry is not a job id: {raw:?}")))
}
