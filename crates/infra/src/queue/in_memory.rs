//! In-process lease queue for tests/dev.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use jobqueue_core::{JobId, WorkerId};

use super::{DEFAULT_LEASE_TTL, LeaseQueue, QueueError};

#[derive(Debug, Default)]
struct QueueState {
    /// Head is the newest entry; `dequeue` pops from the back.
    ready: VecDeque<JobId>,
    leases: HashMap<JobId, Lease>,
}

#[derive(Debug, Clone)]
struct Lease {
    holder: WorkerId,
    expires_at: Instant,
}

/// In-memory ready list with TTL leases.
///
/// Every operation runs under one mutex that is never held across an await.
/// Blocked dequeuers are woken through a [`Notify`].
#[derive(Debug)]
pub struct InMemoryLeaseQueue {
    state: Mutex<QueueState>,
    ready: Notify,
    lease_ttl: Duration,
}

impl InMemoryLeaseQueue {
    pub fn new() -> Self {
        Self::with_lease_ttl(DEFAULT_LEASE_TTL)
    }

    pub fn with_lease_ttl(lease_ttl: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            ready: Notify::new(),
            lease_ttl,
        }
    }

    /// Number of entries currently in the ready list.
    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.ready.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current lease holder of `job_id`, if the lease has not expired.
    pub fn lease_holder(&self, job_id: JobId) -> Option<WorkerId> {
        let state = self.state.lock().ok()?;
        state
            .leases
            .get(&job_id)
            .filter(|lease| lease.expires_at > Instant::now())
            .map(|lease| lease.holder.clone())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, QueueState>, QueueError> {
        self.state
            .lock()
            .map_err(|_| QueueError::Connection("in-memory queue lock poisoned".to_string()))
    }

    fn try_pop(&self) -> Result<Option<JobId>, QueueError> {
        Ok(self.lock()?.ready.pop_back())
    }
}

impl Default for InMemoryLeaseQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl LeaseQueue for InMemoryLeaseQueue {
    async fn enqueue(&self, job_id: JobId) -> Result<(), QueueError> {
        self.lock()?.ready.push_front(job_id);
        self.ready.notify_waiters();
        Ok(())
    }

    async fn remove(&self, job_id: JobId) -> Result<usize, QueueError> {
        let mut state = self.lock()?;
        let before = state.ready.len();
        state.ready.retain(|id| *id != job_id);
        Ok(before - state.ready.len())
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<JobId>, QueueError> {
        let deadline = Instant::now() + timeout;
        loop {
            // Register interest before checking so an enqueue in between is not missed.
            let notified = self.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(job_id) = self.try_pop()? {
                return Ok(Some(job_id));
            }
            if timeout.is_zero() {
                return Ok(None);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.try_pop();
            }
        }
    }

    async fn acquire_lease(
        &self,
        job_id: JobId,
        worker_id: &WorkerId,
    ) -> Result<bool, QueueError> {
        let now = Instant::now();
        let mut state = self.lock()?;
        if let Some(lease) = state.leases.get(&job_id) {
            if lease.expires_at > now {
                return Ok(false);
            }
        }
        state.leases.insert(
            job_id,
            Lease {
                holder: worker_id.clone(),
                expires_at: now + self.lease_ttl,
            },
        );
        Ok(true)
    }

    async fn release_lease(&self, job_id: JobId) -> Result<(), QueueError> {
        self.lock()?.leases.remove(&job_id);
        Ok(())
    }

    async fn contains(&self, job_id: JobId) -> Result<bool, QueueError> {
        Ok(self.lock()?.ready.contains(&job_id))
    }

    async fn ping(&self) -> Result<(), QueueError> {
        self.lock().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn dequeue_is_fifo() {
        let queue = InMemoryLeaseQueue::new();
        let (a, b, c) = (JobId::new(), JobId::new(), JobId::new());
        for id in [a, b, c] {
            queue.enqueue(id).await.unwrap();
        }

        assert_eq!(queue.dequeue(Duration::ZERO).await.unwrap(), Some(a));
        assert_eq!(queue.dequeue(Duration::ZERO).await.unwrap(), Some(b));
        assert_eq!(queue.dequeue(Duration::ZERO).await.unwrap(), Some(c));
        assert_eq!(queue.dequeue(Duration::ZERO).await.unwrap(), None);
    }

    #[tokio::test]
    async fn empty_dequeue_times_out_with_none() {
        let queue = InMemoryLeaseQueue::new();
        let started = Instant::now();
        let popped = queue.dequeue(Duration::from_millis(50)).await.unwrap();

        assert_eq!(popped, None);
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn blocking_dequeue_wakes_on_enqueue() {
        let queue = Arc::new(InMemoryLeaseQueue::new());
        let job_id = JobId::new();

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.enqueue(job_id).await.unwrap();

        let popped = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("dequeue should wake well before its timeout")
            .unwrap()
            .unwrap();
        assert_eq!(popped, Some(job_id));
    }

    #[tokio::test]
    async fn remove_drops_every_duplicate() {
        let queue = InMemoryLeaseQueue::new();
        let (dup, other) = (JobId::new(), JobId::new());
        queue.enqueue(dup).await.unwrap();
        queue.enqueue(other).await.unwrap();
        queue.enqueue(dup).await.unwrap();

        assert_eq!(queue.remove(dup).await.unwrap(), 2);
        assert!(!queue.contains(dup).await.unwrap());
        assert!(queue.contains(other).await.unwrap());
        assert_eq!(queue.remove(dup).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn lease_is_exclusive_until_released() {
        let queue = InMemoryLeaseQueue::new();
        let job_id = JobId::new();
        let (a, b) = (WorkerId::new("a"), WorkerId::new("b"));

        assert!(queue.acquire_lease(job_id, &a).await.unwrap());
        assert!(!queue.acquire_lease(job_id, &b).await.unwrap());
        assert_eq!(queue.lease_holder(job_id), Some(a.clone()));

        queue.release_lease(job_id).await.unwrap();
        assert!(queue.acquire_lease(job_id, &b).await.unwrap());
        assert_eq!(queue.lease_holder(job_id), Some(b));

        // Releasing twice is fine.
        queue.release_lease(job_id).await.unwrap();
        queue.release_lease(job_id).await.unwrap();
    }

    #[tokio::test]
    async fn lease_can_be_taken_over_after_expiry() {
        let queue = InMemoryLeaseQueue::with_lease_ttl(Duration::from_millis(30));
        let job_id = JobId::new();

        assert!(queue.acquire_lease(job_id, &WorkerId::new("a")).await.unwrap());
        assert!(!queue.acquire_lease(job_id, &WorkerId::new("b")).await.unwrap());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(queue.lease_holder(job_id), None);
        assert!(queue.acquire_lease(job_id, &WorkerId::new("b")).await.unwrap());
    }
}
