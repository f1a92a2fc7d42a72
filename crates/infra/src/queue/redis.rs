//! Redis-backed lease queue.
//!
//! - **Ready list**: one list key (default `queue:ready`); `LPUSH` to enqueue,
//!   `BRPOP` to dequeue, `LREM 0` to remove, `LPOS` for membership
//! - **Leases**: `SET job:lease:<id> <worker_id> NX PX <ttl_ms>`, released with `DEL`
//!
//! `BRPOP` parks the connection it runs on, so blocking pops use their own
//! connections (kept in a small idle pool) and everything else goes through a
//! shared [`ConnectionManager`].

use std::sync::Mutex;
use std::time::Duration;

use redis::aio::{ConnectionManager, MultiplexedConnection};
use tracing::{debug, instrument};

use jobqueue_core::{JobId, WorkerId};

use super::{DEFAULT_LEASE_TTL, DEFAULT_READY_QUEUE_KEY, LeaseQueue, QueueError, lease_key, parse_entry};

pub struct RedisLeaseQueue {
    client: redis::Client,
    manager: ConnectionManager,
    blocking: Mutex<Vec<MultiplexedConnection>>,
    ready_key: String,
    lease_ttl: Duration,
}

impl core::fmt::Debug for RedisLeaseQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisLeaseQueue")
            .field("ready_key", &self.ready_key)
            .field("lease_ttl", &self.lease_ttl)
            .finish_non_exhaustive()
    }
}

impl RedisLeaseQueue {
    /// Connect to Redis.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - connection URL, credentials and database included
    ///   (e.g. `redis://:secret@localhost:6379/0`)
    /// * `ready_key` - ready-list key (default: `queue:ready`)
    /// * `lease_ttl` - lease TTL (default: 30s)
    pub async fn connect(
        redis_url: impl AsRef<str>,
        ready_key: Option<String>,
        lease_ttl: Option<Duration>,
    ) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| QueueError::Connection(e.to_string()))?;
        let manager = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))?;

        Ok(Self {
            client,
            manager,
            blocking: Mutex::new(Vec::new()),
            ready_key: ready_key.unwrap_or_else(|| DEFAULT_READY_QUEUE_KEY.to_string()),
            lease_ttl: lease_ttl.unwrap_or(DEFAULT_LEASE_TTL),
        })
    }

    pub fn ready_key(&self) -> &str {
        &self.ready_key
    }

    async fn blocking_connection(&self) -> Result<MultiplexedConnection, QueueError> {
        let idle = self.blocking.lock().ok().and_then(|mut pool| pool.pop());
        match idle {
            Some(conn) => Ok(conn),
            None => self
                .client
                .get_multiplexed_async_connection()
                .await
                .map_err(|e| QueueError::Connection(e.to_string())),
        }
    }

    fn return_blocking_connection(&self, conn: MultiplexedConnection) {
        if let Ok(mut pool) = self.blocking.lock() {
            pool.push(conn);
        }
    }
}

fn command_error(op: &str, err: redis::RedisError) -> QueueError {
    if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
        QueueError::Connection(format!("{op}: {err}"))
    } else {
        QueueError::Command(format!("{op}: {err}"))
    }
}

#[async_trait::async_trait]
impl LeaseQueue for RedisLeaseQueue {
    #[instrument(skip(self), fields(queue = %self.ready_key), err)]
    async fn enqueue(&self, job_id: JobId) -> Result<(), QueueError> {
        let mut conn = self.manager.clone();
        let _: i64 = redis::cmd("LPUSH")
            .arg(&self.ready_key)
            .arg(job_id.to_string())
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("LPUSH", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(queue = %self.ready_key), err)]
    async fn remove(&self, job_id: JobId) -> Result<usize, QueueError> {
        let mut conn = self.manager.clone();
        let removed: i64 = redis::cmd("LREM")
            .arg(&self.ready_key)
            .arg(0)
            .arg(job_id.to_string())
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("LREM", e))?;
        Ok(removed.max(0) as usize)
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<JobId>, QueueError> {
        if timeout.is_zero() {
            let mut conn = self.manager.clone();
            let raw: Option<String> = redis::cmd("RPOP")
                .arg(&self.ready_key)
                .query_async(&mut conn)
                .await
                .map_err(|e| command_error("RPOP", e))?;
            return raw.as_deref().map(parse_entry).transpose();
        }

        let mut conn = self.blocking_connection().await?;
        // Nil reply (timeout) decodes to None.
        let popped: Option<(String, String)> = redis::cmd("BRPOP")
            .arg(&self.ready_key)
            .arg(timeout.as_secs_f64())
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("BRPOP", e))?;
        self.return_blocking_connection(conn);

        match popped {
            None => Ok(None),
            Some((_key, raw)) => {
                debug!(queue = %self.ready_key, entry = %raw, "dequeued");
                parse_entry(&raw).map(Some)
            }
        }
    }

    #[instrument(skip(self), fields(worker_id = %worker_id), err)]
    async fn acquire_lease(
        &self,
        job_id: JobId,
        worker_id: &WorkerId,
    ) -> Result<bool, QueueError> {
        let mut conn = self.manager.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(lease_key(job_id))
            .arg(worker_id.as_str())
            .arg("NX")
            .arg("PX")
            .arg(self.lease_ttl.as_millis().max(1) as u64)
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("SET NX", e))?;
        Ok(reply.is_some())
    }

    async fn release_lease(&self, job_id: JobId) -> Result<(), QueueError> {
        let mut conn = self.manager.clone();
        let _: i64 = redis::cmd("DEL")
            .arg(lease_key(job_id))
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("DEL", e))?;
        Ok(())
    }

    async fn contains(&self, job_id: JobId) -> Result<bool, QueueError> {
        let mut conn = self.manager.clone();
        let position: Option<i64> = redis::cmd("LPOS")
            .arg(&self.ready_key)
            .arg(job_id.to_string())
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("LPOS", e))?;
        Ok(position.is_some())
    }

    async fn ping(&self) -> Result<(), QueueError> {
        let mut conn = self.manager.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("PING", e))?;
        Ok(())
    }
}
