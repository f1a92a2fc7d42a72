//! Backend wiring for the API process.
//!
//! Two stacks: Postgres + Redis (`USE_PERSISTENT_STORES=true`), or the
//! in-memory store and queue with embedded worker lanes for local runs.

use std::{sync::Arc, time::Duration};

use tokio::{sync::watch, task::JoinHandle};
use tracing::info;

use jobqueue_infra::{
    config::AppConfig,
    jobs::{DynJobService, InMemoryJobStore, JobService, JobStore, JobStoreError, PostgresJobStore},
    queue::{InMemoryLeaseQueue, LeaseQueue, QueueError, RedisLeaseQueue},
    workers::{Provider, Reconciler, ReconcilerConfig, WorkerConfig, spawn_lanes},
};

/// Shared state handed to every handler.
pub struct AppServices {
    pub jobs: DynJobService,
    /// Heartbeat age after which a worker is reported as not live.
    pub worker_stale_after: Duration,
}

impl AppServices {
    pub fn new(jobs: DynJobService, worker_stale_after: Duration) -> Self {
        Self {
            jobs,
            worker_stale_after,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("job store: {0}")]
    Store(#[from] JobStoreError),
    #[error("queue: {0}")]
    Queue(#[from] QueueError),
}

/// Connect Postgres and Redis, apply the schema and check both answer.
pub async fn connect_persistent(config: &AppConfig) -> Result<AppServices, StartupError> {
    let store = PostgresJobStore::connect(&config.database_url).await?;
    store.migrate().await?;
    store.ping().await?;

    let queue = RedisLeaseQueue::connect(
        &config.redis_url,
        Some(config.ready_queue_key.clone()),
        Some(config.lease_ttl),
    )
    .await?;
    queue.ping().await?;
    info!(queue_key = %config.ready_queue_key, "connected to postgres and redis");

    let store: Arc<dyn JobStore> = Arc::new(store);
    let queue: Arc<dyn LeaseQueue> = Arc::new(queue);
    Ok(AppServices::new(
        JobService::new(store, queue),
        config.worker_stale_after,
    ))
}

/// Process-local store and queue.
#[derive(Debug, Clone)]
pub struct InMemoryStack {
    pub store: Arc<InMemoryJobStore>,
    pub queue: Arc<InMemoryLeaseQueue>,
}

impl InMemoryStack {
    pub fn new(lease_ttl: Duration) -> Self {
        Self {
            store: InMemoryJobStore::arc(),
            queue: Arc::new(InMemoryLeaseQueue::with_lease_ttl(lease_ttl)),
        }
    }

    pub fn services(&self, worker_stale_after: Duration) -> AppServices {
        let store: Arc<dyn JobStore> = self.store.clone();
        let queue: Arc<dyn LeaseQueue> = self.queue.clone();
        AppServices::new(JobService::new(store, queue), worker_stale_after)
    }

    /// Run worker lanes and the reconciler against this stack until `shutdown`.
    pub fn spawn_workers<P>(
        &self,
        provider: P,
        worker: WorkerConfig,
        lanes: usize,
        reconciler: ReconcilerConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>>
    where
        P: Provider + Clone + 'static,
    {
        let mut handles = spawn_lanes(
            self.store.clone(),
            self.queue.clone(),
            provider,
            worker,
            lanes,
            shutdown.clone(),
        );
        let reconciler = Reconciler::new(self.store.clone(), self.queue.clone(), reconciler);
        handles.push(tokio::spawn(reconciler.run(shutdown)));
        handles
    }
}
