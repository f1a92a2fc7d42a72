//! Worker process: lanes pulling from Redis and committing to Postgres, plus
//! the reconciler.

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;

use jobqueue_infra::{
    config::AppConfig,
    jobs::{JobStore, PostgresJobStore},
    queue::{LeaseQueue, RedisLeaseQueue},
    workers::{MockProvider, Reconciler, spawn_lanes},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    jobqueue_observability::init();

    let config = AppConfig::from_env().context("invalid configuration")?;

    let store = PostgresJobStore::connect(&config.database_url)
        .await
        .context("failed to connect to postgres")?;
    store.migrate().await.context("failed to apply schema")?;
    store.ping().await.context("postgres ping failed")?;

    let queue = RedisLeaseQueue::connect(
        &config.redis_url,
        Some(config.ready_queue_key.clone()),
        Some(config.lease_ttl),
    )
    .await
    .context("failed to connect to redis")?;
    queue.ping().await.context("redis ping failed")?;

    let store = Arc::new(store);
    let queue = Arc::new(queue);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tracing::info!(
        worker_id = %config.worker_id,
        lanes = config.worker_concurrency,
        queue_key = %queue.ready_key(),
        "worker starting"
    );

    let mut handles = spawn_lanes(
        store.clone(),
        queue.clone(),
        Arc::new(MockProvider::new()),
        config.worker_config(),
        config.worker_concurrency,
        shutdown_rx.clone(),
    );
    let reconciler = Reconciler::new(store, queue, config.reconciler_config());
    handles.push(tokio::spawn(reconciler.run(shutdown_rx)));

    shutdown_signal().await;
    let _ = shutdown_tx.send(true);

    // In-flight jobs finish before their lane exits.
    for handle in handles {
        if let Err(error) = handle.await {
            tracing::error!(error = %error, "worker task panicked");
        }
    }
    tracing::info!("worker stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                tracing::warn!(error = %error, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown requested");
}
