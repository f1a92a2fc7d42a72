use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;

use jobqueue_api::app::{build_app, services};
use jobqueue_infra::{config::AppConfig, workers::MockProvider};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    jobqueue_observability::init();

    let config = AppConfig::from_env().context("invalid configuration")?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut background = Vec::new();
    let services = if config.use_persistent_stores {
        services::connect_persistent(&config)
            .await
            .context("failed to connect backends")?
    } else {
        tracing::warn!("USE_PERSISTENT_STORES not set; running in-memory stack with embedded mock worker");
        let stack = services::InMemoryStack::new(config.lease_ttl);
        background = stack.spawn_workers(
            Arc::new(MockProvider::new()),
            config.worker_config(),
            config.worker_concurrency,
            config.reconciler_config(),
            shutdown_rx,
        );
        stack.services(config.worker_stale_after)
    };

    let app = build_app(Arc::new(services));

    let listener = tokio::net::TcpListener::bind(&config.http_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.http_addr))?;

    tracing::info!(addr = %listener.local_addr()?, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    let _ = shutdown_tx.send(true);
    for handle in background {
        let _ = handle.await;
    }
    tracing::info!("api stopped");
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
