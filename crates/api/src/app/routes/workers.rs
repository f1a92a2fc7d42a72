use std::sync::Arc;

use axum::{Json, extract::Extension, http::StatusCode, response::IntoResponse};
use chrono::Utc;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

async fn worker_views(services: &AppServices) -> Result<Vec<dto::WorkerView>, axum::response::Response> {
    let workers = services
        .jobs
        .list_workers()
        .await
        .map_err(errors::job_error_to_response)?;
    let now = Utc::now();
    let stale_after = chrono::Duration::from_std(services.worker_stale_after)
        .unwrap_or_else(|_| chrono::Duration::days(36_500));
    Ok(workers
        .into_iter()
        .map(|heartbeat| dto::WorkerView {
            live: heartbeat.is_live(now, stale_after),
            heartbeat,
        })
        .collect())
}

pub async fn list_workers(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match worker_views(&services).await {
        Ok(workers) => (StatusCode::OK, Json(dto::ListWorkersResponse { workers })).into_response(),
        Err(resp) => resp,
    }
}

pub async fn metrics_summary(
    Extension(services): Extension<Arc<AppServices>>,
) -> axum::response::Response {
    let stats = match services.jobs.job_stats().await {
        Ok(stats) => stats,
        Err(e) => return errors::job_error_to_response(e),
    };
    let workers = match worker_views(&services).await {
        Ok(workers) => workers,
        Err(resp) => return resp,
    };

    let summary = dto::MetricsSummary {
        generated_at: Utc::now(),
        jobs: dto::JobCounts {
            total: stats.total(),
            by_status: stats,
        },
        workers: dto::WorkerCounts::from_views(&workers),
    };
    (StatusCode::OK, Json(summary)).into_response()
}
