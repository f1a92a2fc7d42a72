use axum::{
    Router,
    routing::{get, post},
};

pub mod admin;
pub mod jobs;
pub mod system;
pub mod workers;

/// Router for the versioned job endpoints.
pub fn router() -> Router {
    Router::new()
        .nest("/v1/jobs", jobs::router())
        .route("/v1/admin/jobs/:id/retry", post(admin::retry_job))
        .route("/v1/workers", get(workers::list_workers))
        .route("/v1/metrics/summary", get(workers::metrics_summary))
}
