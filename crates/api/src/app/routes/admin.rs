use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
};

use crate::app::errors;
use crate::app::routes::jobs::parse_job_id;
use crate::app::services::AppServices;

/// Operator retry: send a finished job back to `queued` and enqueue it.
pub async fn retry_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match services.jobs.retry_job(job_id).await {
        Ok(job) => (StatusCode::OK, Json(serde_json::json!({ "job": job }))).into_response(),
        Err(e) => errors::job_error_to_response(e),
    }
}
