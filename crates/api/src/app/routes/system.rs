use std::sync::Arc;

use axum::{Json, extract::Extension, http::StatusCode, response::IntoResponse};

use crate::app::services::AppServices;

/// 200 when the store and the queue both answer, 503 otherwise.
pub async fn healthz(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    let health = services.jobs.health().await;
    if health.is_healthy() {
        (StatusCode::OK, Json(serde_json::json!({ "status": "ok" }))).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "degraded",
                "store": health.store,
                "queue": health.queue,
            })),
        )
            .into_response()
    }
}
