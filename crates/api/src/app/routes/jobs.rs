use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query, rejection::JsonRejection},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
};

use jobqueue_core::JobId;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

pub fn router() -> Router {
    Router::new()
        .route("/", post(create_job).get(list_jobs))
        .route("/:id", get(get_job))
        .route("/:id/events", get(list_events))
        .route("/:id/cancel", post(cancel_job))
}

/// Unparseable ids are reported as unknown jobs.
pub fn parse_job_id(raw: &str) -> Result<JobId, axum::response::Response> {
    raw.parse::<JobId>().map_err(|_| errors::not_found())
}

pub async fn create_job(
    Extension(services): Extension<Arc<AppServices>>,
    headers: HeaderMap,
    body: Result<Json<dto::CreateJobRequest>, JsonRejection>,
) -> axum::response::Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(_) => {
            return errors::json_error(
                StatusCode::BAD_REQUEST,
                "invalid_json",
                "Request body must be valid JSON",
            );
        }
    };

    let header_key = headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let input = body.into_new_job(header_key);
    if input.tenant_id.is_empty() || input.model.is_empty() {
        return errors::json_error(
            StatusCode::BAD_REQUEST,
            "validation_error",
            "tenant_id and model are required",
        );
    }

    match services.jobs.create_job(input).await {
        Ok((job, idempotent_replay)) => {
            let status = if idempotent_replay {
                StatusCode::OK
            } else {
                StatusCode::CREATED
            };
            (
                status,
                Json(dto::CreateJobResponse {
                    job,
                    idempotent_replay,
                }),
            )
                .into_response()
        }
        Err(e) => errors::job_error_to_response(e),
    }
}

pub async fn list_jobs(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<dto::ListJobsQuery>,
) -> axum::response::Response {
    let filter = match query.into_filter() {
        Ok(filter) => filter,
        Err(resp) => return resp,
    };
    match services.jobs.list_jobs(filter).await {
        Ok(jobs) => (StatusCode::OK, Json(dto::ListJobsResponse { jobs })).into_response(),
        Err(e) => errors::job_error_to_response(e),
    }
}

pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match services.jobs.get_job(job_id).await {
        Ok(snapshot) => (StatusCode::OK, Json(snapshot)).into_response(),
        Err(e) => errors::job_error_to_response(e),
    }
}

pub async fn list_events(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    Query(query): Query<dto::LimitQuery>,
) -> axum::response::Response {
    let job_id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let limit = match dto::parse_limit(query.limit.as_deref()) {
        Ok(limit) => limit,
        Err(resp) => return resp,
    };
    match services.jobs.list_events(job_id, limit).await {
        Ok(events) => (StatusCode::OK, Json(dto::ListEventsResponse { events })).into_response(),
        Err(e) => errors::job_error_to_response(e),
    }
}

pub async fn cancel_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match services.jobs.cancel_job(job_id).await {
        Ok(job) => (StatusCode::OK, Json(serde_json::json!({ "job": job }))).into_response(),
        Err(e) => errors::job_error_to_response(e),
    }
}
