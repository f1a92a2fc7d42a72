use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use jobqueue_core::{
    DEFAULT_LIST_LIMIT, Event, Job, JobFilter, JobStats, JobStatus, NewJob, WorkerHeartbeat,
    WorkerState,
};

use crate::app::errors;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Default, Deserialize)]
pub struct CreateJobRequest {
    #[serde(default)]
    pub tenant_id: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub payload: JsonValue,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub max_attempts: i32,
}

impl CreateJobRequest {
    /// The `Idempotency-Key` header wins over the body field.
    pub fn into_new_job(self, header_key: Option<String>) -> NewJob {
        let key = header_key
            .filter(|k| !k.trim().is_empty())
            .or(self.idempotency_key);
        NewJob {
            tenant_id: self.tenant_id.trim().to_string(),
            priority: self.priority,
            model: self.model.trim().to_string(),
            payload: self.payload,
            idempotency_key: key,
            max_attempts: self.max_attempts,
        }
    }
}

/// Query parameters are kept as strings so bad values get our own error body.
#[derive(Debug, Default, Deserialize)]
pub struct ListJobsQuery {
    pub status: Option<String>,
    pub tenant: Option<String>,
    pub model: Option<String>,
    pub limit: Option<String>,
}

impl ListJobsQuery {
    pub fn into_filter(self) -> Result<JobFilter, axum::response::Response> {
        let mut filter = JobFilter::default().with_limit(parse_limit(self.limit.as_deref())?);
        if let Some(status) = non_empty(self.status) {
            let status: JobStatus = status.parse().map_err(|_| {
                errors::json_error(
                    axum::http::StatusCode::BAD_REQUEST,
                    "validation_error",
                    format!("unknown status: {status}"),
                )
            })?;
            filter = filter.with_status(status);
        }
        if let Some(tenant) = non_empty(self.tenant) {
            filter = filter.with_tenant(tenant);
        }
        if let Some(model) = non_empty(self.model) {
            filter = filter.with_model(model);
        }
        Ok(filter)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<String>,
}

/// Absent means the default; anything but a positive integer is rejected.
pub fn parse_limit(raw: Option<&str>) -> Result<usize, axum::response::Response> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(DEFAULT_LIST_LIMIT),
        Some(raw) => match raw.parse::<usize>() {
            Ok(limit) if limit > 0 => Ok(limit),
            _ => Err(errors::json_error(
                axum::http::StatusCode::BAD_REQUEST,
                "validation_error",
                "limit must be a positive integer",
            )),
        },
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct CreateJobResponse {
    pub job: Job,
    pub idempotent_replay: bool,
}

#[derive(Debug, Serialize)]
pub struct ListJobsResponse {
    pub jobs: Vec<Job>,
}

#[derive(Debug, Serialize)]
pub struct ListEventsResponse {
    pub events: Vec<Event>,
}

#[derive(Debug, Serialize)]
pub struct ListWorkersResponse {
    pub workers: Vec<WorkerView>,
}

/// Heartbeat row plus derived liveness.
#[derive(Debug, Serialize)]
pub struct WorkerView {
    #[serde(flatten)]
    pub heartbeat: WorkerHeartbeat,
    pub live: bool,
}

#[derive(Debug, Serialize)]
pub struct MetricsSummary {
    pub generated_at: DateTime<Utc>,
    pub jobs: JobCounts,
    pub workers: WorkerCounts,
}

#[derive(Debug, Serialize)]
pub struct JobCounts {
    #[serde(flatten)]
    pub by_status: JobStats,
    pub total: u64,
}

#[derive(Debug, Default, Serialize)]
pub struct WorkerCounts {
    pub total: usize,
    pub live: usize,
    pub busy: usize,
}

impl WorkerCounts {
    pub fn from_views(views: &[WorkerView]) -> Self {
        views.iter().fold(Self::default(), |mut counts, view| {
            counts.total += 1;
            if view.live {
                counts.live += 1;
                if view.heartbeat.state == WorkerState::Busy {
                    counts.busy += 1;
                }
            }
            counts
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_key_wins_over_body_key() {
        let body = CreateJobRequest {
            tenant_id: " t1 ".into(),
            model: "m".into(),
            idempotency_key: Some("from-body".into()),
            ..CreateJobRequest::default()
        };
        let job = body.into_new_job(Some("from-header".into()));
        assert_eq!(job.idempotency_key.as_deref(), Some("from-header"));
        assert_eq!(job.tenant_id, "t1");

        let body = CreateJobRequest {
            idempotency_key: Some("from-body".into()),
            ..CreateJobRequest::default()
        };
        let job = body.into_new_job(Some("  ".into()));
        assert_eq!(job.idempotency_key.as_deref(), Some("from-body"));
    }

    #[test]
    fn limits() {
        assert_eq!(parse_limit(None).unwrap(), DEFAULT_LIST_LIMIT);
        assert_eq!(parse_limit(Some(" 5 ")).unwrap(), 5);
        assert!(parse_limit(Some("0")).is_err());
        assert!(parse_limit(Some("-1")).is_err());
        assert!(parse_limit(Some("ten")).is_err());
    }

    #[test]
    fn list_query_maps_to_filter() {
        let filter = ListJobsQuery {
            status: Some("running".into()),
            tenant: Some("t1".into()),
            model: Some("".into()),
            limit: None,
        }
        .into_filter()
        .unwrap();
        assert_eq!(filter.status, Some(JobStatus::Running));
        assert_eq!(filter.tenant_id.as_deref(), Some("t1"));
        assert_eq!(filter.model, None);

        assert!(
            ListJobsQuery {
                status: Some("paused".into()),
                ..ListJobsQuery::default()
            }
            .into_filter()
            .is_err()
        );
    }
}
