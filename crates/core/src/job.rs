//! Job entity, status lifecycle and creation input.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::attempt::JobAttempt;
use crate::error::JobError;
use crate::id::{JobId, TraceId};

/// Priority applied when the caller sends none (or a non-positive one).
pub const DEFAULT_PRIORITY: i32 = 3;

/// Attempt budget applied when the caller sends none (or a non-positive one).
pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;

/// Page size used by listings when the caller does not ask for one.
pub const DEFAULT_LIST_LIMIT: usize = 100;

/// Job lifecycle status.
///
/// `queued → running → {succeeded | failed | retry_scheduled | dlq | cancelled}`;
/// `retry_scheduled` (like the other terminal states) re-enters `queued` only
/// through an explicit retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    RetryScheduled,
    Dlq,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 7] = [
        JobStatus::Queued,
        JobStatus::Running,
        JobStatus::Succeeded,
        JobStatus::Failed,
        JobStatus::RetryScheduled,
        JobStatus::Dlq,
        JobStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::RetryScheduled => "retry_scheduled",
            JobStatus::Dlq => "dlq",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// `queued` and `running` are the only actionable states.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Queued | JobStatus::Running)
    }

    /// States an operator may cancel from.
    pub fn is_cancellable(&self) -> bool {
        matches!(
            self,
            JobStatus::Queued | JobStatus::Running | JobStatus::RetryScheduled
        )
    }

    /// States an operator may send back to `queued`.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            JobStatus::Failed | JobStatus::RetryScheduled | JobStatus::Dlq | JobStatus::Cancelled
        )
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| JobError::validation(format!("unknown job status: {s:?}")))
    }
}

/// Failure classification recorded on jobs and attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Provider did not answer within the configured timeout.
    ProviderTimeout,
    /// Provider answered with an error.
    ProviderError,
    /// Operator cancelled the job.
    Cancelled,
    /// The worker running the job stopped heartbeating.
    WorkerLost,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ProviderTimeout => "PROVIDER_TIMEOUT",
            ErrorCode::ProviderError => "PROVIDER_ERROR",
            ErrorCode::Cancelled => "CANCELLED",
            ErrorCode::WorkerLost => "WORKER_LOST",
        }
    }
}

impl core::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorCode {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PROVIDER_TIMEOUT" => Ok(ErrorCode::ProviderTimeout),
            "PROVIDER_ERROR" => Ok(ErrorCode::ProviderError),
            "CANCELLED" => Ok(ErrorCode::Cancelled),
            "WORKER_LOST" => Ok(ErrorCode::WorkerLost),
            other => Err(JobError::validation(format!("unknown error code: {other:?}"))),
        }
    }
}

/// A unit of tenant work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub tenant_id: String,
    pub status: JobStatus,
    pub priority: i32,
    pub model: String,
    pub payload: JsonValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    /// Executions started so far.
    pub attempt: i32,
    pub max_attempts: i32,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub trace_id: TraceId,
}

impl Job {
    /// Build a freshly queued job from normalized input.
    pub fn queued(input: NewJob, now: DateTime<Utc>) -> Self {
        let input = input.normalized();
        Self {
            id: JobId::new(),
            tenant_id: input.tenant_id,
            status: JobStatus::Queued,
            priority: input.priority,
            model: input.model,
            payload: input.payload,
            idempotency_key: input.idempotency_key,
            attempt: 0,
            max_attempts: input.max_attempts,
            created_at: now,
            started_at: None,
            finished_at: None,
            error_code: None,
            error_message: None,
            trace_id: TraceId::new(),
        }
    }

    pub fn clear_error(&mut self) {
        self.error_code = None;
        self.error_message = None;
    }
}

/// Creation request for a job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub tenant_id: String,
    #[serde(default)]
    pub priority: i32,
    pub model: String,
    #[serde(default)]
    pub payload: JsonValue,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub max_attempts: i32,
}

impl NewJob {
    pub fn new(tenant_id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            model: model.into(),
            ..Default::default()
        }
    }

    pub fn with_payload(mut self, payload: JsonValue) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Apply creation defaults.
    ///
    /// Non-positive priority/max_attempts fall back to their defaults, a null or
    /// empty payload becomes `{}`, and an empty idempotency key means "none".
    pub fn normalized(mut self) -> Self {
        if self.priority <= 0 {
            self.priority = DEFAULT_PRIORITY;
        }
        if self.max_attempts <= 0 {
            self.max_attempts = DEFAULT_MAX_ATTEMPTS;
        }
        let empty_payload = match &self.payload {
            JsonValue::Null => true,
            JsonValue::String(s) => s.is_empty(),
            _ => false,
        };
        if empty_payload {
            self.payload = JsonValue::Object(Default::default());
        }
        self.idempotency_key = self.idempotency_key.filter(|key| !key.is_empty());
        self
    }

    /// Required-field validation (tenant and model).
    pub fn validate(&self) -> Result<(), JobError> {
        if self.tenant_id.trim().is_empty() || self.model.trim().is_empty() {
            return Err(JobError::validation("tenant_id and model are required"));
        }
        Ok(())
    }
}

/// A job plus its most recent attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub job: Job,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_attempt: Option<JobAttempt>,
}

/// Listing criteria; empty criteria do not filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub tenant_id: Option<String>,
    pub model: Option<String>,
    /// Only jobs created strictly before this instant.
    pub created_before: Option<DateTime<Utc>>,
    /// `created_at ASC, id ASC` instead of newest first.
    pub oldest_first: bool,
    /// Keyset cursor: only jobs strictly past this `(created_at, id)` in
    /// listing order.
    pub after: Option<(DateTime<Utc>, JobId)>,
    pub limit: usize,
}

impl Default for JobFilter {
    fn default() -> Self {
        Self {
            status: None,
            tenant_id: None,
            model: None,
            created_before: None,
            oldest_first: false,
            after: None,
            limit: DEFAULT_LIST_LIMIT,
        }
    }
}

impl JobFilter {
    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_created_before(mut self, cutoff: DateTime<Utc>) -> Self {
        self.created_before = Some(cutoff);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn oldest_first(mut self) -> Self {
        self.oldest_first = true;
        self
    }

    /// Resume after the last job of the previous page.
    pub fn after(mut self, job: &Job) -> Self {
        self.after = Some((job.created_at, job.id));
        self
    }

    /// Drop empty string criteria so they do not filter.
    pub fn normalized(mut self) -> Self {
        self.tenant_id = self.tenant_id.filter(|t| !t.is_empty());
        self.model = self.model.filter(|m| !m.is_empty());
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.status.is_none_or(|s| job.status == s)
            && self.tenant_id.as_deref().is_none_or(|t| job.tenant_id == t)
            && self.model.as_deref().is_none_or(|m| job.model == m)
            && self.created_before.is_none_or(|cutoff| job.created_at < cutoff)
            && self.after.is_none_or(|cursor| self.is_past(job, cursor))
    }

    fn is_past(&self, job: &Job, cursor: (DateTime<Utc>, JobId)) -> bool {
        let key = (job.created_at, job.id);
        if self.oldest_first { key > cursor } else { key < cursor }
    }

    /// Listing order over `(created_at, id)`.
    pub fn compare(&self, a: &Job, b: &Job) -> std::cmp::Ordering {
        let order = a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id));
        if self.oldest_first { order } else { order.reverse() }
    }
}

/// Number of jobs per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    pub queued: u64,
    pub running: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub retry_scheduled: u64,
    pub dlq: u64,
    pub cancelled: u64,
}

impl JobStats {
    pub fn record(&mut self, status: JobStatus, count: u64) {
        let slot = match status {
            JobStatus::Queued => &mut self.queued,
            JobStatus::Running => &mut self.running,
            JobStatus::Succeeded => &mut self.succeeded,
            JobStatus::Failed => &mut self.failed,
            JobStatus::RetryScheduled => &mut self.retry_scheduled,
            JobStatus::Dlq => &mut self.dlq,
            JobStatus::Cancelled => &mut self.cancelled,
        };
        *slot += count;
    }

    pub fn total(&self) -> u64 {
        self.queued
            + self.running
            + self.succeeded
            + self.failed
            + self.retry_scheduled
            + self.dlq
            + self.cancelled
    }
}
