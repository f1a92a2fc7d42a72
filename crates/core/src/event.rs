//! Append-only job event log entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{JobId, WorkerId};

/// Event tags written by the job queue itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Created,
    Started,
    Succeeded,
    Failed,
    Cancelled,
    RetryScheduled,
    Requeued,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Created => "job.created",
            EventKind::Started => "job.started",
            EventKind::Succeeded => "job.succeeded",
            EventKind::Failed => "job.failed",
            EventKind::Cancelled => "job.cancelled",
            EventKind::RetryScheduled => "job.retry_scheduled",
            EventKind::Requeued => "job.requeued",
        }
    }
}

impl core::fmt::Display for EventKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored event. `event_type` is free-form; see [`EventKind`] for the tags
/// the queue emits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<WorkerId>,
    /// Human-readable note.
    pub details: String,
    pub created_at: DateTime<Utc>,
}

impl Event {
    pub fn is(&self, kind: EventKind) -> bool {
        self.event_type == kind.as_str()
    }
}
