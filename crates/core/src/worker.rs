//! Worker liveness.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::JobError;
use crate::id::{JobId, WorkerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Busy,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Idle => "idle",
            WorkerState::Busy => "busy",
        }
    }
}

impl core::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerState {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(WorkerState::Idle),
            "busy" => Ok(WorkerState::Busy),
            other => Err(JobError::validation(format!("unknown worker state: {other:?}"))),
        }
    }
}

/// Current liveness of one worker identity (not history).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerHeartbeat {
    pub worker_id: WorkerId,
    pub last_heartbeat_at: DateTime<Utc>,
    pub state: WorkerState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub running_job_id: Option<JobId>,
    pub concurrency: i32,
}

impl WorkerHeartbeat {
    /// Whether this heartbeat is recent enough to vouch for `running_job_id`.
    pub fn is_live(&self, now: DateTime<Utc>, stale_after: chrono::Duration) -> bool {
        now - self.last_heartbeat_at < stale_after
    }
}
