//! `jobqueue-core`: job queue domain model.
//!
//! This crate contains **pure domain** types (no infrastructure concerns):
//! jobs and their status lifecycle, attempts, events, worker heartbeats and
//! the shared error taxonomy.

pub mod attempt;
pub mod error;
pub mod event;
pub mod id;
pub mod job;
pub mod worker;

pub use attempt::{JobAttempt, Usage};
pub use error::{JobError, JobResult};
pub use event::{Event, EventKind};
pub use id::{JobId, TraceId, WorkerId};
pub use job::{
    DEFAULT_LIST_LIMIT, DEFAULT_MAX_ATTEMPTS, DEFAULT_PRIORITY, ErrorCode, Job, JobFilter,
    JobSnapshot, JobStats, JobStatus, NewJob,
};
pub use worker::{WorkerHeartbeat, WorkerState};
