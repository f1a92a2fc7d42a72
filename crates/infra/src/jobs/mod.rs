//! Durable job lifecycle.
//!
//! ## Components
//!
//! - `JobStore`: system of record with conditional transitions (in-memory or Postgres)
//! - `JobService`: create/list/get/cancel/retry over a store + lease queue

pub mod postgres;
pub mod service;
pub mod store;

pub use postgres::PostgresJobStore;
pub use service::{CANCEL_REASON, DynJobService, Health, JobService};
pub use store::{InMemoryJobStore, JobStore, JobStoreError};

/// Human-readable notes attached to events.
pub(crate) mod details {
    use jobqueue_core::ErrorCode;

    pub const CREATED: &str = "Job accepted";
    pub const STARTED: &str = "Dequeued and started";
    pub const SUCCEEDED: &str = "Provider returned completion";
    pub const RETRIED: &str = "Manually re-queued by operator";
    pub const WORKER_LOST: &str = "Worker heartbeat lost; job re-queued";

    pub fn failed(code: ErrorCode) -> String {
        format!("Provider execution failed ({code})")
    }
}
