//! Infrastructure layer: job store, lease queue, workers, config.

pub mod config;
pub mod jobs;
pub mod queue;
pub mod workers;
