//! Background workers: job execution lanes and the reconciler.

pub mod provider;
pub mod reconciler;
pub mod runner;

pub use provider::{MockProvider, Provider, ProviderError};
pub use reconciler::{ReconcileReport, Reconciler, ReconcilerConfig};
pub use runner::{PollOutcome, WorkerConfig, WorkerRunner, spawn_lanes};
