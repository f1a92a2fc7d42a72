//! Execution backend boundary.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;

use jobqueue_core::{ErrorCode, Job, Usage};

/// Executes a job's work. Stateless from the queue's point of view.
///
/// The caller bounds every call with its own timeout; implementations do not
/// need to enforce one.
#[async_trait::async_trait]
pub trait Provider: Send + Sync {
    async fn execute(&self, job: &Job) -> Result<Usage, ProviderError>;
}

#[async_trait::async_trait]
impl<P> Provider for Arc<P>
where
    P: Provider + ?Sized,
{
    async fn execute(&self, job: &Job) -> Result<Usage, ProviderError> {
        (**self).execute(job).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    #[error("provider did not answer within {0:?}")]
    Timeout(Duration),
    #[error("provider failed: {0}")]
    Failed(String),
}

impl ProviderError {
    /// Code recorded on the job and attempt.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            ProviderError::Timeout(_) => ErrorCode::ProviderTimeout,
            ProviderError::Failed(_) => ErrorCode::ProviderError,
        }
    }
}

/// Simulated LLM backend: sleeps a random latency and fails some of the time.
#[derive(Debug)]
pub struct MockProvider {
    rng: Mutex<StdRng>,
    min_latency: Duration,
    latency_jitter: Duration,
    failure_rate: f64,
}

impl MockProvider {
    pub const DEFAULT_MIN_LATENCY: Duration = Duration::from_millis(500);
    pub const DEFAULT_LATENCY_JITTER: Duration = Duration::from_millis(1400);
    pub const DEFAULT_FAILURE_RATE: f64 = 0.2;
    pub const COST_PER_TOKEN_USD: f64 = 0.00001;

    pub fn new() -> Self {
        Self::from_rng(StdRng::from_entropy())
    }

    /// Deterministic provider for tests.
    pub fn with_seed(seed: u64) -> Self {
        Self::from_rng(StdRng::seed_from_u64(seed))
    }

    fn from_rng(rng: StdRng) -> Self {
        Self {
            rng: Mutex::new(rng),
            min_latency: Self::DEFAULT_MIN_LATENCY,
            latency_jitter: Self::DEFAULT_LATENCY_JITTER,
            failure_rate: Self::DEFAULT_FAILURE_RATE,
        }
    }

    /// Latency is drawn from `[min, min + jitter)`.
    pub fn with_latency(mut self, min: Duration, jitter: Duration) -> Self {
        self.min_latency = min;
        self.latency_jitter = jitter;
        self
    }

    pub fn with_failure_rate(mut self, failure_rate: f64) -> Self {
        self.failure_rate = failure_rate.clamp(0.0, 1.0);
        self
    }

    fn draw(&self) -> Result<(Duration, bool, i64), ProviderError> {
        let mut rng = self
            .rng
            .lock()
            .map_err(|_| ProviderError::Failed("mock provider rng poisoned".to_string()))?;
        let jitter_ms = self.latency_jitter.as_millis() as u64;
        let latency = self.min_latency
            + Duration::from_millis(if jitter_ms == 0 { 0 } else { rng.gen_range(0..jitter_ms) });
        let fails = rng.gen_bool(self.failure_rate);
        let tokens = rng.gen_range(200..700);
        Ok((latency, fails, tokens))
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Provider for MockProvider {
    async fn execute(&self, job: &Job) -> Result<Usage, ProviderError> {
        let (latency, fails, tokens) = self.draw()?;
        tokio::time::sleep(latency).await;

        if fails {
            return Err(ProviderError::Failed(format!(
                "mock provider rejected model {}",
                job.model
            )));
        }
        Ok(Usage {
            tokens,
            cost_usd: tokens as f64 * Self::COST_PER_TOKEN_USD,
            provider_meta: json!({
                "provider": "mock-llm",
                "latency_source": "simulated",
                "model": job.model,
            }),
        })
    }
}
