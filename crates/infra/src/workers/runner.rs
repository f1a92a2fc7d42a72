//! Worker control loop.
//!
//! One lane runs one job at a time:
//!
//! ```text
//! dequeue -> acquire lease -> mark_running -> provider (bounded) -> commit -> release lease
//! ```
//!
//! Heartbeats report `idle`/`busy` and the running job, and keep flowing while
//! the provider works. Shutdown is only observed between iterations, so an
//! in-flight dequeue or provider call always runs to completion.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use jobqueue_core::{ErrorCode, Job, JobError, JobId, Usage, WorkerId, WorkerState};

use super::provider::{Provider, ProviderError};
use crate::jobs::{JobStore, JobStoreError};
use crate::queue::LeaseQueue;

/// Lane settings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Identity written to heartbeats, leases and events.
    pub worker_id: WorkerId,
    /// Lanes in the owning process (reported in heartbeats).
    pub concurrency: i32,
    pub provider_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub dequeue_timeout: Duration,
    /// Pause after a dequeue-layer error and between commit retries.
    pub error_backoff: Duration,
    /// Tries for a terminal commit that fails with a transient store error.
    pub commit_attempts: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: WorkerId::new("worker-1"),
            concurrency: 1,
            provider_timeout: Duration::from_secs(8),
            heartbeat_interval: Duration::from_secs(5),
            dequeue_timeout: Duration::from_secs(2),
            error_backoff: Duration::from_millis(750),
            commit_attempts: 3,
        }
    }
}

impl WorkerConfig {
    /// Config for lane `lane` out of `lanes`.
    pub fn for_lane(&self, lane: usize, lanes: usize) -> Self {
        Self {
            worker_id: self.worker_id.lane(lane, lanes),
            concurrency: lanes as i32,
            ..self.clone()
        }
    }
}

/// What a single poll did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// Nothing arrived before the dequeue timeout.
    Idle,
    /// Another worker holds the lease.
    LeaseHeld(JobId),
    /// The job was not `queued` any more (duplicate entry, cancelled, done).
    Skipped(JobId),
    Succeeded(JobId),
    Failed { job_id: JobId, code: ErrorCode },
    /// The job left `running` while we worked (e.g. cancelled); result dropped.
    Abandoned(JobId),
    /// The terminal commit kept failing; the job stays `running` for the reconciler.
    Uncommitted(JobId),
}

#[derive(Debug)]
struct LaneState {
    state: WorkerState,
    running_job_id: Option<JobId>,
    last_heartbeat: Option<Instant>,
}

/// One sequential worker lane.
pub struct WorkerRunner<S, Q, P> {
    store: S,
    queue: Q,
    provider: P,
    config: WorkerConfig,
    lane: LaneState,
}

impl<S, Q, P> WorkerRunner<S, Q, P>
where
    S: JobStore,
    Q: LeaseQueue,
    P: Provider,
{
    pub fn new(store: S, queue: Q, provider: P, config: WorkerConfig) -> Self {
        Self {
            store,
            queue,
            provider,
            config,
            lane: LaneState {
                state: WorkerState::Idle,
                running_job_id: None,
                last_heartbeat: None,
            },
        }
    }

    /// Run until `shutdown` turns `true`, then report idle one last time.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(worker_id = %self.config.worker_id, "worker lane started");
        self.heartbeat().await;

        while !*shutdown.borrow() {
            if self.heartbeat_due() {
                self.heartbeat().await;
            }

            match self.poll_once().await {
                Ok(outcome) => debug!(worker_id = %self.config.worker_id, ?outcome, "poll finished"),
                Err(error) => {
                    error!(worker_id = %self.config.worker_id, error = %error, "poll failed");
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.error_backoff) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }

        self.set_idle();
        self.heartbeat().await;
        info!(worker_id = %self.config.worker_id, "worker lane stopped");
    }

    /// One iteration: dequeue, then process whatever arrived.
    ///
    /// Errors are dequeue/lease/start failures; the caller backs off.
    pub async fn poll_once(&mut self) -> Result<PollOutcome, JobError> {
        let Some(job_id) = self.queue.dequeue(self.config.dequeue_timeout).await? else {
            return Ok(PollOutcome::Idle);
        };
        self.process(job_id).await
    }

    async fn process(&mut self, job_id: JobId) -> Result<PollOutcome, JobError> {
        let worker_id = self.config.worker_id.clone();

        if !self.queue.acquire_lease(job_id, &worker_id).await? {
            debug!(job_id = %job_id, worker_id = %worker_id, "lease held elsewhere; skipping");
            return Ok(PollOutcome::LeaseHeld(job_id));
        }

        let job = match self.store.mark_running(job_id, &worker_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                debug!(job_id = %job_id, "job not queued; skipping");
                self.release_lease(job_id).await;
                return Ok(PollOutcome::Skipped(job_id));
            }
            Err(error) => {
                self.release_lease(job_id).await;
                return Err(error.into());
            }
        };

        info!(job_id = %job_id, worker_id = %worker_id, attempt = job.attempt, "job started");
        self.lane.state = WorkerState::Busy;
        self.lane.running_job_id = Some(job_id);
        self.heartbeat().await;

        let result = self.execute(&job).await;
        let outcome = self.commit(&job, &result).await;

        self.release_lease(job_id).await;
        self.set_idle();
        self.heartbeat().await;
        Ok(outcome)
    }

    /// Provider call bounded by `provider_timeout`, heartbeating on schedule meanwhile.
    async fn execute(&mut self, job: &Job) -> Result<Usage, ProviderError> {
        let timeout = self.config.provider_timeout;
        let call = tokio::time::timeout(timeout, self.provider.execute(job));
        tokio::pin!(call);

        let period = self.config.heartbeat_interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                result = &mut call => {
                    return result.unwrap_or(Err(ProviderError::Timeout(timeout)));
                }
                _ = ticker.tick() => {
                    emit_heartbeat(&self.store, &self.config, &mut self.lane).await;
                }
            }
        }
    }

    /// Commit the outcome of the attempt `job` was started as. A superseded
    /// attempt is discarded.
    async fn commit(&self, job: &Job, result: &Result<Usage, ProviderError>) -> PollOutcome {
        let (job_id, attempt) = (job.id, job.attempt);
        let worker_id = &self.config.worker_id;
        let tries = self.config.commit_attempts.max(1);

        for round in 1..=tries {
            let committed = match result {
                Ok(usage) => self.store.mark_succeeded(job_id, attempt, worker_id, usage).await,
                Err(failure) => {
                    self.store
                        .mark_failed(
                            job_id,
                            attempt,
                            worker_id,
                            failure.error_code(),
                            &failure.to_string(),
                        )
                        .await
                }
            };

            match committed {
                Ok(()) => {
                    return match result {
                        Ok(usage) => {
                            info!(job_id = %job_id, tokens = usage.tokens, "job succeeded");
                            PollOutcome::Succeeded(job_id)
                        }
                        Err(failure) => {
                            warn!(job_id = %job_id, error = %failure, "job failed");
                            PollOutcome::Failed {
                                job_id,
                                code: failure.error_code(),
                            }
                        }
                    };
                }
                Err(JobStoreError::NotFound(_)) => {
                    warn!(job_id = %job_id, attempt, "attempt no longer running; result discarded");
                    return PollOutcome::Abandoned(job_id);
                }
                Err(error) if round < tries && JobError::from(error.clone()).is_transient() => {
                    warn!(job_id = %job_id, round, error = %error, "commit failed; retrying");
                    tokio::time::sleep(self.config.error_backoff).await;
                }
                Err(error) => {
                    error!(job_id = %job_id, error = %error, "commit failed; leaving job to the reconciler");
                    return PollOutcome::Uncommitted(job_id);
                }
            }
        }
        PollOutcome::Uncommitted(job_id)
    }

    async fn release_lease(&self, job_id: JobId) {
        if let Err(error) = self.queue.release_lease(job_id).await {
            warn!(job_id = %job_id, error = %error, "failed to release lease");
        }
    }

    fn set_idle(&mut self) {
        self.lane.state = WorkerState::Idle;
        self.lane.running_job_id = None;
    }

    fn heartbeat_due(&self) -> bool {
        self.lane
            .last_heartbeat
            .is_none_or(|at| at.elapsed() >= self.config.heartbeat_interval)
    }

    async fn heartbeat(&mut self) {
        emit_heartbeat(&self.store, &self.config, &mut self.lane).await;
    }
}

async fn emit_heartbeat<S: JobStore>(store: &S, config: &WorkerConfig, lane: &mut LaneState) {
    match store
        .upsert_worker_heartbeat(
            &config.worker_id,
            lane.state,
            lane.running_job_id,
            config.concurrency,
        )
        .await
    {
        Ok(()) => {
            lane.last_heartbeat = Some(Instant::now());
            debug!(
                worker_id = %config.worker_id,
                state = %lane.state,
                running_job_id = ?lane.running_job_id,
                "heartbeat sent"
            );
        }
        Err(error) => error!(worker_id = %config.worker_id, error = %error, "worker heartbeat failed"),
    }
}

/// Spawn `lanes` independent lanes sharing the given backends.
pub fn spawn_lanes<S, Q, P>(
    store: S,
    queue: Q,
    provider: P,
    config: WorkerConfig,
    lanes: usize,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>>
where
    S: JobStore + Clone + 'static,
    Q: LeaseQueue + Clone + 'static,
    P: Provider + Clone + 'static,
{
    let lanes = lanes.max(1);
    (0..lanes)
        .map(|lane| {
            let runner = WorkerRunner::new(
                store.clone(),
                queue.clone(),
                provider.clone(),
                config.for_lane(lane, lanes),
            );
            tokio::spawn(runner.run(shutdown.clone()))
        })
        .collect()
}
