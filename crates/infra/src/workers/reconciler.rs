//! Periodic repair of stale leases and stranded queue entries.
//!
//! Two things can go wrong between the queue and the store:
//!
//! 1. A worker dies mid-job. The lease expires but the job stays `running`
//!    forever. Such jobs are sent back to `queued` (`WORKER_LOST`) and enqueued.
//! 2. A `queued` job is missing from the ready list (enqueue failed after the
//!    insert, or an entry was popped by a worker that died before starting it).
//!    Such jobs are enqueued again.
//!
//! Both repairs are idempotent and safe to run from several processes.

use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use jobqueue_core::{JobFilter, JobResult, JobStatus};

use crate::jobs::JobStore;
use crate::jobs::store::stale_cutoff;
use crate::queue::LeaseQueue;

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Pause between passes; zero disables the loop.
    pub interval: Duration,
    /// Heartbeat grace before a running job is considered orphaned.
    pub stale_after: Duration,
    /// Page size of the stranded sweep.
    pub batch: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            stale_after: Duration::from_secs(60),
            batch: 500,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub requeued_orphans: usize,
    pub reenqueued_stranded: usize,
}

pub struct Reconciler<S, Q> {
    store: S,
    queue: Q,
    config: ReconcilerConfig,
}

impl<S, Q> Reconciler<S, Q>
where
    S: JobStore,
    Q: LeaseQueue,
{
    pub fn new(store: S, queue: Q, config: ReconcilerConfig) -> Self {
        Self {
            store,
            queue,
            config,
        }
    }

    /// One repair pass.
    pub async fn reconcile_once(&self) -> JobResult<ReconcileReport> {
        let mut report = ReconcileReport::default();

        let orphans = self.store.requeue_orphaned(self.config.stale_after).await?;
        for job in &orphans {
            if let Err(error) = self.queue.release_lease(job.id).await {
                warn!(job_id = %job.id, error = %error, "failed to release orphaned job lease");
            }
            match self.queue.enqueue(job.id).await {
                Ok(()) => info!(job_id = %job.id, attempt = job.attempt, "orphaned job re-queued"),
                // Still `queued` in the store; the sweep below retries it.
                Err(error) => warn!(job_id = %job.id, error = %error, "failed to enqueue orphaned job"),
            }
        }
        report.requeued_orphans = orphans.len();
        report.reenqueued_stranded = self.sweep_stranded().await?;

        Ok(report)
    }

    /// Walk every stale `queued` job oldest first, `batch` per page, and
    /// enqueue the ones missing from the ready list.
    async fn sweep_stranded(&self) -> JobResult<usize> {
        let batch = self.config.batch.max(1);
        let mut filter = JobFilter::default()
            .with_status(JobStatus::Queued)
            .with_created_before(stale_cutoff(Utc::now(), self.config.stale_after))
            .oldest_first()
            .with_limit(batch);
        let mut reenqueued = 0;

        loop {
            let page = self.store.list_jobs(&filter).await?;
            for job in &page {
                match self.queue.contains(job.id).await {
                    Ok(true) => {}
                    Ok(false) => match self.queue.enqueue(job.id).await {
                        Ok(()) => {
                            info!(job_id = %job.id, "stranded job re-enqueued");
                            reenqueued += 1;
                        }
                        Err(error) => warn!(job_id = %job.id, error = %error, "failed to enqueue stranded job"),
                    },
                    Err(error) => warn!(job_id = %job.id, error = %error, "queue membership check failed"),
                }
            }
            match page.last() {
                Some(last) if page.len() == batch => filter = filter.after(last),
                _ => return Ok(reenqueued),
            }
        }
    }

    /// Run passes every `interval` until `shutdown` turns `true`.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        if self.config.interval.is_zero() {
            info!("reconciler disabled");
            return;
        }
        info!(interval = ?self.config.interval, stale_after = ?self.config.stale_after, "reconciler started");

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            if *shutdown.borrow() {
                break;
            }

            match self.reconcile_once().await {
                Ok(report) => debug!(?report, "reconcile pass finished"),
                Err(error) => error!(error = %error, "reconcile pass failed"),
            }
        }
        info!("reconciler stopped");
    }
}
