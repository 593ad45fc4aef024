use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::WatchdogConfig;
use crate::error::{Result, SimError};
use crate::job::{FailureStage, JobStatus, JobStore, Report, SimulationJob, UpdateOutcome};
use crate::queue::JobQueue;

/// Counts from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Dead letters drained from the queue
    pub dead_lettered: usize,
    /// Jobs moved to `failed`
    pub failed: usize,
    /// Stale jobs put back on the queue
    pub requeued: usize,
}

/// Reconciles jobs the workers never finished.
///
/// Every write goes through [`JobStore::update`], so racing a worker that
/// just finished a job is a no-op rather than an overwrite.
pub struct Watchdog {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn JobQueue>,
    config: WatchdogConfig,
}

impl Watchdog {
    pub fn new(store: Arc<dyn JobStore>, queue: Arc<dyn JobQueue>, config: WatchdogConfig) -> Self {
        Self { store, queue, config }
    }

    /// Sweep on an interval until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(Duration::from_millis(self.config.sweep_interval_ms));
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    match self.sweep().await {
                        Ok(report) if report != SweepReport::default() => {
                            tracing::info!(
                                dead_lettered = report.dead_lettered,
                                failed = report.failed,
                                requeued = report.requeued,
                                "Watchdog sweep"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => tracing::error!(error = %e, "Watchdog sweep failed"),
                    }
                }
            }
        }
        tracing::debug!("Watchdog stopped");
    }

    pub async fn sweep(&self) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        self.reconcile_dead_letters(&mut report).await?;

        let cutoff = Utc::now() - chrono::Duration::milliseconds(self.config.stale_after_ms as i64);
        self.sweep_running(cutoff, &mut report).await?;
        self.sweep_pending(cutoff, &mut report).await?;
        Ok(report)
    }

    async fn reconcile_dead_letters(&self, report: &mut SweepReport) -> Result<()> {
        for letter in self.queue.take_dead_letters().await? {
            report.dead_lettered += 1;
            let fail = |current: &SimulationJob| {
                if current.is_terminal() {
                    return None;
                }
                let summary = match &current.last_error {
                    Some(error) => format!("retries exhausted: {}", error),
                    None => "delivery attempts exhausted".to_string(),
                };
                let stage = current.last_failed_stage().and_then(FailureStage::from_label);
                Some(current.finished(JobStatus::Failed, Report::failure(stage, summary)))
            };
            if self.apply(letter.job_id, &fail).await?.is_some() {
                tracing::warn!(job_id = %letter.job_id, deliveries = letter.delivery_count, "Dead-lettered job failed");
                report.failed += 1;
            }
        }
        Ok(())
    }

    async fn sweep_running(&self, cutoff: DateTime<Utc>, report: &mut SweepReport) -> Result<()> {
        let max_attempts = self.config.max_attempts;
        for job in self.store.list_by_status(JobStatus::Running, Some(cutoff)).await? {
            let act = |current: &SimulationJob| {
                // re-check: a worker may have touched it since the listing
                if current.status != JobStatus::Running || current.updated_at >= cutoff {
                    return None;
                }
                if current.attempt_count >= max_attempts {
                    let stage = current.last_failed_stage().and_then(FailureStage::from_label);
                    let summary = match stage {
                        Some(stage) => format!("abandoned in {} after {} attempts", stage, current.attempt_count),
                        None => format!("abandoned after {} attempts without progress", current.attempt_count),
                    };
                    Some(current.finished(JobStatus::Failed, Report::failure(stage, summary)))
                } else {
                    Some(current.clone())
                }
            };
            let Some(stored) = self.apply(job.job_id, &act).await? else {
                continue;
            };
            if stored.is_terminal() {
                tracing::warn!(job_id = %job.job_id, attempts = stored.attempt_count, "Stale running job failed");
                report.failed += 1;
            } else {
                self.queue.enqueue(job.job_id).await?;
                tracing::warn!(job_id = %job.job_id, attempts = stored.attempt_count, "Stale running job re-enqueued");
                report.requeued += 1;
            }
        }
        Ok(())
    }

    async fn sweep_pending(&self, cutoff: DateTime<Utc>, report: &mut SweepReport) -> Result<()> {
        for job in self.store.list_by_status(JobStatus::Pending, Some(cutoff)).await? {
            let touch = |current: &SimulationJob| {
                (current.status == JobStatus::Pending && current.updated_at < cutoff)
                    .then(|| current.clone())
            };
            if self.apply(job.job_id, &touch).await?.is_some() {
                self.queue.enqueue(job.job_id).await?;
                tracing::warn!(job_id = %job.job_id, "Stale pending job re-enqueued");
                report.requeued += 1;
            }
        }
        Ok(())
    }

    /// Run an update and return the stored record if it wrote. Vanished jobs
    /// and transitions lost to a concurrent writer count as no-ops.
    async fn apply(
        &self,
        job_id: Uuid,
        mutator: &(dyn for<'a> Fn(&'a SimulationJob) -> Option<SimulationJob> + Send + Sync),
    ) -> Result<Option<SimulationJob>> {
        match self.store.update(job_id, mutator).await {
            Ok(UpdateOutcome::Updated(job)) => Ok(Some(job)),
            Ok(UpdateOutcome::Unchanged(_)) => Ok(None),
            Err(SimError::NotFound(_)) | Err(SimError::InvalidTransition { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
