use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;

use crate::collaborator::{
    Checkout, CheckoutProvider, CollaboratorResult, Diff, PlanGenerator, SimulationExecutor, StepOutcome,
    TestStep, Workspace,
};
use crate::config::WorkerConfig;
use crate::error::{CollaboratorError, Result, SimError};
use crate::job::{
    FailureStage, JobStatus, JobStore, Report, SimulationJob, StepRecord, StepStatus, UpdateOutcome,
};
use crate::queue::{JobQueue, QueueMessage};

/// Visibility is extended this many times per visibility timeout.
const LEASE_RENEWALS_PER_TIMEOUT: u32 = 3;
const MIN_LEASE_PERIOD: Duration = Duration::from_millis(10);

/// The three pipeline collaborators, shared by every worker.
#[derive(Clone)]
pub struct Collaborators {
    pub checkout: Arc<dyn CheckoutProvider>,
    pub planner: Arc<dyn PlanGenerator>,
    pub executor: Arc<dyn SimulationExecutor>,
}

/// What happened to a delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Processed to a terminal status and acknowledged.
    Acknowledged,
    /// Given back to the queue for redelivery.
    Released,
    /// Acknowledged without processing: the job is missing or already terminal.
    Discarded,
}

/// Result of running the pipeline once.
#[derive(Debug)]
enum PipelineOutcome {
    Finished(JobStatus, Report),
    Retry(FailureStage, String),
}

/// Releases a checked-out workspace when dropped, so a cancelled pipeline
/// does not leak working copies.
struct WorkspaceGuard {
    provider: Arc<dyn CheckoutProvider>,
    workspace: Option<Workspace>,
}

impl WorkspaceGuard {
    async fn release(mut self) {
        if let Some(workspace) = self.workspace.take() {
            self.provider.release(&workspace).await;
        }
    }
}

impl Drop for WorkspaceGuard {
    fn drop(&mut self) {
        let Some(workspace) = self.workspace.take() else {
            return;
        };
        let provider = self.provider.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move { provider.release(&workspace).await });
        }
    }
}

/// Drives one job per delivered message through checkout, plan generation and
/// execution, and records the outcome.
pub struct SimulationWorker {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn JobQueue>,
    collaborators: Collaborators,
    config: WorkerConfig,
}

impl SimulationWorker {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn JobQueue>,
        collaborators: Collaborators,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            queue,
            collaborators,
            config,
        }
    }

    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }

    /// Process one delivered message.
    ///
    /// ## Idempotence
    /// A message for a missing or terminal job is acknowledged without calling
    /// any collaborator. A `running` job is a redelivery after a crash or a
    /// retry and restarts from checkout.
    ///
    /// While the pipeline runs, the message's visibility is extended every
    /// third of the visibility timeout, so a slow job is not redelivered to
    /// another worker mid-run.
    ///
    /// ## Failure handling
    /// - Fatal collaborator failures fail the job and acknowledge.
    /// - Retryable failures record `last_error` and release the message with
    ///   exponential backoff, until the delivery that reaches the queue's
    ///   `max_deliveries`, which fails the job instead.
    /// - Store failures release the message so the outcome is retried.
    ///
    /// Errors are returned only when the queue itself cannot be reached.
    pub async fn handle(&self, message: &QueueMessage) -> Result<Disposition> {
        let job_id = message.job_id;

        let job = match self.store.get(job_id).await {
            Ok(job) => job,
            Err(SimError::NotFound(_)) => {
                tracing::warn!(job_id = %job_id, "Message for unknown job, discarding");
                return self.acknowledge(message, Disposition::Discarded).await;
            }
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "Failed to load job");
                return self.release(message).await;
            }
        };
        if job.is_terminal() {
            tracing::debug!(job_id = %job_id, status = %job.status, "Job already terminal, discarding duplicate delivery");
            return self.acknowledge(message, Disposition::Discarded).await;
        }

        let claim = |current: &SimulationJob| (!current.is_terminal()).then(|| current.claimed());
        let job = match self.store.update(job_id, &claim).await {
            Ok(UpdateOutcome::Updated(job)) => job,
            Ok(UpdateOutcome::Unchanged(_)) => {
                return self.acknowledge(message, Disposition::Discarded).await;
            }
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "Failed to claim job");
                return self.release(message).await;
            }
        };

        tracing::info!(
            job_id = %job_id,
            pull_request = %job.pull_request,
            attempt = job.attempt_count,
            delivery = message.delivery_count,
            "Simulation started"
        );

        match self.holding_lease(message, self.run_pipeline(&job)).await {
            PipelineOutcome::Finished(status, report) => self.finish(message, status, report).await,
            PipelineOutcome::Retry(stage, error) => self.retry(message, stage, error).await,
        }
    }

    /// Drive `work` while periodically extending the message's visibility, so
    /// that no other worker receives the job while this one is still on it.
    async fn holding_lease<T>(&self, message: &QueueMessage, work: impl Future<Output = T>) -> T {
        let visibility = self.queue.visibility_timeout();
        let period = (visibility / LEASE_RENEWALS_PER_TIMEOUT).max(MIN_LEASE_PERIOD);
        let mut renew = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        renew.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut held = true;

        tokio::pin!(work);
        loop {
            tokio::select! {
                output = &mut work => return output,
                _ = renew.tick(), if held => {
                    match self.queue.extend_visibility(&message.receipt, visibility).await {
                        Ok(()) => {
                            tracing::trace!(job_id = %message.job_id, "Lease renewed");
                        }
                        Err(e) => {
                            // redelivery can no longer be prevented
                            tracing::warn!(job_id = %message.job_id, error = %e, "Lost lease on message");
                            held = false;
                        }
                    }
                }
            }
        }
    }

    async fn run_pipeline(&self, job: &SimulationJob) -> PipelineOutcome {
        let Checkout { workspace, diff } = match self
            .stage(
                FailureStage::Checkout,
                self.config.checkout_timeout_ms,
                self.collaborators.checkout.checkout(&job.pull_request),
            )
            .await
        {
            Ok(checkout) => checkout,
            Err(outcome) => return outcome,
        };

        let guard = WorkspaceGuard {
            provider: self.collaborators.checkout.clone(),
            workspace: Some(workspace.clone()),
        };
        let outcome = self.run_checked_out(job, &workspace, &diff).await;
        guard.release().await;
        outcome
    }

    async fn run_checked_out(
        &self,
        job: &SimulationJob,
        workspace: &Workspace,
        diff: &Diff,
    ) -> PipelineOutcome {
        let stats = diff.stats();
        let head_sha = workspace.head_sha.clone();

        if diff.is_empty() {
            tracing::info!(job_id = %job.job_id, "Empty diff, nothing to simulate");
            let report = Report::no_testable_changes()
                .with_diff_stats(stats)
                .with_head_sha(head_sha);
            return PipelineOutcome::Finished(JobStatus::Completed, report);
        }

        let plan = match self
            .stage(
                FailureStage::PlanGeneration,
                self.config.plan_timeout_ms,
                self.collaborators.planner.generate(diff),
            )
            .await
        {
            Ok(plan) => plan,
            Err(outcome) => return outcome,
        };
        if plan.is_empty() {
            tracing::error!(job_id = %job.job_id, "Plan generation produced no steps");
            let report = Report::failure(
                FailureStage::PlanGeneration,
                "plan generation failed: no test steps were produced",
            )
            .with_diff_stats(stats)
            .with_head_sha(head_sha);
            return PipelineOutcome::Finished(JobStatus::Failed, report);
        }
        tracing::info!(job_id = %job.job_id, steps = plan.len(), "Test plan generated");

        let outcomes = match self
            .stage(
                FailureStage::Execution,
                self.config.execution_timeout_ms,
                self.collaborators.executor.execute(workspace, &plan.steps),
            )
            .await
        {
            Ok(outcomes) => outcomes,
            Err(outcome) => return outcome,
        };

        let report = Report::from_steps(step_log(&plan.steps, outcomes))
            .with_diff_stats(stats)
            .with_head_sha(head_sha);
        tracing::info!(job_id = %job.job_id, result = %report.result, summary = %report.summary, "Simulation executed");
        PipelineOutcome::Finished(JobStatus::Completed, report)
    }

    /// Run one collaborator call under the stage timeout and classify it.
    async fn stage<T>(
        &self,
        stage: FailureStage,
        timeout_ms: u64,
        call: impl Future<Output = CollaboratorResult<T>>,
    ) -> std::result::Result<T, PipelineOutcome> {
        let result = match tokio::time::timeout(Duration::from_millis(timeout_ms), call).await {
            Ok(result) => result,
            Err(_) => Err(CollaboratorError::retryable(format!(
                "{} timed out after {}ms",
                stage, timeout_ms
            ))),
        };
        match result {
            Ok(value) => Ok(value),
            Err(CollaboratorError::Retryable(message)) => Err(PipelineOutcome::Retry(stage, message)),
            Err(CollaboratorError::Fatal(message)) => {
                let report = Report::failure(stage, format!("{} failed: {}", stage, message));
                Err(PipelineOutcome::Finished(JobStatus::Failed, report))
            }
        }
    }

    async fn finish(&self, message: &QueueMessage, status: JobStatus, report: Report) -> Result<Disposition> {
        let job_id = message.job_id;
        let finished = |current: &SimulationJob| {
            (!current.is_terminal()).then(|| current.finished(status, report.clone()))
        };
        match self.store.update(job_id, &finished).await {
            Ok(UpdateOutcome::Updated(job)) => {
                if status == JobStatus::Failed {
                    tracing::error!(job_id = %job_id, summary = %report.summary, "Simulation failed");
                } else {
                    tracing::info!(job_id = %job_id, result = %report.result, attempts = job.attempt_count, "Simulation completed");
                }
            }
            Ok(UpdateOutcome::Unchanged(job)) => {
                tracing::warn!(job_id = %job_id, status = %job.status, "Job reached a terminal status elsewhere, keeping it");
            }
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "Failed to record outcome");
                return self.release(message).await;
            }
        }
        self.acknowledge(message, Disposition::Acknowledged).await
    }

    async fn retry(&self, message: &QueueMessage, stage: FailureStage, error: String) -> Result<Disposition> {
        let job_id = message.job_id;
        if message.delivery_count >= self.queue.max_deliveries() {
            let summary = format!(
                "{} failed after {} attempts: {}",
                stage, message.delivery_count, error
            );
            tracing::error!(job_id = %job_id, stage = %stage, error = %error, "Retries exhausted");
            return self
                .finish(message, JobStatus::Failed, Report::failure(stage, summary))
                .await;
        }

        tracing::warn!(
            job_id = %job_id,
            stage = %stage,
            delivery = message.delivery_count,
            error = %error,
            "Retryable failure"
        );
        let last_error = format!("{}: {}", stage, error);
        let record = |current: &SimulationJob| {
            (!current.is_terminal()).then(|| current.with_last_error(last_error.clone()))
        };
        if let Err(e) = self.store.update(job_id, &record).await {
            tracing::warn!(job_id = %job_id, error = %e, "Failed to record retryable failure");
        }

        let delay = self.config.retry_delay(message.delivery_count);
        self.release_after(message, delay).await
    }

    async fn acknowledge(&self, message: &QueueMessage, disposition: Disposition) -> Result<Disposition> {
        match self.queue.acknowledge(&message.receipt).await {
            Ok(()) => Ok(disposition),
            Err(SimError::InvalidReceipt(_)) => {
                // the delivery expired and someone else holds the message now
                tracing::warn!(job_id = %message.job_id, "Acknowledge after visibility timeout");
                Ok(disposition)
            }
            Err(e) => Err(e),
        }
    }

    async fn release(&self, message: &QueueMessage) -> Result<Disposition> {
        let delay = self.config.retry_delay(message.delivery_count);
        self.release_after(message, delay).await
    }

    async fn release_after(&self, message: &QueueMessage, delay: Duration) -> Result<Disposition> {
        match self.queue.release_after(&message.receipt, delay).await {
            Ok(()) | Err(SimError::InvalidReceipt(_)) => Ok(Disposition::Released),
            Err(e) => Err(e),
        }
    }
}

/// Pair plan steps with executor outcomes. Steps without an outcome are
/// recorded as skipped.
fn step_log(steps: &[TestStep], outcomes: Vec<StepOutcome>) -> Vec<StepRecord> {
    let mut by_id: HashMap<String, StepOutcome> = HashMap::with_capacity(outcomes.len());
    for outcome in outcomes {
        by_id.entry(outcome.step_id.clone()).or_insert(outcome);
    }

    steps
        .iter()
        .enumerate()
        .map(|(i, step)| match by_id.remove(&step.id) {
            Some(outcome) => StepRecord {
                index: i + 1,
                step_id: step.id.clone(),
                description: step.description.clone(),
                status: outcome.status,
                detail: outcome.detail,
                duration_ms: outcome.duration_ms,
            },
            None => StepRecord {
                index: i + 1,
                step_id: step.id.clone(),
                description: step.description.clone(),
                status: StepStatus::Skipped,
                detail: Some("no outcome reported by executor".to_string()),
                duration_ms: 0,
            },
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn steps(n: usize) -> Vec<TestStep> {
        (1..=n)
            .map(|i| TestStep::new(format!("s{}", i), format!("step {}", i), json!({})))
            .collect()
    }

    #[test]
    fn step_log_keeps_plan_order() {
        let log = step_log(
            &steps(3),
            vec![
                StepOutcome::pass("s3", 3),
                StepOutcome::fail("s2", "boom", 2),
                StepOutcome::pass("s1", 1),
            ],
        );
        let statuses: Vec<_> = log.iter().map(|r| (r.index, r.status)).collect();
        assert_eq!(
            statuses,
            vec![(1, StepStatus::Pass), (2, StepStatus::Fail), (3, StepStatus::Pass)]
        );
        assert_eq!(log[1].detail.as_deref(), Some("boom"));
    }

    #[test]
    fn missing_outcomes_are_skipped() {
        let log = step_log(&steps(3), vec![StepOutcome::pass("s1", 1)]);
        assert_eq!(log[1].status, StepStatus::Skipped);
        assert_eq!(log[2].status, StepStatus::Skipped);
        assert_eq!(Report::from_steps(log).result, crate::job::Verdict::Fail);
    }

    #[test]
    fn unknown_outcomes_are_ignored() {
        let log = step_log(&steps(1), vec![StepOutcome::pass("s1", 1), StepOutcome::pass("zz", 1)]);
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].status, StepStatus::Pass);
    }
}
