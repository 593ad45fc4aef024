use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use uuid::Uuid;

use crate::error::{Result, SimError};
use crate::job::{JobStatus, SimulationJob};

pub const DEFAULT_MAX_UPDATE_ATTEMPTS: u32 = 8;

/// Result of a read-modify-write through [`JobStore::update`].
#[derive(Debug, Clone)]
pub enum UpdateOutcome {
    /// The mutator produced a new record and it was written.
    Updated(SimulationJob),
    /// The mutator declined to change the record; nothing was written.
    Unchanged(SimulationJob),
}

impl UpdateOutcome {
    pub fn job(&self) -> &SimulationJob {
        match self {
            UpdateOutcome::Updated(job) | UpdateOutcome::Unchanged(job) => job,
        }
    }

    pub fn into_job(self) -> SimulationJob {
        match self {
            UpdateOutcome::Updated(job) | UpdateOutcome::Unchanged(job) => job,
        }
    }

    pub fn was_updated(&self) -> bool {
        matches!(self, UpdateOutcome::Updated(_))
    }
}

/// Durable record of job identity, status and report.
///
/// Backends implement the primitive operations; the read-modify-write loop in
/// [`JobStore::update`] is shared so every backend absorbs optimistic
/// concurrency clashes the same way.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job. Fails with `Conflict` if the id is taken.
    async fn create(&self, job: SimulationJob) -> Result<()>;

    /// Fetch a job. Fails with `NotFound` if absent.
    async fn get(&self, job_id: Uuid) -> Result<SimulationJob>;

    /// Write `next` only if the stored version still equals
    /// `expected_version`, otherwise fail with `ConcurrentModification`.
    ///
    /// Implementations must pass the write through [`seal_update`].
    async fn compare_and_swap(&self, expected_version: u64, next: SimulationJob)
        -> Result<SimulationJob>;

    /// Jobs in `status`, optionally only those last written before `updated_before`.
    async fn list_by_status(
        &self,
        status: JobStatus,
        updated_before: Option<DateTime<Utc>>,
    ) -> Result<Vec<SimulationJob>>;

    /// A user's jobs, newest first.
    async fn list_for_user(&self, user_id: &str, limit: usize) -> Result<Vec<SimulationJob>>;

    fn max_update_attempts(&self) -> u32 {
        DEFAULT_MAX_UPDATE_ATTEMPTS
    }

    /// Atomic read-modify-write.
    ///
    /// `mutator` receives the current record and returns the next one, or
    /// `None` to leave it untouched. On a version clash the whole cycle is
    /// retried, so the mutator may run more than once and must be pure.
    async fn update(
        &self,
        job_id: Uuid,
        mutator: &(dyn for<'a> Fn(&'a SimulationJob) -> Option<SimulationJob> + Send + Sync),
    ) -> Result<UpdateOutcome> {
        let attempts = self.max_update_attempts().max(1);
        for attempt in 1..=attempts {
            let current = self.get(job_id).await?;
            let Some(next) = mutator(&current) else {
                return Ok(UpdateOutcome::Unchanged(current));
            };

            match self.compare_and_swap(current.version, next).await {
                Ok(stored) => return Ok(UpdateOutcome::Updated(stored)),
                Err(SimError::ConcurrentModification(_)) => {
                    tracing::debug!(job_id = %job_id, attempt, "Concurrent job update, retrying");
                    tokio::time::sleep(update_backoff(attempt)).await;
                }
                Err(e) => return Err(e),
            }
        }

        tracing::warn!(job_id = %job_id, attempts, "Job update did not converge");
        Err(SimError::Contention { job_id, attempts })
    }
}

/// Small randomized pause between read-modify-write attempts so that
/// contending writers spread out.
fn update_backoff(attempt: u32) -> Duration {
    let ceiling = 2u64.saturating_mul(attempt as u64).max(1);
    Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling))
}

/// Validate `next` against the stored `current` record and stamp it.
///
/// - status must move forward ([`JobStatus::can_transition_to`]);
/// - identity fields and `created_at` are carried over from `current`;
/// - `attempt_count` never decreases;
/// - `report` exists only on terminal records;
/// - `completed_at` is set on the first transition into a terminal status;
/// - `version` and `updated_at` advance.
pub fn seal_update(
    current: &SimulationJob,
    next: SimulationJob,
    now: DateTime<Utc>,
) -> Result<SimulationJob> {
    if next.job_id != current.job_id {
        return Err(SimError::Internal(format!(
            "mutator changed job id {} to {}",
            current.job_id, next.job_id
        )));
    }
    if !current.status.can_transition_to(next.status) {
        return Err(SimError::InvalidTransition {
            job_id: current.job_id,
            from: current.status,
            to: next.status,
        });
    }

    let mut sealed = next;
    sealed.user_id = current.user_id.clone();
    sealed.pr_url = current.pr_url.clone();
    sealed.pull_request = current.pull_request.clone();
    sealed.created_at = current.created_at;
    sealed.attempt_count = sealed.attempt_count.max(current.attempt_count);

    if sealed.status.is_terminal() {
        if sealed.report.is_none() {
            return Err(SimError::Internal(format!(
                "job {} reached {} without a report",
                current.job_id, sealed.status
            )));
        }
        sealed.completed_at = Some(now);
    } else {
        sealed.report = None;
        sealed.completed_at = None;
    }

    sealed.version = current.version + 1;
    sealed.updated_at = now;
    Ok(sealed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{FailureStage, PullRequestRef, Report};

    fn job() -> SimulationJob {
        SimulationJob::new(
            "u1",
            "https://github.com/acme/shop/pull/7",
            PullRequestRef {
                owner: "acme".to_string(),
                repo: "shop".to_string(),
                number: 7,
            },
        )
    }

    #[test]
    fn seal_bumps_version_and_timestamp() {
        let current = job();
        let now = Utc::now() + chrono::Duration::seconds(5);
        let sealed = seal_update(&current, current.claimed(), now).unwrap();
        assert_eq!(sealed.version, current.version + 1);
        assert_eq!(sealed.updated_at, now);
        assert_eq!(sealed.status, JobStatus::Running);
        assert!(sealed.completed_at.is_none());
    }

    #[test]
    fn seal_sets_completed_at_on_terminal_transition() {
        let current = job().claimed();
        let now = Utc::now();
        let next = current.finished(
            JobStatus::Failed,
            Report::failure(FailureStage::Checkout, "branch missing"),
        );
        let sealed = seal_update(&current, next, now).unwrap();
        assert_eq!(sealed.completed_at, Some(now));
    }

    #[test]
    fn seal_rejects_writes_to_terminal_records() {
        let mut current = job().claimed();
        current.status = JobStatus::Completed;
        current.report = Some(Report::from_steps(Vec::new()));
        let err = seal_update(&current, current.claimed(), Utc::now()).unwrap_err();
        assert!(matches!(err, SimError::InvalidTransition { .. }));
    }

    #[test]
    fn seal_rejects_terminal_without_report() {
        let current = job().claimed();
        let mut next = current.clone();
        next.status = JobStatus::Completed;
        assert!(matches!(
            seal_update(&current, next, Utc::now()),
            Err(SimError::Internal(_))
        ));
    }

    #[test]
    fn seal_preserves_identity_fields() {
        let current = job();
        let mut next = current.claimed();
        next.user_id = "mallory".to_string();
        next.pr_url = "https://github.com/evil/repo/pull/1".to_string();
        next.attempt_count = 0;
        let sealed = seal_update(&current, next, Utc::now()).unwrap();
        assert_eq!(sealed.user_id, "u1");
        assert_eq!(sealed.pr_url, current.pr_url);
        assert_eq!(sealed.attempt_count, current.attempt_count);
    }

    #[test]
    fn seal_strips_report_from_non_terminal_records() {
        let current = job();
        let mut next = current.claimed();
        next.report = Some(Report::from_steps(Vec::new()));
        let sealed = seal_update(&current, next, Utc::now()).unwrap();
        assert!(sealed.report.is_none());
    }
}
