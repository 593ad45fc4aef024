use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{Result, SimError};
use crate::job::{JobStatus, JobStore, PullRequestRef, Report, SimulationJob};
use crate::queue::JobQueue;

/// Largest page returned by [`SubmissionGateway::list`].
pub const MAX_LIST_LIMIT: usize = 100;

/// Read-side projection of a job, as returned to its owner.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobView {
    pub job_id: Uuid,
    pub user_id: String,
    pub pr_url: String,
    pub status: JobStatus,
    pub is_terminal: bool,
    pub attempt_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<Report>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<SimulationJob> for JobView {
    fn from(job: SimulationJob) -> Self {
        Self {
            job_id: job.job_id,
            is_terminal: job.is_terminal(),
            user_id: job.user_id,
            pr_url: job.pr_url,
            status: job.status,
            attempt_count: job.attempt_count,
            report: job.report,
            created_at: job.created_at,
            updated_at: job.updated_at,
            completed_at: job.completed_at,
        }
    }
}

/// Front door for creating jobs and reading them back.
#[derive(Clone)]
pub struct SubmissionGateway {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn JobQueue>,
}

impl SubmissionGateway {
    pub fn new(store: Arc<dyn JobStore>, queue: Arc<dyn JobQueue>) -> Self {
        Self { store, queue }
    }

    /// Validate `pr_url`, create a `pending` job and enqueue it.
    ///
    /// Every call creates a new job, even for a PR that already has one.
    /// If the enqueue fails the job stays `pending` and the watchdog
    /// enqueues it later.
    pub async fn submit(&self, user_id: &str, pr_url: &str) -> Result<SimulationJob> {
        let user_id = user_id.trim();
        if user_id.is_empty() {
            return Err(SimError::InvalidRequest("user_id cannot be empty".to_string()));
        }
        let pull_request = PullRequestRef::parse(pr_url)?;
        let job = SimulationJob::new(user_id, pr_url.trim(), pull_request);
        self.store.create(job.clone()).await?;

        if let Err(e) = self.queue.enqueue(job.job_id).await {
            tracing::warn!(job_id = %job.job_id, error = %e, "Enqueue failed, leaving job for the watchdog");
        } else {
            tracing::info!(job_id = %job.job_id, user_id, pull_request = %job.pull_request, "Simulation submitted");
        }
        Ok(job)
    }

    /// A job as seen by `user_id`. Other users' jobs are `AccessDenied`.
    pub async fn report(&self, job_id: Uuid, user_id: &str) -> Result<JobView> {
        let job = self.store.get(job_id).await?;
        if job.user_id != user_id {
            return Err(SimError::AccessDenied(job_id));
        }
        Ok(job.into())
    }

    /// A user's jobs, newest first.
    pub async fn list(&self, user_id: &str, limit: usize) -> Result<Vec<JobView>> {
        let limit = limit.clamp(1, MAX_LIST_LIMIT);
        let jobs = self.store.list_for_user(user_id, limit).await?;
        Ok(jobs.into_iter().map(JobView::from).collect())
    }
}
