use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::collaborator::DiffStats;
use crate::error::SimError;
use crate::job::PullRequestRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Whether a stored record may move from `self` to `next`.
    ///
    /// Terminal records accept no further writes. `Pending -> Completed` is
    /// refused because a job can only complete after it has been claimed.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        match (self, next) {
            (JobStatus::Completed | JobStatus::Failed, _) => false,
            (JobStatus::Pending, JobStatus::Completed) => false,
            (JobStatus::Running, JobStatus::Pending) => false,
            _ => true,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = SimError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(SimError::Internal(format!("unknown job status '{}'", other))),
        }
    }
}

/// Aggregate outcome of a simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Pass,
    Fail,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verdict::Pass => write!(f, "pass"),
            Verdict::Fail => write!(f, "fail"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pass,
    Fail,
    Skipped,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepStatus::Pass => write!(f, "pass"),
            StepStatus::Fail => write!(f, "fail"),
            StepStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// Pipeline stage a failure is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Checkout,
    PlanGeneration,
    Execution,
}

impl FailureStage {
    /// Inverse of `Display`, used to read the stage back out of `last_error`.
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim() {
            "checkout" => Some(FailureStage::Checkout),
            "plan generation" => Some(FailureStage::PlanGeneration),
            "execution" => Some(FailureStage::Execution),
            _ => None,
        }
    }
}

impl std::fmt::Display for FailureStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureStage::Checkout => write!(f, "checkout"),
            FailureStage::PlanGeneration => write!(f, "plan generation"),
            FailureStage::Execution => write!(f, "execution"),
        }
    }
}

/// One executed (or skipped) test step in a report's log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub index: usize,
    pub step_id: String,
    pub description: String,
    pub status: StepStatus,
    pub detail: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub result: Verdict,
    pub summary: String,
    pub steps: Vec<StepRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_stage: Option<FailureStage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff_stats: Option<DiffStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub head_sha: Option<String>,
}

impl Report {
    /// Report for a job that failed before producing a step log.
    pub fn failure(stage: impl Into<Option<FailureStage>>, summary: impl Into<String>) -> Self {
        Self {
            result: Verdict::Fail,
            summary: summary.into(),
            steps: Vec::new(),
            failure_stage: stage.into(),
            diff_stats: None,
            head_sha: None,
        }
    }

    /// Passing report for a pull request whose diff is empty.
    pub fn no_testable_changes() -> Self {
        Self {
            result: Verdict::Pass,
            summary: "no testable changes".to_string(),
            steps: Vec::new(),
            failure_stage: None,
            diff_stats: None,
            head_sha: None,
        }
    }

    /// Report built from an executed step log. The verdict is `Pass` only
    /// when there is at least one step and every step passed.
    pub fn from_steps(steps: Vec<StepRecord>) -> Self {
        let passed = steps.iter().filter(|s| s.status == StepStatus::Pass).count();
        let result = if !steps.is_empty() && passed == steps.len() {
            Verdict::Pass
        } else {
            Verdict::Fail
        };
        let summary = match result {
            Verdict::Pass => format!("all {} steps passed", steps.len()),
            Verdict::Fail => format!("{} of {} steps passed", passed, steps.len()),
        };
        Self {
            result,
            summary,
            steps,
            failure_stage: None,
            diff_stats: None,
            head_sha: None,
        }
    }

    pub fn with_diff_stats(mut self, stats: DiffStats) -> Self {
        self.diff_stats = Some(stats);
        self
    }

    pub fn with_head_sha(mut self, sha: Option<String>) -> Self {
        self.head_sha = sha;
        self
    }
}

/// A tracked request to simulate one pull request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationJob {
    pub job_id: Uuid,
    pub user_id: String,
    pub pr_url: String,
    pub pull_request: PullRequestRef,
    pub status: JobStatus,
    pub attempt_count: u32,
    pub report: Option<Report>,
    /// Most recent retryable failure, formatted as `"<stage>: <message>"`.
    pub last_error: Option<String>,
    /// Optimistic-concurrency counter, bumped by the store on every write.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl SimulationJob {
    pub fn new(user_id: impl Into<String>, pr_url: impl Into<String>, pull_request: PullRequestRef) -> Self {
        let now = Utc::now();
        Self {
            job_id: Uuid::new_v4(),
            user_id: user_id.into(),
            pr_url: pr_url.into(),
            pull_request,
            status: JobStatus::Pending,
            attempt_count: 0,
            report: None,
            last_error: None,
            version: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Next record for a dequeued attempt: `running`, one more attempt.
    pub fn claimed(&self) -> Self {
        let mut next = self.clone();
        next.status = JobStatus::Running;
        next.attempt_count += 1;
        next
    }

    /// Next record for a terminal outcome.
    pub fn finished(&self, status: JobStatus, report: Report) -> Self {
        debug_assert!(status.is_terminal());
        let mut next = self.clone();
        next.status = status;
        next.report = Some(report);
        next
    }

    pub fn with_last_error(&self, error: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.last_error = Some(error.into());
        next
    }

    /// The stage named by `last_error`, if it was recorded by the orchestrator.
    pub fn last_failed_stage(&self) -> Option<&str> {
        self.last_error
            .as_deref()
            .and_then(|e| e.split_once(':'))
            .map(|(stage, _)| stage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(index: usize, status: StepStatus) -> StepRecord {
        StepRecord {
            index,
            step_id: format!("step-{}", index),
            description: String::new(),
            status,
            detail: None,
            duration_ms: 0,
        }
    }

    fn pr() -> PullRequestRef {
        PullRequestRef {
            owner: "acme".to_string(),
            repo: "shop".to_string(),
            number: 7,
        }
    }

    #[test]
    fn terminal_statuses_accept_no_transitions() {
        for terminal in [JobStatus::Completed, JobStatus::Failed] {
            for next in [
                JobStatus::Pending,
                JobStatus::Running,
                JobStatus::Completed,
                JobStatus::Failed,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn forward_transitions_are_allowed() {
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Failed));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Completed));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Failed));
    }

    #[test]
    fn backward_and_skipping_transitions_are_refused() {
        assert!(!JobStatus::Running.can_transition_to(JobStatus::Pending));
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Completed));
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("queued".parse::<JobStatus>().is_err());
    }

    #[test]
    fn report_passes_only_when_every_step_passes() {
        let report = Report::from_steps(vec![step(1, StepStatus::Pass), step(2, StepStatus::Pass)]);
        assert_eq!(report.result, Verdict::Pass);
        assert_eq!(report.summary, "all 2 steps passed");

        let report = Report::from_steps(vec![
            step(1, StepStatus::Pass),
            step(2, StepStatus::Fail),
            step(3, StepStatus::Pass),
        ]);
        assert_eq!(report.result, Verdict::Fail);
        assert_eq!(report.summary, "2 of 3 steps passed");
    }

    #[test]
    fn skipped_steps_fail_the_report() {
        let report = Report::from_steps(vec![step(1, StepStatus::Pass), step(2, StepStatus::Skipped)]);
        assert_eq!(report.result, Verdict::Fail);
    }

    #[test]
    fn empty_step_log_is_not_a_pass() {
        assert_eq!(Report::from_steps(Vec::new()).result, Verdict::Fail);
    }

    #[test]
    fn claimed_increments_attempts() {
        let job = SimulationJob::new("u1", "https://github.com/acme/shop/pull/7", pr());
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempt_count, 0);

        let next = job.claimed().claimed();
        assert_eq!(next.status, JobStatus::Running);
        assert_eq!(next.attempt_count, 2);
    }

    #[test]
    fn last_failed_stage_reads_prefix() {
        let job = SimulationJob::new("u1", "https://github.com/acme/shop/pull/7", pr())
            .with_last_error("execution: executor timed out");
        assert_eq!(job.last_failed_stage(), Some("execution"));
    }

    #[test]
    fn failure_stage_labels_round_trip() {
        for stage in [FailureStage::Checkout, FailureStage::PlanGeneration, FailureStage::Execution] {
            assert_eq!(FailureStage::from_label(&stage.to_string()), Some(stage));
        }
        assert_eq!(FailureStage::from_label("deploy"), None);
    }

    #[test]
    fn failure_stage_display_names() {
        assert_eq!(FailureStage::Checkout.to_string(), "checkout");
        assert_eq!(FailureStage::PlanGeneration.to_string(), "plan generation");
        assert_eq!(FailureStage::Execution.to_string(), "execution");
    }
}
