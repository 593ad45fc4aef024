//! External collaborators driven by the simulation worker.
//!
//! Each collaborator answers with success, [`CollaboratorError::Retryable`] or
//! [`CollaboratorError::Fatal`]; the worker acts on nothing else.

pub mod diff;
pub mod executor;
pub mod git;
pub mod github;
pub mod planner;

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CollaboratorError;
use crate::job::{PullRequestRef, StepStatus};

pub use diff::{ChangeKind, Diff, DiffStats, FileChange};
pub use executor::SandboxExecutor;
pub use git::GitCheckoutProvider;
pub use github::{GithubClient, PullRequestInfo};
pub use planner::HeuristicPlanGenerator;

pub type CollaboratorResult<T> = std::result::Result<T, CollaboratorError>;

/// A local working copy checked out at the pull request head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    pub path: PathBuf,
    pub pull_request: PullRequestRef,
    pub base_ref: String,
    pub head_ref: String,
    pub head_sha: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Checkout {
    pub workspace: Workspace,
    pub diff: Diff,
}

/// One instruction for the executor. `payload` is opaque to the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestStep {
    pub id: String,
    pub description: String,
    pub payload: serde_json::Value,
}

impl TestStep {
    pub fn new(id: impl Into<String>, description: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            payload,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestPlan {
    pub steps: Vec<TestStep>,
}

impl TestPlan {
    pub fn new(steps: Vec<TestStep>) -> Self {
        Self { steps }
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }
}

/// Result of running one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    pub step_id: String,
    pub status: StepStatus,
    pub detail: Option<String>,
    pub duration_ms: u64,
}

impl StepOutcome {
    pub fn pass(step_id: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Pass,
            detail: None,
            duration_ms,
        }
    }

    pub fn fail(step_id: impl Into<String>, detail: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Fail,
            detail: Some(detail.into()),
            duration_ms,
        }
    }
}

/// Produces a working copy on the PR branch and its diff against the base.
#[async_trait]
pub trait CheckoutProvider: Send + Sync {
    async fn checkout(&self, pull_request: &PullRequestRef) -> CollaboratorResult<Checkout>;

    /// Dispose of a workspace. Failures are logged, never returned.
    async fn release(&self, workspace: &Workspace);
}

#[async_trait]
pub trait PlanGenerator: Send + Sync {
    async fn generate(&self, diff: &Diff) -> CollaboratorResult<TestPlan>;
}

/// Runs a plan against the application built from `workspace`.
///
/// Returns one outcome per step, in step order.
#[async_trait]
pub trait SimulationExecutor: Send + Sync {
    async fn execute(
        &self,
        workspace: &Workspace,
        steps: &[TestStep],
    ) -> CollaboratorResult<Vec<StepOutcome>>;
}
