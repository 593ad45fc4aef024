use thiserror::Error;
use uuid::Uuid;

use crate::job::JobStatus;

#[derive(Error, Debug)]
pub enum SimError {
    #[error("Job already exists: {0}")]
    Conflict(Uuid),

    #[error("Job not found: {0}")]
    NotFound(Uuid),

    #[error("Job {0} was modified concurrently")]
    ConcurrentModification(Uuid),

    #[error("Job {job_id} update did not converge after {attempts} attempts")]
    Contention { job_id: Uuid, attempts: u32 },

    #[error("Invalid status transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Invalid pull request URL: {0}")]
    InvalidPrUrl(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Access denied to job {0}")]
    AccessDenied(Uuid),

    #[error("Receipt is no longer valid: {0}")]
    InvalidReceipt(String),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, SimError>;

/// Outcome classification for every call into an external collaborator.
///
/// The orchestrator only ever looks at the variant: retryable failures drive
/// queue redelivery, fatal ones fail the job immediately.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollaboratorError {
    #[error("{0}")]
    Retryable(String),

    #[error("{0}")]
    Fatal(String),
}

impl CollaboratorError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Retryable(message.into())
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Retryable(m) | Self::Fatal(m) => m,
        }
    }
}
