//! Job records and the job store.
//!
//! A [`SimulationJob`] is created `pending` by the submission gateway and is
//! afterwards changed only through [`JobStore::update`], which enforces
//! forward-only status transitions with optimistic concurrency.

pub mod memory;
pub mod model;
pub mod pull_request;
pub mod sqlite;
pub mod store;

pub use memory::InMemoryJobStore;
pub use model::{
    FailureStage, JobStatus, Report, SimulationJob, StepRecord, StepStatus, Verdict,
};
pub use pull_request::PullRequestRef;
pub use sqlite::SqliteJobStore;
pub use store::{JobStore, UpdateOutcome};
