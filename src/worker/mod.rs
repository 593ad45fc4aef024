//! Background processing of simulation jobs.
//!
//! # Components
//!
//! - [`SimulationWorker`]: handles one delivered message, driving the job
//!   through `pending -> running -> {completed, failed}`
//! - [`WorkerPool`]: long-polling loops that feed messages to the worker
//! - [`Watchdog`]: periodic reconciliation of dead letters and stale jobs
//!
//! # Retry model
//!
//! Collaborator failures are retried through queue redelivery, bounded by the
//! queue's `max_deliveries`. Store write clashes are retried inside
//! [`JobStore::update`](crate::job::JobStore::update). The two never mix.

pub mod orchestrator;
pub mod pool;
pub mod watchdog;

pub use orchestrator::{Collaborators, Disposition, SimulationWorker};
pub use pool::WorkerPool;
pub use watchdog::{SweepReport, Watchdog};
