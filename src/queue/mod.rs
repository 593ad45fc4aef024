//! At-least-once delivery of job ids from producers to simulation workers.
//!
//! A dequeued message stays hidden for the visibility timeout. If it is not
//! acknowledged in time it becomes visible again and is redelivered, so
//! consumers must tolerate seeing the same job more than once. A message that
//! comes back after `max_deliveries` deliveries is moved to the dead-letter
//! path instead.

pub mod memory;
pub mod sqlite;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::Result;

pub use memory::InMemoryJobQueue;
pub use sqlite::SqliteJobQueue;

/// Handle proving ownership of one delivery of a message.
///
/// Each delivery gets a fresh receipt; receipts from earlier deliveries are
/// rejected by `acknowledge`, `release` and `extend_visibility`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Receipt(String);

impl Receipt {
    pub(crate) fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Receipt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A delivered message, exclusively owned by its holder until acknowledged,
/// released, or its visibility deadline passes.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub message_id: Uuid,
    pub job_id: Uuid,
    pub receipt: Receipt,
    /// 1 on the first delivery
    pub delivery_count: u32,
    pub visible_until: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeadLetter {
    pub message_id: Uuid,
    pub job_id: Uuid,
    pub delivery_count: u32,
    pub dead_lettered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub visible: usize,
    pub in_flight: usize,
    pub dead_lettered: usize,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Add a message for `job_id`; returns the message id.
    async fn enqueue(&self, job_id: Uuid) -> Result<Uuid>;

    /// Wait up to `max_wait` for a visible message.
    async fn dequeue(&self, max_wait: Duration) -> Result<Option<QueueMessage>>;

    /// Remove a delivered message for good.
    async fn acknowledge(&self, receipt: &Receipt) -> Result<()>;

    /// Give a delivered message back, visible again after `delay`.
    async fn release_after(&self, receipt: &Receipt, delay: Duration) -> Result<()>;

    /// Keep a delivered message hidden for another `extension`, counted from
    /// now. Fails with `InvalidReceipt` once the delivery has expired.
    async fn extend_visibility(&self, receipt: &Receipt, extension: Duration) -> Result<()>;

    /// Give a delivered message back for immediate redelivery.
    async fn release(&self, receipt: &Receipt) -> Result<()> {
        self.release_after(receipt, Duration::ZERO).await
    }

    /// Drain the dead-letter path.
    async fn take_dead_letters(&self) -> Result<Vec<DeadLetter>>;

    async fn stats(&self) -> Result<QueueStats>;

    fn max_deliveries(&self) -> u32;

    fn visibility_timeout(&self) -> Duration;
}
