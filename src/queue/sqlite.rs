use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::db::{format_ts, parse_ts, Database};
use crate::error::{Result, SimError};
use crate::queue::{DeadLetter, JobQueue, QueueMessage, QueueStats, Receipt};

/// Producers in other processes cannot wake us, so waiting consumers also
/// re-check the table on this interval.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::from_str(raw).map_err(|e| SimError::Internal(format!("bad uuid '{}': {}", raw, e)))
}

/// Move visible messages that used up their deliveries to `dead_letters`.
fn dead_letter_exhausted(conn: &Connection, now_ts: &str, max_deliveries: u32) -> Result<usize> {
    let moved = conn.execute(
        "INSERT OR REPLACE INTO dead_letters (message_id, job_id, delivery_count, dead_lettered_at)
         SELECT message_id, job_id, delivery_count, ?1 FROM queue_messages
         WHERE visible_at <= ?1 AND delivery_count >= ?2",
        params![now_ts, max_deliveries],
    )?;
    if moved > 0 {
        conn.execute(
            "DELETE FROM queue_messages WHERE visible_at <= ?1 AND delivery_count >= ?2",
            params![now_ts, max_deliveries],
        )?;
        tracing::warn!(count = moved, "Messages exhausted their deliveries, moved to dead-letter path");
    }
    Ok(moved)
}

/// Queue persisted in the `queue_messages` / `dead_letters` tables.
#[derive(Clone)]
pub struct SqliteJobQueue {
    db: Database,
    config: QueueConfig,
    notify: Arc<Notify>,
}

impl SqliteJobQueue {
    pub fn new(db: Database, config: QueueConfig) -> Self {
        Self {
            db,
            config,
            notify: Arc::new(Notify::new()),
        }
    }

    /// One scan: dead-letter exhausted messages, then claim the oldest
    /// visible one, all in a single transaction.
    async fn try_claim(&self) -> Result<Option<QueueMessage>> {
        let conn = self.db.connection().lock().await;
        let tx = conn.unchecked_transaction()?;
        let now = Utc::now();
        let now_ts = format_ts(now);

        dead_letter_exhausted(&tx, &now_ts, self.config.max_deliveries)?;

        let candidate: Option<(String, String, u32)> = tx
            .query_row(
                "SELECT message_id, job_id, delivery_count FROM queue_messages
                 WHERE visible_at <= ?1 ORDER BY enqueued_at ASC LIMIT 1",
                params![now_ts],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let Some((message_id, job_id, delivered)) = candidate else {
            tx.commit()?;
            return Ok(None);
        };

        let receipt = Receipt::generate();
        let visible_until =
            now + chrono::Duration::milliseconds(self.config.visibility_timeout_ms as i64);
        let claimed = tx.execute(
            "UPDATE queue_messages SET receipt = ?1, delivery_count = delivery_count + 1, visible_at = ?2
             WHERE message_id = ?3 AND visible_at <= ?4",
            params![receipt.as_str(), format_ts(visible_until), message_id, now_ts],
        )?;
        tx.commit()?;

        if claimed == 0 {
            return Ok(None);
        }

        Ok(Some(QueueMessage {
            message_id: parse_uuid(&message_id)?,
            job_id: parse_uuid(&job_id)?,
            receipt,
            delivery_count: delivered + 1,
            visible_until,
        }))
    }
}

#[async_trait]
impl JobQueue for SqliteJobQueue {
    async fn enqueue(&self, job_id: Uuid) -> Result<Uuid> {
        let message_id = Uuid::new_v4();
        let now = format_ts(Utc::now());
        {
            let conn = self.db.connection().lock().await;
            conn.execute(
                "INSERT INTO queue_messages (message_id, job_id, receipt, delivery_count, visible_at, enqueued_at)
                 VALUES (?1, ?2, NULL, 0, ?3, ?3)",
                params![message_id.to_string(), job_id.to_string(), now],
            )?;
        }
        tracing::debug!(job_id = %job_id, message_id = %message_id, "Message enqueued");
        self.notify.notify_waiters();
        Ok(message_id)
    }

    async fn dequeue(&self, max_wait: Duration) -> Result<Option<QueueMessage>> {
        let deadline = Instant::now() + max_wait;
        loop {
            let notified = self.notify.notified();
            if let Some(message) = self.try_claim().await? {
                tracing::debug!(job_id = %message.job_id, delivery = message.delivery_count, "Message delivered");
                return Ok(Some(message));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let wake_at = (now + POLL_INTERVAL).min(deadline);
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn acknowledge(&self, receipt: &Receipt) -> Result<()> {
        let conn = self.db.connection().lock().await;
        let deleted = conn.execute(
            "DELETE FROM queue_messages WHERE receipt = ?1",
            params![receipt.as_str()],
        )?;
        if deleted == 0 {
            return Err(SimError::InvalidReceipt(receipt.to_string()));
        }
        Ok(())
    }

    async fn extend_visibility(&self, receipt: &Receipt, extension: Duration) -> Result<()> {
        let now = Utc::now();
        let visible_at = now + chrono::Duration::milliseconds(extension.as_millis() as i64);
        let conn = self.db.connection().lock().await;
        let updated = conn.execute(
            "UPDATE queue_messages SET visible_at = ?1 WHERE receipt = ?2 AND visible_at > ?3",
            params![format_ts(visible_at), receipt.as_str(), format_ts(now)],
        )?;
        if updated == 0 {
            return Err(SimError::InvalidReceipt(receipt.to_string()));
        }
        Ok(())
    }

    async fn release_after(&self, receipt: &Receipt, delay: Duration) -> Result<()> {
        let visible_at = Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64);
        {
            let conn = self.db.connection().lock().await;
            let updated = conn.execute(
                "UPDATE queue_messages SET receipt = NULL, visible_at = ?1 WHERE receipt = ?2",
                params![format_ts(visible_at), receipt.as_str()],
            )?;
            if updated == 0 {
                return Err(SimError::InvalidReceipt(receipt.to_string()));
            }
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn take_dead_letters(&self) -> Result<Vec<DeadLetter>> {
        let conn = self.db.connection().lock().await;
        let tx = conn.unchecked_transaction()?;
        // exhausted messages nobody polled for are included too
        dead_letter_exhausted(&tx, &format_ts(Utc::now()), self.config.max_deliveries)?;

        let mut letters = Vec::new();
        {
            let mut stmt = tx.prepare(
                "SELECT message_id, job_id, delivery_count, dead_lettered_at FROM dead_letters
                 ORDER BY dead_lettered_at ASC",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, u32>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?;
            for row in rows {
                let (message_id, job_id, delivery_count, at) = row?;
                letters.push(DeadLetter {
                    message_id: parse_uuid(&message_id)?,
                    job_id: parse_uuid(&job_id)?,
                    delivery_count,
                    dead_lettered_at: parse_ts(&at)?,
                });
            }
        }
        tx.execute("DELETE FROM dead_letters", [])?;
        tx.commit()?;
        Ok(letters)
    }

    async fn stats(&self) -> Result<QueueStats> {
        let conn = self.db.connection().lock().await;
        let now = format_ts(Utc::now());
        let visible: i64 = conn.query_row(
            "SELECT COUNT(*) FROM queue_messages WHERE visible_at <= ?1",
            params![now],
            |row| row.get(0),
        )?;
        let total: i64 =
            conn.query_row("SELECT COUNT(*) FROM queue_messages", [], |row| row.get(0))?;
        let dead: i64 = conn.query_row("SELECT COUNT(*) FROM dead_letters", [], |row| row.get(0))?;
        Ok(QueueStats {
            visible: visible as usize,
            in_flight: (total - visible) as usize,
            dead_lettered: dead as usize,
        })
    }

    fn max_deliveries(&self) -> u32 {
        self.config.max_deliveries
    }

    fn visibility_timeout(&self) -> Duration {
        self.config.visibility_timeout()
    }
}
