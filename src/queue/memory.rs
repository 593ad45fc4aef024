use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::{Result, SimError};
use crate::queue::{DeadLetter, JobQueue, QueueMessage, QueueStats, Receipt};

#[derive(Debug)]
struct Entry {
    message_id: Uuid,
    job_id: Uuid,
    receipt: Option<Receipt>,
    delivery_count: u32,
    visible_at: Instant,
}

#[derive(Debug, Default)]
struct Inner {
    /// Kept in enqueue order; redelivered messages keep their position.
    entries: Vec<Entry>,
    dead_letters: Vec<DeadLetter>,
}

impl Inner {
    /// Move every visible message that has used up its deliveries to the
    /// dead-letter list.
    fn dead_letter_exhausted(&mut self, now: Instant, max_deliveries: u32) {
        let mut kept = Vec::with_capacity(self.entries.len());
        for entry in self.entries.drain(..) {
            if entry.visible_at <= now && entry.delivery_count >= max_deliveries {
                tracing::warn!(
                    job_id = %entry.job_id,
                    message_id = %entry.message_id,
                    deliveries = entry.delivery_count,
                    "Message exhausted its deliveries, moving to dead-letter path"
                );
                self.dead_letters.push(DeadLetter {
                    message_id: entry.message_id,
                    job_id: entry.job_id,
                    delivery_count: entry.delivery_count,
                    dead_lettered_at: Utc::now(),
                });
            } else {
                kept.push(entry);
            }
        }
        self.entries = kept;
    }

    fn next_visible_at(&self) -> Option<Instant> {
        self.entries.iter().map(|e| e.visible_at).min()
    }

    fn position_of(&self, receipt: &Receipt) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.receipt.as_ref() == Some(receipt))
    }
}

/// Process-local queue with the same delivery semantics as the SQLite queue.
#[derive(Debug)]
pub struct InMemoryJobQueue {
    config: QueueConfig,
    inner: Mutex<Inner>,
    notify: Notify,
}

impl InMemoryJobQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }
}

impl Default for InMemoryJobQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, job_id: Uuid) -> Result<Uuid> {
        let message_id = Uuid::new_v4();
        self.inner.lock().await.entries.push(Entry {
            message_id,
            job_id,
            receipt: None,
            delivery_count: 0,
            visible_at: Instant::now(),
        });
        tracing::debug!(job_id = %job_id, message_id = %message_id, "Message enqueued");
        self.notify.notify_waiters();
        Ok(message_id)
    }

    async fn dequeue(&self, max_wait: Duration) -> Result<Option<QueueMessage>> {
        let deadline = Instant::now() + max_wait;

        loop {
            // registered before the lock is released so a concurrent enqueue
            // cannot slip between the scan and the wait
            let notified = self.notify.notified();

            let wake_at = {
                let mut inner = self.inner.lock().await;
                let now = Instant::now();
                inner.dead_letter_exhausted(now, self.config.max_deliveries);

                if let Some(entry) = inner.entries.iter_mut().find(|e| e.visible_at <= now) {
                    let receipt = Receipt::generate();
                    entry.receipt = Some(receipt.clone());
                    entry.delivery_count += 1;
                    entry.visible_at = now + self.config.visibility_timeout();

                    let visible_until = Utc::now()
                        + chrono::Duration::milliseconds(self.config.visibility_timeout_ms as i64);
                    tracing::debug!(
                        job_id = %entry.job_id,
                        delivery = entry.delivery_count,
                        "Message delivered"
                    );
                    return Ok(Some(QueueMessage {
                        message_id: entry.message_id,
                        job_id: entry.job_id,
                        receipt,
                        delivery_count: entry.delivery_count,
                        visible_until,
                    }));
                }

                match inner.next_visible_at() {
                    Some(at) if at < deadline => at,
                    _ => deadline,
                }
            };

            if Instant::now() >= deadline {
                return Ok(None);
            }

            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn acknowledge(&self, receipt: &Receipt) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let pos = inner
            .position_of(receipt)
            .ok_or_else(|| SimError::InvalidReceipt(receipt.to_string()))?;
        let entry = inner.entries.remove(pos);
        tracing::debug!(job_id = %entry.job_id, "Message acknowledged");
        Ok(())
    }

    async fn extend_visibility(&self, receipt: &Receipt, extension: Duration) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        let pos = inner
            .position_of(receipt)
            .filter(|&pos| inner.entries[pos].visible_at > now)
            .ok_or_else(|| SimError::InvalidReceipt(receipt.to_string()))?;
        let entry = &mut inner.entries[pos];
        entry.visible_at = now + extension;
        tracing::trace!(job_id = %entry.job_id, extension_ms = extension.as_millis() as u64, "Visibility extended");
        Ok(())
    }

    async fn release_after(&self, receipt: &Receipt, delay: Duration) -> Result<()> {
        {
            let mut inner = self.inner.lock().await;
            let pos = inner
                .position_of(receipt)
                .ok_or_else(|| SimError::InvalidReceipt(receipt.to_string()))?;
            let entry = &mut inner.entries[pos];
            entry.receipt = None;
            entry.visible_at = Instant::now() + delay;
            tracing::debug!(job_id = %entry.job_id, delay_ms = delay.as_millis() as u64, "Message released");
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn take_dead_letters(&self) -> Result<Vec<DeadLetter>> {
        let mut inner = self.inner.lock().await;
        inner.dead_letter_exhausted(Instant::now(), self.config.max_deliveries);
        Ok(std::mem::take(&mut inner.dead_letters))
    }

    async fn stats(&self) -> Result<QueueStats> {
        let inner = self.inner.lock().await;
        let now = Instant::now();
        let visible = inner.entries.iter().filter(|e| e.visible_at <= now).count();
        Ok(QueueStats {
            visible,
            in_flight: inner.entries.len() - visible,
            dead_lettered: inner.dead_letters.len(),
        })
    }

    fn max_deliveries(&self) -> u32 {
        self.config.max_deliveries
    }

    fn visibility_timeout(&self) -> Duration {
        self.config.visibility_timeout()
    }
}
