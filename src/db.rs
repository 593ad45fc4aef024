//! SQLite database shared by the durable job store and job queue.
//!
//! One connection per database file, guarded by an async mutex. Several
//! processes (the server and the CLI) may open the same file; cross-process
//! safety comes from SQLite's own locking plus the version and receipt guards
//! in every `UPDATE`.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use tokio::sync::Mutex;

use crate::config::QueueConfig;
use crate::error::{Result, SimError};
use crate::job::SqliteJobStore;
use crate::queue::SqliteJobQueue;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS jobs (
    job_id      TEXT PRIMARY KEY,
    user_id     TEXT NOT NULL,
    status      TEXT NOT NULL,
    version     INTEGER NOT NULL,
    record      TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs (status, updated_at);
CREATE INDEX IF NOT EXISTS idx_jobs_user ON jobs (user_id, created_at);

CREATE TABLE IF NOT EXISTS queue_messages (
    message_id      TEXT PRIMARY KEY,
    job_id          TEXT NOT NULL,
    receipt         TEXT,
    delivery_count  INTEGER NOT NULL DEFAULT 0,
    visible_at      TEXT NOT NULL,
    enqueued_at     TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_queue_visible ON queue_messages (visible_at);

CREATE TABLE IF NOT EXISTS dead_letters (
    message_id       TEXT PRIMARY KEY,
    job_id           TEXT NOT NULL,
    delivery_count   INTEGER NOT NULL,
    dead_lettered_at TEXT NOT NULL
);
";

#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) a database file and apply the schema.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    SimError::Config(format!("cannot create {}: {}", parent.display(), e))
                })?;
            }
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        // journal_mode returns the resulting mode as a row
        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn job_store(&self, max_update_attempts: u32) -> SqliteJobStore {
        SqliteJobStore::new(self.clone(), max_update_attempts)
    }

    pub fn job_queue(&self, config: QueueConfig) -> SqliteJobQueue {
        SqliteJobQueue::new(self.clone(), config)
    }

    pub(crate) fn connection(&self) -> &Mutex<Connection> {
        &self.conn
    }
}

/// Fixed-width RFC 3339 so stored timestamps compare correctly as text.
pub(crate) fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| SimError::Internal(format!("bad timestamp '{}': {}", raw, e)))
}
