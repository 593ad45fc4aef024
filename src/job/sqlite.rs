use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use crate::db::{format_ts, Database};
use crate::error::{Result, SimError};
use crate::job::store::seal_update;
use crate::job::{JobStatus, JobStore, SimulationJob};

/// Job store persisted in the `jobs` table. The full record is kept as JSON;
/// `status`, `version` and timestamps are mirrored into columns for the
/// optimistic-concurrency guard and the watchdog queries.
#[derive(Clone)]
pub struct SqliteJobStore {
    db: Database,
    max_update_attempts: u32,
}

impl SqliteJobStore {
    pub fn new(db: Database, max_update_attempts: u32) -> Self {
        Self {
            db,
            max_update_attempts,
        }
    }
}

fn decode(record: String) -> Result<SimulationJob> {
    Ok(serde_json::from_str(&record)?)
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn create(&self, job: SimulationJob) -> Result<()> {
        let record = serde_json::to_string(&job)?;
        let conn = self.db.connection().lock().await;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO jobs (job_id, user_id, status, version, record, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                job.job_id.to_string(),
                job.user_id,
                job.status.as_str(),
                job.version as i64,
                record,
                format_ts(job.created_at),
                format_ts(job.updated_at),
            ],
        )?;
        if inserted == 0 {
            return Err(SimError::Conflict(job.job_id));
        }
        Ok(())
    }

    async fn get(&self, job_id: Uuid) -> Result<SimulationJob> {
        let conn = self.db.connection().lock().await;
        let record: Option<String> = conn
            .query_row(
                "SELECT record FROM jobs WHERE job_id = ?1",
                params![job_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        record.map(decode).unwrap_or(Err(SimError::NotFound(job_id)))
    }

    async fn compare_and_swap(
        &self,
        expected_version: u64,
        next: SimulationJob,
    ) -> Result<SimulationJob> {
        let job_id = next.job_id;
        let conn = self.db.connection().lock().await;

        let record: Option<String> = conn
            .query_row(
                "SELECT record FROM jobs WHERE job_id = ?1",
                params![job_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        let current = decode(record.ok_or(SimError::NotFound(job_id))?)?;
        if current.version != expected_version {
            return Err(SimError::ConcurrentModification(job_id));
        }

        let sealed = seal_update(&current, next, Utc::now())?;
        let changed = conn.execute(
            "UPDATE jobs SET status = ?1, version = ?2, record = ?3, updated_at = ?4
             WHERE job_id = ?5 AND version = ?6",
            params![
                sealed.status.as_str(),
                sealed.version as i64,
                serde_json::to_string(&sealed)?,
                format_ts(sealed.updated_at),
                job_id.to_string(),
                expected_version as i64,
            ],
        )?;
        if changed == 0 {
            // another process won the race between our read and write
            return Err(SimError::ConcurrentModification(job_id));
        }
        Ok(sealed)
    }

    async fn list_by_status(
        &self,
        status: JobStatus,
        updated_before: Option<DateTime<Utc>>,
    ) -> Result<Vec<SimulationJob>> {
        let conn = self.db.connection().lock().await;
        let cutoff = updated_before.map(format_ts);
        let mut stmt = conn.prepare(
            "SELECT record FROM jobs
             WHERE status = ?1 AND (?2 IS NULL OR updated_at < ?2)
             ORDER BY updated_at ASC",
        )?;
        let rows = stmt.query_map(params![status.as_str(), cutoff], |row| {
            row.get::<_, String>(0)
        })?;

        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(decode(row?)?);
        }
        Ok(jobs)
    }

    async fn list_for_user(&self, user_id: &str, limit: usize) -> Result<Vec<SimulationJob>> {
        let conn = self.db.connection().lock().await;
        let mut stmt = conn.prepare(
            "SELECT record FROM jobs WHERE user_id = ?1 ORDER BY created_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![user_id, limit as i64], |row| {
            row.get::<_, String>(0)
        })?;

        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(decode(row?)?);
        }
        Ok(jobs)
    }

    fn max_update_attempts(&self) -> u32 {
        self.max_update_attempts
    }
}
