use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{Result, SimError};
use crate::job::store::{seal_update, DEFAULT_MAX_UPDATE_ATTEMPTS};
use crate::job::{JobStatus, JobStore, SimulationJob};

/// Process-local job store, used by tests and ephemeral servers.
#[derive(Debug)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<Uuid, SimulationJob>>,
    max_update_attempts: u32,
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::with_update_attempts(DEFAULT_MAX_UPDATE_ATTEMPTS)
    }

    pub fn with_update_attempts(max_update_attempts: u32) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            max_update_attempts,
        }
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, job: SimulationJob) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.job_id) {
            return Err(SimError::Conflict(job.job_id));
        }
        jobs.insert(job.job_id, job);
        Ok(())
    }

    async fn get(&self, job_id: Uuid) -> Result<SimulationJob> {
        self.jobs
            .read()
            .await
            .get(&job_id)
            .cloned()
            .ok_or(SimError::NotFound(job_id))
    }

    async fn compare_and_swap(
        &self,
        expected_version: u64,
        next: SimulationJob,
    ) -> Result<SimulationJob> {
        let mut jobs = self.jobs.write().await;
        let current = jobs.get(&next.job_id).ok_or(SimError::NotFound(next.job_id))?;
        if current.version != expected_version {
            return Err(SimError::ConcurrentModification(next.job_id));
        }
        let sealed = seal_update(current, next, Utc::now())?;
        jobs.insert(sealed.job_id, sealed.clone());
        Ok(sealed)
    }

    async fn list_by_status(
        &self,
        status: JobStatus,
        updated_before: Option<DateTime<Utc>>,
    ) -> Result<Vec<SimulationJob>> {
        let jobs = self.jobs.read().await;
        let mut matching: Vec<SimulationJob> = jobs
            .values()
            .filter(|j| j.status == status)
            .filter(|j| updated_before.map_or(true, |cutoff| j.updated_at < cutoff))
            .cloned()
            .collect();
        matching.sort_by_key(|j| j.updated_at);
        Ok(matching)
    }

    async fn list_for_user(&self, user_id: &str, limit: usize) -> Result<Vec<SimulationJob>> {
        let jobs = self.jobs.read().await;
        let mut owned: Vec<SimulationJob> = jobs
            .values()
            .filter(|j| j.user_id == user_id)
            .cloned()
            .collect();
        owned.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        owned.truncate(limit);
        Ok(owned)
    }

    fn max_update_attempts(&self) -> u32 {
        self.max_update_attempts
    }
}
