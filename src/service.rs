use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::api::{run_api, ApiState};
use crate::collaborator::{GitCheckoutProvider, HeuristicPlanGenerator, SandboxExecutor};
use crate::config::{QueueConfig, ServiceConfig, StoreConfig};
use crate::db::Database;
use crate::error::{Result, SimError};
use crate::gateway::SubmissionGateway;
use crate::job::{InMemoryJobStore, JobStore};
use crate::queue::{InMemoryJobQueue, JobQueue};
use crate::worker::{Collaborators, SimulationWorker, Watchdog, WorkerPool};

/// Open the store and queue described by `store`: SQLite when a database path
/// is set, in-memory otherwise.
pub fn open_backends(
    store: &StoreConfig,
    queue: &QueueConfig,
) -> Result<(Arc<dyn JobStore>, Arc<dyn JobQueue>)> {
    match &store.database_path {
        Some(path) => {
            let db = Database::open(path)?;
            tracing::info!(path = %path.display(), "Opened job database");
            Ok((
                Arc::new(db.job_store(store.max_update_attempts)),
                Arc::new(db.job_queue(queue.clone())),
            ))
        }
        None => Ok((
            Arc::new(InMemoryJobStore::with_update_attempts(store.max_update_attempts)),
            Arc::new(InMemoryJobQueue::new(queue.clone())),
        )),
    }
}

/// Default collaborators: git checkout, heuristic planner, sandbox executor.
pub fn default_collaborators(config: &ServiceConfig) -> Result<Collaborators> {
    let checkout = GitCheckoutProvider::new(config.checkout.clone())
        .map_err(|e| SimError::Config(e.to_string()))?;
    let executor = SandboxExecutor::new(config.executor.clone())
        .map_err(|e| SimError::Config(e.to_string()))?;
    Ok(Collaborators {
        checkout: Arc::new(checkout),
        planner: Arc::new(HeuristicPlanGenerator::new(config.planner.clone())),
        executor: Arc::new(executor),
    })
}

/// All long-running components of one process.
pub struct Service {
    config: ServiceConfig,
    store: Arc<dyn JobStore>,
    queue: Arc<dyn JobQueue>,
    collaborators: Collaborators,
}

impl Service {
    pub fn new(
        config: ServiceConfig,
        store: Arc<dyn JobStore>,
        queue: Arc<dyn JobQueue>,
        collaborators: Collaborators,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            store,
            queue,
            collaborators,
        })
    }

    /// Build a service with the configured backends and default collaborators.
    pub fn open(config: ServiceConfig) -> Result<Self> {
        config.validate()?;
        let (store, queue) = open_backends(&config.store, &config.queue)?;
        let collaborators = default_collaborators(&config)?;
        Self::new(config, store, queue, collaborators)
    }

    pub fn gateway(&self) -> SubmissionGateway {
        SubmissionGateway::new(self.store.clone(), self.queue.clone())
    }

    pub fn store(&self) -> Arc<dyn JobStore> {
        self.store.clone()
    }

    pub fn queue(&self) -> Arc<dyn JobQueue> {
        self.queue.clone()
    }

    pub fn watchdog(&self) -> Watchdog {
        Watchdog::new(self.store.clone(), self.queue.clone(), self.config.watchdog.clone())
    }

    /// Run the service until `shutdown` is cancelled:
    /// 1. Spawns the watchdog sweep
    /// 2. Optionally spawns the HTTP API
    /// 3. Runs the worker pool until every worker has drained
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let watchdog = self.watchdog();
        let watchdog_shutdown = shutdown.clone();
        let watchdog_task = tokio::spawn(async move { watchdog.run(watchdog_shutdown).await });

        let api_task = self.config.api_addr.map(|addr| {
            let state = ApiState {
                gateway: self.gateway(),
                queue: self.queue.clone(),
            };
            let api_shutdown = shutdown.clone();
            tokio::spawn(async move { run_api(addr, state, api_shutdown).await })
        });

        let worker = Arc::new(SimulationWorker::new(
            self.store.clone(),
            self.queue.clone(),
            self.collaborators.clone(),
            self.config.worker.clone(),
        ));
        WorkerPool::new(worker, self.config.worker.clone())
            .run(shutdown)
            .await;

        if let Err(e) = watchdog_task.await {
            tracing::error!(error = %e, "Watchdog task failed");
        }
        if let Some(task) = api_task {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "API task failed");
            }
        }
        tracing::info!("Service stopped");
        Ok(())
    }
}
