use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::worker::SimulationWorker;

/// Pause after a failed dequeue before polling again.
const DEQUEUE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// A fixed number of independent long-polling worker loops.
///
/// Workers share nothing but the queue and the store. On shutdown a worker
/// that holds a message abandons it and releases it back to the queue.
pub struct WorkerPool {
    worker: Arc<SimulationWorker>,
    config: WorkerConfig,
}

impl WorkerPool {
    pub fn new(worker: Arc<SimulationWorker>, config: WorkerConfig) -> Self {
        Self { worker, config }
    }

    /// Run until `shutdown` is cancelled and every loop has exited.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut loops = JoinSet::new();
        for index in 0..self.config.worker_count {
            let worker = self.worker.clone();
            let poll_wait = self.config.poll_wait();
            let shutdown = shutdown.clone();
            loops.spawn(async move { worker_loop(index, worker, poll_wait, shutdown).await });
        }
        tracing::info!(workers = self.config.worker_count, "Worker pool started");

        while let Some(result) = loops.join_next().await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Worker loop panicked");
            }
        }
        tracing::info!("Worker pool stopped");
    }
}

async fn worker_loop(
    index: usize,
    worker: Arc<SimulationWorker>,
    poll_wait: Duration,
    shutdown: CancellationToken,
) {
    let queue = worker.queue().clone();
    loop {
        let delivered = tokio::select! {
            _ = shutdown.cancelled() => break,
            result = queue.dequeue(poll_wait) => result,
        };

        let message = match delivered {
            Ok(Some(message)) => message,
            Ok(None) => continue,
            Err(e) => {
                tracing::error!(worker = index, error = %e, "Dequeue failed");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(DEQUEUE_ERROR_BACKOFF) => continue,
                }
            }
        };

        tokio::select! {
            result = worker.handle(&message) => match result {
                Ok(disposition) => {
                    tracing::debug!(worker = index, job_id = %message.job_id, ?disposition, "Message handled");
                }
                Err(e) => {
                    tracing::error!(worker = index, job_id = %message.job_id, error = %e, "Message handling failed");
                }
            },
            _ = shutdown.cancelled() => {
                tracing::info!(worker = index, job_id = %message.job_id, "Shutting down, releasing in-flight message");
                if let Err(e) = queue.release(&message.receipt).await {
                    tracing::warn!(job_id = %message.job_id, error = %e, "Failed to release message");
                }
                break;
            }
        }
    }
    tracing::debug!(worker = index, "Worker loop exited");
}
