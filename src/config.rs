use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, SimError};

/// Configuration for Docker-sandboxed commands run by the simulation executor.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Docker image used for check commands and the launched application
    pub image: String,
    /// Disable network access for check commands
    pub network_disabled: bool,
    /// Memory limit (e.g., "512m")
    pub memory_limit: Option<String>,
    /// CPU limit (e.g., "1.0")
    pub cpu_limit: Option<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: "node:20-alpine".to_string(),
            network_disabled: true,
            memory_limit: Some("512m".to_string()),
            cpu_limit: Some("1.0".to_string()),
        }
    }
}

/// Delivery settings for the job queue.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// How long a dequeued message stays hidden before it is redelivered
    pub visibility_timeout_ms: u64,
    /// Deliveries allowed before a message moves to the dead-letter path
    pub max_deliveries: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout_ms: 900_000,
            max_deliveries: 3,
        }
    }
}

impl QueueConfig {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_millis(self.visibility_timeout_ms)
    }
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Path of the SQLite database. `None` keeps everything in memory.
    pub database_path: Option<PathBuf>,
    /// Read-modify-write attempts before an update gives up
    pub max_update_attempts: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_path: Some(PathBuf::from("pr-simulator.db")),
            max_update_attempts: 8,
        }
    }
}

/// Worker pool and per-stage timeouts.
///
/// Stage timeouts are enforced by the orchestrator independently of any
/// timeout the collaborator applies itself.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_count: usize,
    /// Long-poll wait for one dequeue call
    pub poll_wait_ms: u64,
    pub checkout_timeout_ms: u64,
    pub plan_timeout_ms: u64,
    pub execution_timeout_ms: u64,
    /// Base delay before a retryable failure is redelivered; doubles per delivery
    pub retry_backoff_ms: u64,
    pub max_retry_backoff_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_count: 2,
            poll_wait_ms: 5_000,
            checkout_timeout_ms: 300_000,
            plan_timeout_ms: 60_000,
            execution_timeout_ms: 300_000,
            retry_backoff_ms: 2_000,
            max_retry_backoff_ms: 60_000,
        }
    }
}

impl WorkerConfig {
    /// Longest time one delivery can spend in collaborator stages.
    pub fn stage_budget_ms(&self) -> u64 {
        self.checkout_timeout_ms
            .saturating_add(self.plan_timeout_ms)
            .saturating_add(self.execution_timeout_ms)
    }

    pub fn poll_wait(&self) -> Duration {
        Duration::from_millis(self.poll_wait_ms)
    }

    /// Redelivery delay after the given (1-based) delivery failed.
    pub fn retry_delay(&self, delivery_count: u32) -> Duration {
        let exponent = delivery_count.saturating_sub(1).min(16);
        let delay = self.retry_backoff_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.max_retry_backoff_ms))
    }
}

/// Sweep over jobs that stopped making progress.
#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    pub sweep_interval_ms: u64,
    /// A non-terminal job untouched for this long is considered stuck
    pub stale_after_ms: u64,
    /// Attempts after which a stuck job is failed instead of re-enqueued
    pub max_attempts: u32,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: 60_000,
            stale_after_ms: 30 * 60_000,
            max_attempts: 3,
        }
    }
}

#[derive(Clone)]
pub struct CheckoutConfig {
    /// Directory under which per-job working copies are created
    pub workspace_root: PathBuf,
    pub github_api_base: String,
    pub github_token: Option<String>,
    pub git_binary: String,
}

impl Default for CheckoutConfig {
    fn default() -> Self {
        Self {
            workspace_root: std::env::temp_dir().join("pr-simulator"),
            github_api_base: "https://api.github.com".to_string(),
            github_token: None,
            git_binary: "git".to_string(),
        }
    }
}

impl std::fmt::Debug for CheckoutConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckoutConfig")
            .field("workspace_root", &self.workspace_root)
            .field("github_api_base", &self.github_api_base)
            .field("github_token", &self.github_token.as_ref().map(|_| "<redacted>"))
            .field("git_binary", &self.git_binary)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct PlannerConfig {
    /// Upper bound on route navigation steps derived from changed files
    pub max_route_steps: usize,
    /// Commands appended to every plan as sandboxed `run` steps
    pub check_commands: Vec<String>,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            max_route_steps: 5,
            check_commands: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Where the application under test is reachable
    pub app_base_url: String,
    /// Command that serves the application from the workspace, if the
    /// executor should launch it itself
    pub launch_command: Option<String>,
    pub app_port: u16,
    pub ready_timeout_ms: u64,
    /// Bound for a single HTTP interaction within a step
    pub request_timeout_ms: u64,
    pub sandbox: SandboxConfig,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            app_base_url: "http://localhost:3000".to_string(),
            launch_command: None,
            app_port: 3000,
            ready_timeout_ms: 60_000,
            request_timeout_ms: 30_000,
            sandbox: SandboxConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ServiceConfig {
    pub queue: QueueConfig,
    pub store: StoreConfig,
    pub worker: WorkerConfig,
    pub watchdog: WatchdogConfig,
    pub checkout: CheckoutConfig,
    pub planner: PlannerConfig,
    pub executor: ExecutorConfig,
    /// HTTP API listen address; the API is not served when `None`
    pub api_addr: Option<SocketAddr>,
}

impl ServiceConfig {
    pub fn with_api_addr(mut self, addr: SocketAddr) -> Self {
        self.api_addr = Some(addr);
        self
    }

    pub fn in_memory(mut self) -> Self {
        self.store.database_path = None;
        self
    }

    /// Reject settings that would break the delivery guarantees.
    pub fn validate(&self) -> Result<()> {
        if self.worker.worker_count == 0 {
            return Err(SimError::Config("worker_count must be at least 1".to_string()));
        }
        if self.queue.max_deliveries == 0 {
            return Err(SimError::Config("max_deliveries must be at least 1".to_string()));
        }
        if self.store.max_update_attempts == 0 {
            return Err(SimError::Config(
                "max_update_attempts must be at least 1".to_string(),
            ));
        }
        // a delivery must be able to finish before its message reappears,
        // with a tenth of the timeout left for store writes and cleanup
        let budget = self.worker.stage_budget_ms();
        let usable = self.queue.visibility_timeout_ms - self.queue.visibility_timeout_ms / 10;
        if budget > usable {
            return Err(SimError::Config(format!(
                "stage timeouts ({}ms in total) must fit within 90% of visibility_timeout_ms ({})",
                budget, self.queue.visibility_timeout_ms
            )));
        }
        // a job whose message is merely in flight must not look abandoned
        if self.watchdog.stale_after_ms <= self.queue.visibility_timeout_ms {
            return Err(SimError::Config(format!(
                "stale_after_ms ({}) must exceed visibility_timeout_ms ({})",
                self.watchdog.stale_after_ms, self.queue.visibility_timeout_ms
            )));
        }
        if self.watchdog.sweep_interval_ms == 0 {
            return Err(SimError::Config("sweep_interval_ms must be positive".to_string()));
        }
        Ok(())
    }
}
