use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use tokio::process::Command;
use uuid::Uuid;

use crate::collaborator::{
    CollaboratorResult, SimulationExecutor, StepOutcome, TestStep, Workspace,
};
use crate::config::{ExecutorConfig, SandboxConfig};
use crate::error::CollaboratorError;

const READY_POLL_INTERVAL: Duration = Duration::from_millis(500);
const SELECTOR_POLL_INTERVAL: Duration = Duration::from_millis(250);
const DEFAULT_SELECTOR_TIMEOUT_MS: u64 = 10_000;
const MAX_DETAIL_CHARS: usize = 2_000;

/// Mount point of the checked-out workspace inside sandbox containers.
const WORKSPACE_MOUNT: &str = "/workspace";

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum StepAction {
    Navigate {
        path: String,
    },
    WaitForSelector {
        selector: String,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    CheckTitle {
        pattern: String,
    },
    Run {
        command: String,
    },
}

/// Runs test plans against the application and in Docker sandboxes.
///
/// Browser-like steps (`navigate`, `wait_for_selector`, `check_title`) are
/// HTTP interactions with the application under test; `run` steps execute a
/// shell command in a sandboxed container with the workspace mounted
/// read-only:
/// - Network isolation (disabled by default)
/// - Dropped capabilities
/// - Read-only root filesystem
/// - Memory and CPU limits
///
/// Every step runs even after an earlier one failed.
#[derive(Debug, Clone)]
pub struct SandboxExecutor {
    config: ExecutorConfig,
    http: reqwest::Client,
}

impl SandboxExecutor {
    pub fn new(config: ExecutorConfig) -> Result<Self, CollaboratorError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| CollaboratorError::fatal(format!("cannot build HTTP client: {}", e)))?;
        Ok(Self { config, http })
    }

    fn url_for(&self, path: &str) -> String {
        let base = self.config.app_base_url.trim_end_matches('/');
        if path.starts_with('/') {
            format!("{}{}", base, path)
        } else {
            format!("{}/{}", base, path)
        }
    }

    async fn fetch(&self, path: &str) -> Result<(reqwest::StatusCode, String), String> {
        let response = self
            .http
            .get(self.url_for(path))
            .send()
            .await
            .map_err(|e| format!("request to {} failed: {}", path, e))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| format!("reading {} failed: {}", path, e))?;
        Ok((status, body))
    }

    /// Start the application container and wait until it answers HTTP.
    async fn launch_app(&self, workspace: &Workspace, command: &str) -> CollaboratorResult<AppContainer> {
        let name = format!("pr-sim-app-{}", Uuid::new_v4().simple());
        let args = launch_args(&self.config, &name, &workspace.path, command);
        tracing::info!(container = %name, image = %self.config.sandbox.image, "Launching application");

        let output = Command::new("docker")
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| CollaboratorError::retryable(format!("cannot run docker: {}", e)))?;
        if !output.status.success() {
            return Err(CollaboratorError::retryable(format!(
                "application container failed to start: {}",
                truncate(String::from_utf8_lossy(&output.stderr).trim(), MAX_DETAIL_CHARS)
            )));
        }
        let container = AppContainer { name };

        let deadline = Instant::now() + Duration::from_millis(self.config.ready_timeout_ms);
        loop {
            if let Ok(response) = self.http.get(self.url_for("/")).send().await {
                if !response.status().is_server_error() {
                    tracing::info!(container = %container.name, "Application is ready");
                    return Ok(container);
                }
            }
            if Instant::now() >= deadline {
                return Err(CollaboratorError::retryable(format!(
                    "application not ready within {}ms",
                    self.config.ready_timeout_ms
                )));
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }

    async fn run_step(&self, workspace: &Workspace, step: &TestStep, page: &mut String) -> Result<(), String> {
        let action: StepAction = serde_json::from_value(step.payload.clone())
            .map_err(|e| format!("unsupported step payload: {}", e))?;

        match action {
            StepAction::Navigate { path } => {
                let (status, _) = self.fetch(&path).await?;
                *page = path;
                if status.is_success() {
                    Ok(())
                } else {
                    Err(format!("GET {} returned {}", page, status))
                }
            }
            StepAction::WaitForSelector { selector, timeout_ms } => {
                let pattern = selector_pattern(&selector)?;
                let timeout = timeout_ms.unwrap_or(DEFAULT_SELECTOR_TIMEOUT_MS);
                let deadline = Instant::now() + Duration::from_millis(timeout);
                loop {
                    if let Ok((_, body)) = self.fetch(page).await {
                        if pattern.is_match(&body) {
                            return Ok(());
                        }
                    }
                    if Instant::now() >= deadline {
                        return Err(format!("selector '{}' not found on {} within {}ms", selector, page, timeout));
                    }
                    tokio::time::sleep(SELECTOR_POLL_INTERVAL).await;
                }
            }
            StepAction::CheckTitle { pattern } => {
                let re = Regex::new(&pattern).map_err(|e| format!("invalid title pattern: {}", e))?;
                let (_, body) = self.fetch(page).await?;
                match extract_title(&body) {
                    Some(title) if re.is_match(&title) => Ok(()),
                    Some(title) => Err(format!("title '{}' does not match '{}'", title, pattern)),
                    None => Err(format!("{} has no <title>", page)),
                }
            }
            StepAction::Run { command } => self.run_sandboxed(step, workspace, &command).await,
        }
    }

    async fn run_sandboxed(&self, step: &TestStep, workspace: &Workspace, command: &str) -> Result<(), String> {
        tracing::info!(step = %step.id, command, image = %self.config.sandbox.image, "Running sandboxed command");
        let args = sandbox_args(&self.config.sandbox, &workspace.path, command);

        let output = Command::new("docker")
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| format!("cannot run docker: {}", e))?;

        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let detail = if stderr.trim().is_empty() {
            format!("exit code: {:?}", output.status.code())
        } else {
            truncate(stderr.trim(), MAX_DETAIL_CHARS)
        };
        Err(detail)
    }
}

#[async_trait]
impl SimulationExecutor for SandboxExecutor {
    async fn execute(&self, workspace: &Workspace, steps: &[TestStep]) -> CollaboratorResult<Vec<StepOutcome>> {
        let _app = match &self.config.launch_command {
            Some(command) => Some(self.launch_app(workspace, command).await?),
            None => None,
        };

        let mut page = "/".to_string();
        let mut outcomes = Vec::with_capacity(steps.len());
        for step in steps {
            let started = Instant::now();
            let result = self.run_step(workspace, step, &mut page).await;
            let elapsed = started.elapsed().as_millis() as u64;
            let outcome = match result {
                Ok(()) => StepOutcome::pass(&step.id, elapsed),
                Err(detail) => {
                    tracing::info!(step = %step.id, detail = %detail, "Step failed");
                    StepOutcome::fail(&step.id, detail, elapsed)
                }
            };
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }
}

/// Removes the application container when dropped, including when the
/// execution future is cancelled by a timeout.
struct AppContainer {
    name: String,
}

impl Drop for AppContainer {
    fn drop(&mut self) {
        let name = std::mem::take(&mut self.name);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let result = Command::new("docker")
                    .args(["rm", "-f", name.as_str()])
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status()
                    .await;
                if let Err(e) = result {
                    tracing::warn!(container = %name, error = %e, "Failed to remove application container");
                }
            });
        }
    }
}

fn resource_limits(config: &SandboxConfig, args: &mut Vec<String>) {
    if let Some(ref limit) = config.memory_limit {
        args.push(format!("--memory={}", limit));
    }
    if let Some(ref limit) = config.cpu_limit {
        args.push(format!("--cpus={}", limit));
    }
    // Security: drop all capabilities, no new privileges
    args.push("--cap-drop=ALL".to_string());
    args.push("--security-opt=no-new-privileges".to_string());
}

fn workspace_mount(workspace: &Path) -> Vec<String> {
    vec![
        "-v".to_string(),
        format!("{}:{}:ro", workspace.display(), WORKSPACE_MOUNT),
        "-w".to_string(),
        WORKSPACE_MOUNT.to_string(),
    ]
}

/// `docker run` arguments for a one-shot sandboxed command.
fn sandbox_args(config: &SandboxConfig, workspace: &Path, command: &str) -> Vec<String> {
    let mut args = vec!["run".to_string(), "--rm".to_string()];
    if config.network_disabled {
        args.push("--network=none".to_string());
    }
    resource_limits(config, &mut args);
    args.push("--read-only".to_string());
    args.push("--tmpfs=/tmp".to_string());
    args.extend(workspace_mount(workspace));
    args.push(config.image.clone());
    args.push("sh".to_string());
    args.push("-c".to_string());
    args.push(command.to_string());
    args
}

/// `docker run` arguments for the detached application container. It needs
/// the network to publish its port.
fn launch_args(config: &ExecutorConfig, name: &str, workspace: &Path, command: &str) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "-d".to_string(),
        "--rm".to_string(),
        format!("--name={}", name),
        format!("--publish={0}:{0}", config.app_port),
    ];
    resource_limits(&config.sandbox, &mut args);
    args.push("--tmpfs=/tmp".to_string());
    args.extend(workspace_mount(workspace));
    args.push(config.sandbox.image.clone());
    args.push("sh".to_string());
    args.push("-c".to_string());
    args.push(command.to_string());
    args
}

/// Regex finding a simple selector (`tag`, `#id` or `.class`) in HTML.
fn selector_pattern(selector: &str) -> Result<Regex, String> {
    let selector = selector.trim();
    let pattern = if let Some(id) = selector.strip_prefix('#') {
        format!(r#"(?i)\bid\s*=\s*["']{}["']"#, regex::escape(id))
    } else if let Some(class) = selector.strip_prefix('.') {
        format!(
            r#"(?i)\bclass\s*=\s*["'][^"']*\b{}\b[^"']*["']"#,
            regex::escape(class)
        )
    } else if !selector.is_empty() && selector.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        format!(r"(?i)<{}[\s>/]", regex::escape(selector))
    } else {
        return Err(format!("unsupported selector '{}'", selector));
    };
    Regex::new(&pattern).map_err(|e| format!("invalid selector '{}': {}", selector, e))
}

fn extract_title(html: &str) -> Option<String> {
    let re = Regex::new(r"(?is)<title[^>]*>(.*?)</title>").ok()?;
    re.captures(html)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
