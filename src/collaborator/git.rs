use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use url::Url;
use uuid::Uuid;

use crate::collaborator::diff;
use crate::collaborator::{
    CheckoutProvider, Checkout, CollaboratorResult, GithubClient, Workspace,
};
use crate::config::CheckoutConfig;
use crate::error::CollaboratorError;
use crate::job::PullRequestRef;

/// Local branch the PR head is fetched into.
const PR_BRANCH: &str = "pr-simulator-head";

/// Checks pull requests out with the `git` CLI.
///
/// Every checkout gets its own directory under the workspace root. Git
/// subprocesses are killed when the future driving them is dropped, so an
/// orchestrator timeout does not leave clones running.
#[derive(Clone)]
pub struct GitCheckoutProvider {
    config: CheckoutConfig,
    github: GithubClient,
}

impl GitCheckoutProvider {
    pub fn new(config: CheckoutConfig) -> Result<Self, CollaboratorError> {
        let github = GithubClient::new(&config)?;
        Ok(Self { config, github })
    }

    async fn git(&self, dir: Option<&Path>, args: &[&str]) -> CollaboratorResult<String> {
        let mut cmd = Command::new(&self.config.git_binary);
        if let Some(dir) = dir {
            cmd.arg("-C").arg(dir);
        }
        let output = cmd
            .args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                CollaboratorError::fatal(format!("cannot run {}: {}", self.config.git_binary, e))
            })?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }

        let stderr = self.redact(String::from_utf8_lossy(&output.stderr).trim());
        let subcommand = args.first().copied().unwrap_or("git");
        Err(classify_git_failure(subcommand, &stderr))
    }

    fn redact(&self, text: &str) -> String {
        match self.config.github_token.as_deref() {
            Some(token) if !token.is_empty() => text.replace(token, "***"),
            _ => text.to_string(),
        }
    }

    fn authenticated_clone_url(&self, clone_url: &str) -> CollaboratorResult<String> {
        let Some(token) = self.github.token() else {
            return Ok(clone_url.to_string());
        };
        let mut url = Url::parse(clone_url)
            .map_err(|e| CollaboratorError::fatal(format!("invalid clone URL: {}", e)))?;
        if url.set_username("x-access-token").is_err() || url.set_password(Some(token)).is_err() {
            return Err(CollaboratorError::fatal("clone URL does not accept credentials"));
        }
        Ok(url.to_string())
    }

    async fn populate(
        &self,
        dir: &Path,
        pr: &PullRequestRef,
        clone_url: &str,
        base_ref: &str,
    ) -> CollaboratorResult<(String, String, String)> {
        let dir_arg = dir.to_string_lossy().into_owned();
        self.git(None, &["clone", "--no-tags", "--quiet", clone_url, dir_arg.as_str()])
            .await?;

        let head_spec = format!("pull/{}/head:{}", pr.number, PR_BRANCH);
        let base_spec = format!("+refs/heads/{0}:refs/remotes/origin/{0}", base_ref);
        self.git(Some(dir), &["fetch", "--quiet", "origin", head_spec.as_str(), base_spec.as_str()])
            .await?;
        self.git(Some(dir), &["checkout", "--quiet", PR_BRANCH]).await?;

        let head_sha = self.git(Some(dir), &["rev-parse", "HEAD"]).await?;
        let range = format!("origin/{}...HEAD", base_ref);
        let name_status = self.git(Some(dir), &["diff", "--name-status", range.as_str()]).await?;
        let unified = self.git(Some(dir), &["diff", range.as_str()]).await?;
        Ok((head_sha.trim().to_string(), name_status, unified))
    }
}

#[async_trait]
impl CheckoutProvider for GitCheckoutProvider {
    async fn checkout(&self, pr: &PullRequestRef) -> CollaboratorResult<Checkout> {
        let info = self.github.pull_request(pr).await?;
        let clone_url = self.authenticated_clone_url(&info.clone_url)?;

        let dir: PathBuf = self.config.workspace_root.join(Uuid::new_v4().to_string());
        tokio::fs::create_dir_all(&self.config.workspace_root)
            .await
            .map_err(|e| CollaboratorError::retryable(format!("cannot create workspace root: {}", e)))?;

        tracing::info!(pull_request = %pr, head = %info.head_ref, base = %info.base_ref, path = %dir.display(), "Checking out pull request");

        let (head_sha, name_status, unified) =
            match self.populate(&dir, pr, &clone_url, &info.base_ref).await {
                Ok(parts) => parts,
                Err(e) => {
                    remove_workspace(&dir).await;
                    return Err(e);
                }
            };

        let diff = diff::assemble(&info.base_ref, &info.head_ref, &name_status, &unified);
        tracing::info!(pull_request = %pr, files = diff.files.len(), sha = %head_sha, "Checkout ready");

        Ok(Checkout {
            workspace: Workspace {
                path: dir,
                pull_request: pr.clone(),
                base_ref: info.base_ref,
                head_ref: info.head_ref,
                head_sha: Some(head_sha),
            },
            diff,
        })
    }

    async fn release(&self, workspace: &Workspace) {
        if !workspace.path.starts_with(&self.config.workspace_root) {
            tracing::warn!(path = %workspace.path.display(), "Refusing to remove workspace outside the workspace root");
            return;
        }
        remove_workspace(&workspace.path).await;
    }
}

async fn remove_workspace(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => tracing::debug!(path = %dir.display(), "Workspace removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %dir.display(), error = %e, "Failed to remove workspace"),
    }
}

/// Classify a failed git invocation from its stderr.
fn classify_git_failure(subcommand: &str, stderr: &str) -> CollaboratorError {
    let lower = stderr.to_ascii_lowercase();
    let message = format!("git {} failed: {}", subcommand, stderr);
    let fatal_markers = [
        "repository not found",
        "authentication failed",
        "could not read username",
        "permission denied",
        "couldn't find remote ref",
        "invalid refspec",
        "unknown revision",
        "did not match any file(s) known to git",
    ];
    if fatal_markers.iter().any(|m| lower.contains(m)) {
        CollaboratorError::fatal(message)
    } else {
        CollaboratorError::retryable(message)
    }
}
