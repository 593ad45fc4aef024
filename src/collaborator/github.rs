use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;

use crate::collaborator::CollaboratorResult;
use crate::config::CheckoutConfig;
use crate::error::CollaboratorError;
use crate::job::PullRequestRef;

const USER_AGENT: &str = concat!("pr-simulator/", env!("CARGO_PKG_VERSION"));
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Pull request details needed to build a checkout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequestInfo {
    pub title: String,
    pub state: String,
    pub head_ref: String,
    pub head_sha: String,
    pub base_ref: String,
    pub base_sha: String,
    /// Clone URL of the base repository; the head is fetched through `pull/<n>/head`
    pub clone_url: String,
}

#[derive(Debug, Deserialize)]
struct PullResponse {
    title: String,
    state: String,
    head: BranchResponse,
    base: BranchResponse,
}

#[derive(Debug, Deserialize)]
struct BranchResponse {
    #[serde(rename = "ref")]
    git_ref: String,
    sha: String,
    repo: Option<RepoResponse>,
}

#[derive(Debug, Deserialize)]
struct RepoResponse {
    clone_url: String,
}

/// Minimal GitHub REST client.
#[derive(Clone)]
pub struct GithubClient {
    http: reqwest::Client,
    api_base: String,
    token: Option<String>,
}

impl GithubClient {
    pub fn new(config: &CheckoutConfig) -> Result<Self, CollaboratorError> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| CollaboratorError::fatal(format!("cannot build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            api_base: config.github_api_base.trim_end_matches('/').to_string(),
            token: config.github_token.clone(),
        })
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub async fn pull_request(&self, pr: &PullRequestRef) -> CollaboratorResult<PullRequestInfo> {
        let url = format!(
            "{}/repos/{}/{}/pulls/{}",
            self.api_base, pr.owner, pr.repo, pr.number
        );
        let mut request = self
            .http
            .get(&url)
            .header("Accept", "application/vnd.github+json");
        if let Some(token) = &self.token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }

        let response = request
            .send()
            .await
            .map_err(|e| CollaboratorError::retryable(format!("GitHub request failed: {}", e)))?;

        if let Some(err) = classify_status(response.status(), pr) {
            tracing::warn!(pull_request = %pr, status = %response.status(), "GitHub lookup failed");
            return Err(err);
        }

        let body: PullResponse = response
            .json()
            .await
            .map_err(|e| CollaboratorError::retryable(format!("malformed GitHub response: {}", e)))?;

        let clone_url = body
            .base
            .repo
            .map(|r| r.clone_url)
            .unwrap_or_else(|| format!("https://github.com/{}.git", pr.slug()));

        Ok(PullRequestInfo {
            title: body.title,
            state: body.state,
            head_ref: body.head.git_ref,
            head_sha: body.head.sha,
            base_ref: body.base.git_ref,
            base_sha: body.base.sha,
            clone_url,
        })
    }
}

/// Map a non-success status to a collaborator error; `None` on success.
fn classify_status(status: StatusCode, pr: &PullRequestRef) -> Option<CollaboratorError> {
    if status.is_success() {
        return None;
    }
    let err = match status {
        StatusCode::NOT_FOUND => CollaboratorError::fatal(format!("pull request {} not found", pr)),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            CollaboratorError::fatal(format!("repository {} inaccessible ({})", pr.slug(), status))
        }
        StatusCode::TOO_MANY_REQUESTS => CollaboratorError::retryable("GitHub rate limit exceeded"),
        s if s.is_server_error() => CollaboratorError::retryable(format!("GitHub unavailable ({})", s)),
        s => CollaboratorError::fatal(format!("unexpected GitHub response ({})", s)),
    };
    Some(err)
}
