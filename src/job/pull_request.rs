use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Result, SimError};

/// Coordinates of a GitHub pull request, parsed from its web URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PullRequestRef {
    pub owner: String,
    pub repo: String,
    pub number: u64,
}

impl PullRequestRef {
    /// Parse `https://github.com/<owner>/<repo>/pull/<number>`.
    pub fn parse(pr_url: &str) -> Result<Self> {
        let pr_url = pr_url.trim();
        if pr_url.is_empty() {
            return Err(SimError::InvalidPrUrl("PR URL cannot be empty".to_string()));
        }

        let url = Url::parse(pr_url)
            .map_err(|e| SimError::InvalidPrUrl(format!("invalid URL format: {}", e)))?;

        if !matches!(url.scheme(), "https" | "http") {
            return Err(SimError::InvalidPrUrl(format!(
                "unsupported scheme '{}'",
                url.scheme()
            )));
        }

        let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
        if host != "github.com" && host != "www.github.com" {
            return Err(SimError::InvalidPrUrl("URL must be from github.com".to_string()));
        }

        let path = url.path().strip_suffix('/').unwrap_or(url.path());
        let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();
        let (owner, repo, number) = match segments.as_slice() {
            [owner, repo, "pull", number] => (*owner, *repo, *number),
            _ => {
                return Err(SimError::InvalidPrUrl(
                    "expected https://github.com/owner/repo/pull/123".to_string(),
                ))
            }
        };

        if owner.is_empty() || repo.is_empty() {
            return Err(SimError::InvalidPrUrl(
                "owner and repository name cannot be empty".to_string(),
            ));
        }

        let number: u64 = number
            .parse()
            .map_err(|_| SimError::InvalidPrUrl(format!("invalid pull request number '{}'", number)))?;
        if number == 0 {
            return Err(SimError::InvalidPrUrl(
                "pull request number must be positive".to_string(),
            ));
        }

        Ok(Self {
            owner: owner.to_string(),
            repo: repo.to_string(),
            number,
        })
    }

    /// `owner/repo`
    pub fn slug(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }
}

impl std::fmt::Display for PullRequestRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}#{}", self.owner, self.repo, self.number)
    }
}
