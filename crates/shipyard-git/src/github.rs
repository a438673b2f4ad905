//! GitHub API client for pull request details and commit statuses.

use async_trait::async_trait;
use serde::Deserialize;
use shipyard_core::{CommitStatus, HostingApi, PullInfo, Repository, Result, Secret};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use crate::GitHubError;

/// Budget of one API request, connection included.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// GitHub API client holding one token per repository name.
///
/// Repositories without a token are never queried.
pub struct GitHubClient {
    client: reqwest::Client,
    tokens: HashMap<String, Secret>,
}

#[derive(Debug, Deserialize)]
struct PullRef {
    #[serde(rename = "ref")]
    name: String,
}

#[derive(Debug, Deserialize)]
struct PullResponse {
    number: u64,
    state: String,
    head: PullRef,
    base: PullRef,
}

impl From<PullResponse> for PullInfo {
    fn from(pr: PullResponse) -> Self {
        PullInfo {
            number: pr.number,
            state: pr.state,
            head_ref: pr.head.name,
            base_ref: pr.base.name,
        }
    }
}

impl GitHubClient {
    pub fn new(tokens: HashMap<String, Secret>) -> std::result::Result<Self, GitHubError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| GitHubError::Request(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client, tokens })
    }

    /// `https://api.<host>/repos/<owner>/<repo>/<path>` for a repository.
    pub fn api_url(repo: &Repository, path: &str) -> std::result::Result<String, GitHubError> {
        let (host, owner, name) = repo
            .api_coordinates()
            .ok_or_else(|| GitHubError::UnsupportedRemote(repo.name.clone()))?;
        Ok(format!(
            "https://api.{}/repos/{}/{}/{}",
            host,
            owner,
            name,
            path.trim_start_matches('/')
        ))
    }

    fn token(&self, repo: &Repository) -> Option<&Secret> {
        self.tokens.get(&repo.name)
    }

    async fn get_pull(
        &self,
        url: &str,
        token: &Secret,
    ) -> std::result::Result<PullInfo, GitHubError> {
        let response = self
            .client
            .get(url)
            .header("Authorization", format!("Bearer {}", token.expose()))
            .header("User-Agent", "shipyard-ci")
            .header("Accept", "application/vnd.github+json")
            .send()
            .await
            .map_err(|e| GitHubError::Request(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(GitHubError::Api(format!(
                "Failed to get pull request ({}): {}",
                status, text
            )));
        }

        let pr: PullResponse = response
            .json()
            .await
            .map_err(|e| GitHubError::Parse(e.to_string()))?;
        Ok(pr.into())
    }

    async fn create_status(
        &self,
        url: &str,
        token: &Secret,
        status: &CommitStatus,
    ) -> std::result::Result<(), GitHubError> {
        let response = self
            .client
            .post(url)
            .header("Authorization", format!("Bearer {}", token.expose()))
            .header("User-Agent", "shipyard-ci")
            .header("Accept", "application/vnd.github+json")
            .json(status)
            .send()
            .await
            .map_err(|e| GitHubError::Request(e.to_string()))?;

        if !response.status().is_success() {
            let code = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(GitHubError::Api(format!(
                "Failed to create status ({}): {}",
                code, text
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl HostingApi for GitHubClient {
    async fn pull_info(&self, repo: &Repository, number: u64) -> Result<Option<PullInfo>> {
        let Some(token) = self.token(repo) else {
            return Ok(None);
        };
        let url = Self::api_url(repo, &format!("pulls/{}", number))?;
        debug!(url = %url, "Fetching pull request");
        Ok(Some(self.get_pull(&url, token).await?))
    }

    async fn post_status(
        &self,
        repo: &Repository,
        commit: &str,
        status: &CommitStatus,
    ) -> Result<()> {
        let Some(token) = self.token(repo) else {
            return Ok(());
        };
        let url = Self::api_url(repo, &format!("statuses/{}", commit))?;
        debug!(url = %url, state = ?status.state, "Posting commit status");
        Ok(self.create_status(&url, token, status).await?)
    }
}
