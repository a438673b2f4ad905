//! Code-hosting service seam (commit statuses, pull requests).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{Repository, Result};

/// The subset of a pull request the orchestrator looks at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullInfo {
    pub number: u64,
    /// `open` or `closed`.
    pub state: String,
    /// Branch the pull request is made from.
    pub head_ref: String,
    /// Branch the pull request targets.
    pub base_ref: String,
}

impl PullInfo {
    pub fn is_open(&self) -> bool {
        self.state == "open"
    }
}

/// Commit status state as understood by the hosting service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusState {
    Pending,
    Success,
    Failure,
    Error,
}

/// Payload of a commit status update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitStatus {
    pub state: StatusState,
    pub target_url: String,
    pub description: String,
    pub context: String,
}

/// Client for the code-hosting API.
///
/// Callers treat every error as "no information"; nothing here is fatal.
#[async_trait]
pub trait HostingApi: Send + Sync {
    /// Pull request details; `Ok(None)` when the repository has no token.
    async fn pull_info(&self, repo: &Repository, number: u64) -> Result<Option<PullInfo>>;

    /// Publish a commit status.
    async fn post_status(&self, repo: &Repository, commit: &str, status: &CommitStatus)
    -> Result<()>;
}
