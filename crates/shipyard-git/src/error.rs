//! Git and hosting API errors.

use std::time::Duration;
use thiserror::Error;

/// Git operation errors.
#[derive(Debug, Error)]
pub enum GitError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("git {command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("unexpected git output: {0}")]
    Parse(String),

    #[error("{command} timed out after {after:?}")]
    Timeout { command: String, after: Duration },
}

impl From<GitError> for shipyard_core::Error {
    fn from(err: GitError) -> Self {
        match err {
            GitError::Timeout { .. } => shipyard_core::Error::Timeout(err.to_string()),
            _ => shipyard_core::Error::Vcs(err.to_string()),
        }
    }
}

/// GitHub API errors.
#[derive(Debug, Error)]
pub enum GitHubError {
    #[error("Request failed: {0}")]
    Request(String),

    #[error("API error: {0}")]
    Api(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Unsupported remote: {0}")]
    UnsupportedRemote(String),
}

impl From<GitHubError> for shipyard_core::Error {
    fn from(err: GitHubError) -> Self {
        shipyard_core::Error::Hosting(err.to_string())
    }
}
