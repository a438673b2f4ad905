//! Git mirrors and code-hosting client for the shipyard build orchestrator.

pub mod error;
pub mod github;
pub mod mirror;

pub use error::{GitError, GitHubError};
pub use github::GitHubClient;
pub use mirror::GitMirror;
