//! Version-control seam: the local mirror of a remote repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::{Repository, Result};

/// A head or pull-request ref as listed by the mirror.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefInfo {
    /// Full ref name.
    pub name: String,
    /// Commit id the ref points to.
    pub commit: String,
    pub date: DateTime<Utc>,
    pub author: String,
    pub author_email: String,
    pub subject: String,
    pub committer: String,
    pub committer_email: String,
}

/// Outcome of refreshing a mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    Fetched,
    /// Hook-mode repository with no notification since the last fetch.
    UpToDate,
}

/// Operations on the local mirror of a repository.
#[async_trait]
pub trait Vcs: Send + Sync {
    /// Create the mirror if needed and fetch heads and pull refs, pruning deleted refs.
    async fn fetch(&self, repo: &Repository) -> Result<FetchOutcome>;

    /// Every head and pull ref, newest commit first.
    async fn list_refs(&self, repo: &Repository) -> Result<Vec<RefInfo>>;

    /// Materialise the tree of `treeish` into `dest`.
    ///
    /// Either the whole tree is extracted or an error is returned.
    async fn export_tree(&self, repo: &Repository, treeish: &str, dest: &Path) -> Result<()>;

    /// Common ancestor of two refs, `None` when they share no history.
    async fn merge_base(&self, repo: &Repository, a: &str, b: &str) -> Result<Option<String>>;

    /// Committer date of a commit.
    async fn commit_date(&self, repo: &Repository, commit: &str) -> Result<DateTime<Utc>>;

    /// Whether the ref still exists on the remote.
    async fn is_on_remote(&self, repo: &Repository, ref_name: &str) -> Result<bool>;
}
