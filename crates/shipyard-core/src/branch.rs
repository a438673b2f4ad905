//! Branches and pull-request refs of a repository.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use std::time::Duration;

use crate::repository::split_modules;
use crate::{BranchId, RepoId, Repository};

static COVERAGE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bcoverage\b").expect("valid coverage regex"));

pub const HEADS_PREFIX: &str = "refs/heads/";
pub const PULL_PREFIX: &str = "refs/pull/";

/// A ref of a repository that builds are made from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    pub id: BranchId,
    pub repo_id: RepoId,
    /// Full ref name, e.g. `refs/heads/master` or `refs/pull/42`.
    pub name: String,
    /// Always kept, never skipped, scheduled first.
    pub sticky: bool,
    pub coverage: bool,
    /// Head branch name of a pull request, when known.
    pub pull_head_name: Option<String>,
    /// Comma-separated modules to test, overriding nothing but adding to the repo list.
    pub modules: Option<String>,
    /// Per-branch job timeout in minutes.
    pub job_timeout: Option<i32>,
}

/// Fields needed to create a branch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewBranch {
    pub repo_id: RepoId,
    pub name: String,
    pub sticky: bool,
    pub coverage: bool,
    pub pull_head_name: Option<String>,
}

impl NewBranch {
    /// A new branch with the coverage flag derived from the ref name.
    pub fn new(repo_id: RepoId, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            repo_id,
            coverage: coverage_default(&name),
            name,
            sticky: false,
            pull_head_name: None,
        }
    }
}

/// Whether a ref name asks for coverage, i.e. contains the word `coverage`.
pub fn coverage_default(ref_name: &str) -> bool {
    COVERAGE_RE.is_match(ref_name)
}

/// Last path segment of a ref name.
pub fn short_name(ref_name: &str) -> &str {
    ref_name.rsplit('/').next().unwrap_or(ref_name)
}

impl Branch {
    /// Last path segment of the ref, e.g. `master` or the pull request number.
    pub fn short_name(&self) -> &str {
        short_name(&self.name)
    }

    pub fn is_pull(&self) -> bool {
        self.name.starts_with(PULL_PREFIX)
    }

    pub fn is_head(&self) -> bool {
        self.name.starts_with(HEADS_PREFIX)
    }

    pub fn pull_number(&self) -> Option<u64> {
        self.name.strip_prefix(PULL_PREFIX)?.parse().ok()
    }

    /// Browser URL of the branch or pull request on the hosting service.
    pub fn url(&self, repo: &Repository) -> String {
        let short = self.short_name();
        if !short.is_empty() && short.chars().all(|c| c.is_ascii_digit()) {
            format!("https://{}/pull/{}", repo.base(), short)
        } else {
            format!("https://{}/tree/{}", repo.base(), short)
        }
    }

    /// Branch-specific job timeout, if one is set.
    pub fn job_timeout(&self) -> Option<Duration> {
        self.job_timeout
            .filter(|minutes| *minutes > 0)
            .map(|minutes| Duration::from_secs(minutes as u64 * 60))
    }

    pub fn explicit_modules(&self) -> Vec<String> {
        split_modules(self.modules.as_deref())
    }

    /// Third path segment of the ref, used in build destinations.
    pub fn nickname(&self) -> &str {
        self.name.split('/').nth(2).unwrap_or(self.short_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ModulesAuto, RepoMode};

    fn branch(name: &str) -> Branch {
        Branch {
            id: BranchId::new(1),
            repo_id: RepoId::new(1),
            name: name.to_string(),
            sticky: false,
            coverage: false,
            pull_head_name: None,
            modules: None,
            job_timeout: None,
        }
    }

    #[test]
    fn test_short_name_and_kind() {
        let head = branch("refs/heads/feature-x");
        assert_eq!(head.short_name(), "feature-x");
        assert!(head.is_head());
        assert!(!head.is_pull());

        let pull = branch("refs/pull/42");
        assert_eq!(pull.short_name(), "42");
        assert_eq!(pull.pull_number(), Some(42));
        assert!(pull.is_pull());
    }

    #[test]
    fn test_coverage_default() {
        assert!(coverage_default("refs/heads/master-coverage"));
        assert!(coverage_default("refs/heads/coverage"));
        assert!(!coverage_default("refs/heads/nocoverage"));
        assert!(NewBranch::new(RepoId::new(1), "refs/heads/17.0-coverage").coverage);
    }

    #[test]
    fn test_url() {
        let repo = Repository {
            id: RepoId::new(1),
            name: "git@github.com:acme/server.git".to_string(),
            sequence: 0,
            mode: RepoMode::Poll,
            hook_time: None,
            duplicate_of: None,
            dependencies: vec![],
            modules: None,
            modules_auto: ModulesAuto::Repo,
            nginx: false,
        };
        assert_eq!(
            branch("refs/pull/7").url(&repo),
            "https://github.com/acme/server/pull/7"
        );
        assert_eq!(
            branch("refs/heads/master").url(&repo),
            "https://github.com/acme/server/tree/master"
        );
    }

    #[test]
    fn test_job_timeout_ignores_zero() {
        let mut b = branch("refs/heads/master");
        b.job_timeout = Some(0);
        assert_eq!(b.job_timeout(), None);
        b.job_timeout = Some(45);
        assert_eq!(b.job_timeout(), Some(Duration::from_secs(2700)));
    }
}
