//! Record store seam.
//!
//! The orchestrator only needs CRUD on repositories, branches and builds
//! plus a filtered, ordered build search.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::branch::NewBranch;
use crate::repository::NewRepository;
use crate::{
    Branch, BranchId, Build, BuildId, BuildLogEntry, BuildResult, BuildState, NewBuild, RepoId,
    Repository, Result,
};

/// Ordering of build search results. Ties are broken by id.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BuildOrder {
    SequenceAsc,
    SequenceDesc,
    IdAsc,
    #[default]
    IdDesc,
}

/// Conjunctive filter over builds.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildFilter {
    pub ids: Option<Vec<BuildId>>,
    pub repo_ids: Option<Vec<RepoId>>,
    pub branch_id: Option<BranchId>,
    /// Commit id.
    pub name: Option<String>,
    pub states: Option<Vec<BuildState>>,
    pub host: Option<String>,
    /// Only builds on sticky (or non-sticky) branches.
    pub sticky: Option<bool>,
    /// Only builds that do (or do not) point at a reference build.
    pub has_duplicate_link: Option<bool>,
    pub duplicate_of: Option<BuildId>,
    /// Result is empty or differs from this one.
    pub result_not: Option<BuildResult>,
    pub dests: Option<Vec<String>>,
    pub order: BuildOrder,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl BuildFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids(mut self, ids: impl IntoIterator<Item = BuildId>) -> Self {
        self.ids = Some(ids.into_iter().collect());
        self
    }

    pub fn repos(mut self, repo_ids: impl IntoIterator<Item = RepoId>) -> Self {
        self.repo_ids = Some(repo_ids.into_iter().collect());
        self
    }

    pub fn branch(mut self, branch_id: BranchId) -> Self {
        self.branch_id = Some(branch_id);
        self
    }

    pub fn commit(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn state(self, state: BuildState) -> Self {
        self.states([state])
    }

    pub fn states(mut self, states: impl IntoIterator<Item = BuildState>) -> Self {
        self.states = Some(states.into_iter().collect());
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn sticky(mut self, sticky: bool) -> Self {
        self.sticky = Some(sticky);
        self
    }

    pub fn has_duplicate_link(mut self, linked: bool) -> Self {
        self.has_duplicate_link = Some(linked);
        self
    }

    pub fn duplicate_of(mut self, reference: BuildId) -> Self {
        self.duplicate_of = Some(reference);
        self
    }

    pub fn result_not(mut self, result: BuildResult) -> Self {
        self.result_not = Some(result);
        self
    }

    pub fn dests(mut self, dests: impl IntoIterator<Item = String>) -> Self {
        self.dests = Some(dests.into_iter().collect());
        self
    }

    pub fn order(mut self, order: BuildOrder) -> Self {
        self.order = order;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Whether a build passes every condition except ordering and paging.
    ///
    /// `branch_sticky` is the sticky flag of the build's branch.
    pub fn matches(&self, build: &Build, branch_sticky: bool) -> bool {
        fn within<T: PartialEq>(set: &Option<Vec<T>>, value: &T) -> bool {
            set.as_ref().is_none_or(|set| set.contains(value))
        }

        within(&self.ids, &build.id)
            && within(&self.repo_ids, &build.repo_id)
            && within(&self.states, &build.state)
            && within(&self.dests, &build.dest)
            && self.branch_id.is_none_or(|b| b == build.branch_id)
            && self.name.as_ref().is_none_or(|n| *n == build.name)
            && self
                .host
                .as_ref()
                .is_none_or(|h| build.host.as_ref() == Some(h))
            && self.sticky.is_none_or(|s| s == branch_sticky)
            && self
                .has_duplicate_link
                .is_none_or(|linked| linked == build.duplicate_of.is_some())
            && self
                .duplicate_of
                .is_none_or(|reference| build.duplicate_of == Some(reference))
            && self
                .result_not
                .is_none_or(|result| build.result != Some(result))
    }

    /// Sort builds in place according to `order`.
    pub fn sort(&self, builds: &mut [Build]) {
        match self.order {
            BuildOrder::SequenceAsc => builds.sort_by_key(|b| (b.sequence, b.id)),
            BuildOrder::SequenceDesc => {
                builds.sort_by_key(|b| std::cmp::Reverse((b.sequence, b.id)))
            }
            BuildOrder::IdAsc => builds.sort_by_key(|b| b.id),
            BuildOrder::IdDesc => builds.sort_by_key(|b| std::cmp::Reverse(b.id)),
        }
    }
}

/// Persistent store of repositories, branches and builds.
#[async_trait]
pub trait Store: Send + Sync {
    async fn create_repository(&self, new: NewRepository) -> Result<Repository>;
    async fn get_repository(&self, id: RepoId) -> Result<Repository>;
    async fn find_repository(&self, name: &str) -> Result<Option<Repository>>;
    /// All repositories ordered by sequence then id.
    async fn list_repositories(&self) -> Result<Vec<Repository>>;
    async fn update_repository(&self, repo: &Repository) -> Result<()>;
    async fn set_hook_time(&self, id: RepoId, at: DateTime<Utc>) -> Result<()>;

    async fn create_branch(&self, new: NewBranch) -> Result<Branch>;
    async fn get_branch(&self, id: BranchId) -> Result<Branch>;
    async fn find_branch(&self, repo_id: RepoId, name: &str) -> Result<Option<Branch>>;
    /// Branches of the given repositories, newest first.
    async fn list_branches(&self, repo_ids: &[RepoId]) -> Result<Vec<Branch>>;
    async fn update_branch(&self, branch: &Branch) -> Result<()>;

    /// Insert a build; its sequence defaults to its id and its dest is derived.
    async fn create_build(&self, new: NewBuild) -> Result<Build>;
    async fn get_build(&self, id: BuildId) -> Result<Build>;
    /// Persist every field of the build.
    async fn update_build(&self, build: &Build) -> Result<()>;
    /// Persist every field of the build if its stored state is still `from`.
    ///
    /// Returns `false` when another writer changed the state first.
    async fn transition_build(&self, build: &Build, from: BuildState) -> Result<bool>;
    async fn search_builds(&self, filter: &BuildFilter) -> Result<Vec<Build>>;
    async fn count_builds(&self, filter: &BuildFilter) -> Result<usize>;

    async fn append_build_log(&self, build_id: BuildId, func: &str, message: &str) -> Result<()>;
    async fn build_logs(&self, build_id: BuildId) -> Result<Vec<BuildLogEntry>>;
}
