//! In-process store, used by tests and single-shot CLI runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shipyard_core::branch::NewBranch;
use shipyard_core::build::build_dest;
use shipyard_core::repository::NewRepository;
use shipyard_core::{
    Branch, BranchId, Build, BuildFilter, BuildId, BuildLogEntry, BuildState, Error, NewBuild,
    RepoId, Repository, Result, Store,
};
use std::collections::BTreeMap;
use tokio::sync::RwLock;

#[derive(Default)]
struct Tables {
    repositories: BTreeMap<RepoId, Repository>,
    branches: BTreeMap<BranchId, Branch>,
    builds: BTreeMap<BuildId, Build>,
    logs: Vec<BuildLogEntry>,
    last_id: i64,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.last_id += 1;
        self.last_id
    }

    fn select(&self, filter: &BuildFilter) -> Vec<Build> {
        let mut builds: Vec<Build> = self
            .builds
            .values()
            .filter(|b| {
                let sticky = self
                    .branches
                    .get(&b.branch_id)
                    .is_some_and(|branch| branch.sticky);
                filter.matches(b, sticky)
            })
            .cloned()
            .collect();
        filter.sort(&mut builds);
        builds
    }
}

/// Store keeping every record in memory behind a single lock.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_repository(&self, new: NewRepository) -> Result<Repository> {
        let mut tables = self.tables.write().await;
        if tables.repositories.values().any(|r| r.name == new.name) {
            return Err(Error::Conflict(format!("repository {}", new.name)));
        }
        let repo = Repository {
            id: RepoId::new(tables.next_id()),
            name: new.name,
            sequence: new.sequence,
            mode: new.mode,
            hook_time: None,
            duplicate_of: None,
            dependencies: Vec::new(),
            modules: new.modules,
            modules_auto: new.modules_auto,
            nginx: new.nginx,
        };
        tables.repositories.insert(repo.id, repo.clone());
        Ok(repo)
    }

    async fn get_repository(&self, id: RepoId) -> Result<Repository> {
        let tables = self.tables.read().await;
        tables
            .repositories
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("repository {}", id)))
    }

    async fn find_repository(&self, name: &str) -> Result<Option<Repository>> {
        let tables = self.tables.read().await;
        Ok(tables
            .repositories
            .values()
            .find(|r| r.name == name)
            .cloned())
    }

    async fn list_repositories(&self) -> Result<Vec<Repository>> {
        let tables = self.tables.read().await;
        let mut repos: Vec<Repository> = tables.repositories.values().cloned().collect();
        repos.sort_by_key(|r| (r.sequence, r.id));
        Ok(repos)
    }

    async fn update_repository(&self, repo: &Repository) -> Result<()> {
        let mut tables = self.tables.write().await;
        match tables.repositories.get_mut(&repo.id) {
            Some(slot) => {
                *slot = repo.clone();
                Ok(())
            }
            None => Err(Error::NotFound(format!("repository {}", repo.id))),
        }
    }

    async fn set_hook_time(&self, id: RepoId, at: DateTime<Utc>) -> Result<()> {
        let mut tables = self.tables.write().await;
        let repo = tables
            .repositories
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("repository {}", id)))?;
        repo.hook_time = Some(at);
        Ok(())
    }

    async fn create_branch(&self, new: NewBranch) -> Result<Branch> {
        let mut tables = self.tables.write().await;
        if tables
            .branches
            .values()
            .any(|b| b.repo_id == new.repo_id && b.name == new.name)
        {
            return Err(Error::Conflict(format!("branch {}", new.name)));
        }
        let branch = Branch {
            id: BranchId::new(tables.next_id()),
            repo_id: new.repo_id,
            name: new.name,
            sticky: new.sticky,
            coverage: new.coverage,
            pull_head_name: new.pull_head_name,
            modules: None,
            job_timeout: None,
        };
        tables.branches.insert(branch.id, branch.clone());
        Ok(branch)
    }

    async fn get_branch(&self, id: BranchId) -> Result<Branch> {
        let tables = self.tables.read().await;
        tables
            .branches
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("branch {}", id)))
    }

    async fn find_branch(&self, repo_id: RepoId, name: &str) -> Result<Option<Branch>> {
        let tables = self.tables.read().await;
        Ok(tables
            .branches
            .values()
            .find(|b| b.repo_id == repo_id && b.name == name)
            .cloned())
    }

    async fn list_branches(&self, repo_ids: &[RepoId]) -> Result<Vec<Branch>> {
        let tables = self.tables.read().await;
        Ok(tables
            .branches
            .values()
            .rev()
            .filter(|b| repo_ids.contains(&b.repo_id))
            .cloned()
            .collect())
    }

    async fn update_branch(&self, branch: &Branch) -> Result<()> {
        let mut tables = self.tables.write().await;
        match tables.branches.get_mut(&branch.id) {
            Some(slot) => {
                *slot = branch.clone();
                Ok(())
            }
            None => Err(Error::NotFound(format!("branch {}", branch.id))),
        }
    }

    async fn create_build(&self, new: NewBuild) -> Result<Build> {
        let mut tables = self.tables.write().await;
        let nickname = tables
            .branches
            .get(&new.branch_id)
            .map(|b| b.nickname().to_string())
            .ok_or_else(|| Error::NotFound(format!("branch {}", new.branch_id)))?;

        let id = BuildId::new(tables.next_id());
        let build = Build {
            id,
            branch_id: new.branch_id,
            repo_id: new.repo_id,
            sequence: new.sequence.unwrap_or(id.get()),
            state: new.state,
            result: None,
            job: None,
            job_start: None,
            job_end: None,
            host: None,
            port: None,
            pid: None,
            duplicate_of: new.duplicate_of,
            server_match: None,
            modules: new.modules,
            dest: build_dest(id, &nickname, &new.name),
            name: new.name,
            date: new.date,
            author: new.author,
            author_email: new.author_email,
            committer: new.committer,
            committer_email: new.committer_email,
            subject: new.subject,
            created_at: Utc::now(),
        };
        tables.builds.insert(id, build.clone());
        Ok(build)
    }

    async fn get_build(&self, id: BuildId) -> Result<Build> {
        let tables = self.tables.read().await;
        tables
            .builds
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("build {}", id)))
    }

    async fn update_build(&self, build: &Build) -> Result<()> {
        let mut tables = self.tables.write().await;
        match tables.builds.get_mut(&build.id) {
            Some(slot) => {
                *slot = build.clone();
                Ok(())
            }
            None => Err(Error::NotFound(format!("build {}", build.id))),
        }
    }

    async fn transition_build(&self, build: &Build, from: BuildState) -> Result<bool> {
        let mut tables = self.tables.write().await;
        match tables.builds.get_mut(&build.id) {
            Some(slot) if slot.state == from => {
                *slot = build.clone();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(Error::NotFound(format!("build {}", build.id))),
        }
    }

    async fn search_builds(&self, filter: &BuildFilter) -> Result<Vec<Build>> {
        let tables = self.tables.read().await;
        let limit = filter.limit.unwrap_or(usize::MAX);
        Ok(tables
            .select(filter)
            .into_iter()
            .skip(filter.offset)
            .take(limit)
            .collect())
    }

    async fn count_builds(&self, filter: &BuildFilter) -> Result<usize> {
        let tables = self.tables.read().await;
        Ok(tables.select(filter).len())
    }

    async fn append_build_log(&self, build_id: BuildId, func: &str, message: &str) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.logs.push(BuildLogEntry {
            build_id,
            func: func.to_string(),
            message: message.to_string(),
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn build_logs(&self, build_id: BuildId) -> Result<Vec<BuildLogEntry>> {
        let tables = self.tables.read().await;
        Ok(tables
            .logs
            .iter()
            .filter(|l| l.build_id == build_id)
            .cloned()
            .collect())
    }
}
