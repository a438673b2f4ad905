//! In-memory state for route tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shipyard_config::Settings;
use shipyard_core::{
    Build, CommitStatus, DatabaseAdmin, Error, FetchOutcome, HostingApi, NewBranch, NewBuild,
    NewRepository, ProcessSpec, PullInfo, RefInfo, Repository, Result, Secret, Supervisor, Vcs,
};
use shipyard_db::MemoryStore;
use shipyard_scheduler::Context;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::AppState;

/// Collaborators the routes never reach.
struct Offline;

#[async_trait]
impl Vcs for Offline {
    async fn fetch(&self, _repo: &Repository) -> Result<FetchOutcome> {
        Ok(FetchOutcome::UpToDate)
    }

    async fn list_refs(&self, _repo: &Repository) -> Result<Vec<RefInfo>> {
        Ok(Vec::new())
    }

    async fn export_tree(&self, _repo: &Repository, treeish: &str, _dest: &Path) -> Result<()> {
        Err(Error::Vcs(format!("offline: {}", treeish)))
    }

    async fn merge_base(&self, _repo: &Repository, _a: &str, _b: &str) -> Result<Option<String>> {
        Ok(None)
    }

    async fn commit_date(&self, _repo: &Repository, commit: &str) -> Result<DateTime<Utc>> {
        Err(Error::Vcs(format!("offline: {}", commit)))
    }

    async fn is_on_remote(&self, _repo: &Repository, _ref_name: &str) -> Result<bool> {
        Ok(false)
    }
}

#[async_trait]
impl HostingApi for Offline {
    async fn pull_info(&self, _repo: &Repository, _number: u64) -> Result<Option<PullInfo>> {
        Ok(None)
    }

    async fn post_status(
        &self,
        _repo: &Repository,
        _commit: &str,
        _status: &CommitStatus,
    ) -> Result<()> {
        Ok(())
    }
}

impl Supervisor for Offline {
    fn spawn(&self, _spec: &ProcessSpec) -> Result<i32> {
        Err(Error::ExecutionFailed("offline".to_string()))
    }

    fn is_locked(&self, _lock_path: &Path) -> Result<bool> {
        Ok(false)
    }

    fn lock_holder(&self, _lock_path: &Path) -> Result<Option<i32>> {
        Ok(None)
    }

    fn kill_group(&self, _pid: i32) -> Result<()> {
        Ok(())
    }

    fn reap(&self) -> usize {
        0
    }
}

#[async_trait]
impl DatabaseAdmin for Offline {
    async fn create_database(&self, _name: &str) -> Result<()> {
        Ok(())
    }

    async fn drop_database(&self, _name: &str) -> Result<()> {
        Ok(())
    }

    async fn list_databases(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

pub fn api_state(webhook_secrets: HashMap<String, Secret>) -> AppState {
    let settings = Settings {
        host: "worker-1".to_string(),
        domain: "ci.example.com".to_string(),
        ..Settings::default()
    };
    let offline = Arc::new(Offline);
    let ctx = Context::new(
        Arc::new(settings),
        Arc::new(MemoryStore::new()),
        offline.clone(),
        offline.clone(),
        offline.clone(),
        offline,
    );
    AppState::new(ctx, webhook_secrets)
}

pub async fn repo(state: &AppState, name: &str) -> Repository {
    state
        .ctx
        .store
        .create_repository(NewRepository {
            name: name.to_string(),
            ..Default::default()
        })
        .await
        .unwrap()
}

/// A pending build of `commit` on `ref_name`, creating the branch if needed.
pub async fn build(state: &AppState, repo: &Repository, ref_name: &str, commit: &str) -> Build {
    let store = &state.ctx.store;
    let branch = match store.find_branch(repo.id, ref_name).await.unwrap() {
        Some(branch) => branch,
        None => store
            .create_branch(NewBranch::new(repo.id, ref_name))
            .await
            .unwrap(),
    };
    store
        .create_build(NewBuild {
            branch_id: branch.id,
            repo_id: repo.id,
            name: commit.to_string(),
            ..Default::default()
        })
        .await
        .unwrap()
}
