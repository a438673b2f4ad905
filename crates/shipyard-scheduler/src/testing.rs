//! In-memory collaborators for scheduler tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shipyard_config::Settings;
use shipyard_core::{
    Branch, Build, CommitStatus, DatabaseAdmin, Error, FetchOutcome, HostingApi, NewBranch,
    NewBuild, NewRepository, ProcessSpec, PullInfo, RefInfo, RepoId, Repository, Result, Store,
    Supervisor, Vcs,
};
use shipyard_db::MemoryStore;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use crate::Context;

pub fn ref_info(name: &str, commit: &str, date: DateTime<Utc>) -> RefInfo {
    RefInfo {
        name: name.to_string(),
        commit: commit.to_string(),
        date,
        author: "Ada".to_string(),
        author_email: "ada@example.com".to_string(),
        subject: format!("commit {}", commit),
        committer: "Ada".to_string(),
        committer_email: "ada@example.com".to_string(),
    }
}

#[derive(Default)]
struct VcsState {
    up_to_date: bool,
    refs: HashMap<RepoId, Vec<RefInfo>>,
    remote: HashSet<(RepoId, String)>,
    merge_bases: HashMap<(RepoId, String, String), String>,
    dates: HashMap<String, DateTime<Utc>>,
    trees: HashMap<(RepoId, String), Vec<(String, String)>>,
    exports: Vec<(RepoId, String)>,
}

#[derive(Default)]
pub struct FakeVcs {
    state: Mutex<VcsState>,
}

impl FakeVcs {
    pub fn set_up_to_date(&self, up_to_date: bool) {
        self.state.lock().unwrap().up_to_date = up_to_date;
    }

    pub fn set_refs(&self, repo: &Repository, refs: Vec<RefInfo>) {
        self.state.lock().unwrap().refs.insert(repo.id, refs);
    }

    pub fn on_remote(&self, repo: &Repository, ref_name: &str) {
        self.state
            .lock()
            .unwrap()
            .remote
            .insert((repo.id, ref_name.to_string()));
    }

    pub fn set_merge_base(&self, repo: &Repository, a: &str, b: &str, base: &str, date: DateTime<Utc>) {
        let mut state = self.state.lock().unwrap();
        state
            .merge_bases
            .insert((repo.id, a.to_string(), b.to_string()), base.to_string());
        state.dates.insert(base.to_string(), date);
    }

    /// Files exported for `treeish`, as `(relative path, content)`.
    pub fn set_tree(&self, repo: &Repository, treeish: &str, files: &[(&str, &str)]) {
        self.state.lock().unwrap().trees.insert(
            (repo.id, treeish.to_string()),
            files
                .iter()
                .map(|(p, c)| (p.to_string(), c.to_string()))
                .collect(),
        );
    }

    pub fn exports(&self) -> Vec<(RepoId, String)> {
        self.state.lock().unwrap().exports.clone()
    }
}

#[async_trait]
impl Vcs for FakeVcs {
    async fn fetch(&self, _repo: &Repository) -> Result<FetchOutcome> {
        if self.state.lock().unwrap().up_to_date {
            Ok(FetchOutcome::UpToDate)
        } else {
            Ok(FetchOutcome::Fetched)
        }
    }

    async fn list_refs(&self, repo: &Repository) -> Result<Vec<RefInfo>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .refs
            .get(&repo.id)
            .cloned()
            .unwrap_or_default())
    }

    async fn export_tree(&self, repo: &Repository, treeish: &str, dest: &Path) -> Result<()> {
        let files = {
            let mut state = self.state.lock().unwrap();
            state.exports.push((repo.id, treeish.to_string()));
            state
                .trees
                .get(&(repo.id, treeish.to_string()))
                .cloned()
                .unwrap_or_default()
        };
        std::fs::create_dir_all(dest)?;
        for (relative, content) in files {
            let path = dest.join(relative);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, content)?;
        }
        Ok(())
    }

    async fn merge_base(&self, repo: &Repository, a: &str, b: &str) -> Result<Option<String>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .merge_bases
            .get(&(repo.id, a.to_string(), b.to_string()))
            .cloned())
    }

    async fn commit_date(&self, _repo: &Repository, commit: &str) -> Result<DateTime<Utc>> {
        self.state
            .lock()
            .unwrap()
            .dates
            .get(commit)
            .copied()
            .ok_or_else(|| Error::Vcs(format!("unknown commit {}", commit)))
    }

    async fn is_on_remote(&self, repo: &Repository, ref_name: &str) -> Result<bool> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .remote
            .contains(&(repo.id, ref_name.to_string())))
    }
}

#[derive(Default)]
pub struct FakeHosting {
    pulls: Mutex<HashMap<(RepoId, u64), PullInfo>>,
    statuses: Mutex<Vec<(String, CommitStatus)>>,
}

impl FakeHosting {
    pub fn add_pull(&self, repo: &Repository, number: u64, head: &str, base: &str, state: &str) {
        self.pulls.lock().unwrap().insert(
            (repo.id, number),
            PullInfo {
                number,
                state: state.to_string(),
                head_ref: head.to_string(),
                base_ref: base.to_string(),
            },
        );
    }

    pub fn statuses(&self) -> Vec<(String, CommitStatus)> {
        self.statuses.lock().unwrap().clone()
    }
}

#[async_trait]
impl HostingApi for FakeHosting {
    async fn pull_info(&self, repo: &Repository, number: u64) -> Result<Option<PullInfo>> {
        Ok(self.pulls.lock().unwrap().get(&(repo.id, number)).cloned())
    }

    async fn post_status(&self, _repo: &Repository, commit: &str, status: &CommitStatus) -> Result<()> {
        self.statuses
            .lock()
            .unwrap()
            .push((commit.to_string(), status.clone()));
        Ok(())
    }
}

#[derive(Default)]
struct SupervisorState {
    fail: bool,
    next_pid: i32,
    locks: HashMap<PathBuf, i32>,
    spawned: Vec<ProcessSpec>,
    killed: Vec<i32>,
}

/// Records spawned processes; a job runs until `finish` releases its lock.
#[derive(Default)]
pub struct FakeSupervisor {
    state: Mutex<SupervisorState>,
}

impl FakeSupervisor {
    pub fn fail_spawns(&self, fail: bool) {
        self.state.lock().unwrap().fail = fail;
    }

    pub fn finish(&self, lock_path: &Path) {
        self.state.lock().unwrap().locks.remove(lock_path);
    }

    pub fn spawned(&self) -> Vec<ProcessSpec> {
        self.state.lock().unwrap().spawned.clone()
    }

    pub fn last_spawned(&self) -> ProcessSpec {
        self.spawned().pop().expect("a spawned process")
    }

    pub fn killed(&self) -> Vec<i32> {
        self.state.lock().unwrap().killed.clone()
    }
}

impl Supervisor for FakeSupervisor {
    fn spawn(&self, spec: &ProcessSpec) -> Result<i32> {
        let mut state = self.state.lock().unwrap();
        if state.fail {
            return Err(Error::ExecutionFailed("spawn refused".to_string()));
        }
        state.next_pid += 1;
        let pid = 1000 + state.next_pid;
        state.locks.insert(spec.lock_path.clone(), pid);
        state.spawned.push(spec.clone());
        Ok(pid)
    }

    fn is_locked(&self, lock_path: &Path) -> Result<bool> {
        Ok(self.state.lock().unwrap().locks.contains_key(lock_path))
    }

    fn lock_holder(&self, lock_path: &Path) -> Result<Option<i32>> {
        Ok(self.state.lock().unwrap().locks.get(lock_path).copied())
    }

    fn kill_group(&self, pid: i32) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.killed.push(pid);
        state.locks.retain(|_, p| *p != pid);
        Ok(())
    }

    fn reap(&self) -> usize {
        0
    }
}

#[derive(Default)]
pub struct FakeDatabases {
    names: Mutex<BTreeSet<String>>,
}

impl FakeDatabases {
    pub fn add(&self, name: &str) {
        self.names.lock().unwrap().insert(name.to_string());
    }

    pub fn names(&self) -> Vec<String> {
        self.names.lock().unwrap().iter().cloned().collect()
    }
}

#[async_trait]
impl DatabaseAdmin for FakeDatabases {
    async fn create_database(&self, name: &str) -> Result<()> {
        if !self.names.lock().unwrap().insert(name.to_string()) {
            return Err(Error::Conflict(format!("database {} exists", name)));
        }
        Ok(())
    }

    async fn drop_database(&self, name: &str) -> Result<()> {
        self.names.lock().unwrap().remove(name);
        Ok(())
    }

    async fn list_databases(&self) -> Result<Vec<String>> {
        Ok(self.names())
    }
}

pub struct TestEnv {
    pub ctx: Context,
    pub store: Arc<MemoryStore>,
    pub vcs: Arc<FakeVcs>,
    pub hosting: Arc<FakeHosting>,
    pub supervisor: Arc<FakeSupervisor>,
    pub databases: Arc<FakeDatabases>,
    _root: TempDir,
}

impl TestEnv {
    pub async fn new() -> Self {
        Self::with_settings(|_| {}).await
    }

    pub async fn with_settings(customize: impl FnOnce(&mut Settings)) -> Self {
        let root = tempfile::tempdir().unwrap();
        let mut settings = Settings {
            root: root.path().to_path_buf(),
            host: "worker-1".to_string(),
            domain: "ci.example.com".to_string(),
            database_url: Some("postgres://db/shipyard".to_string()),
            ..Settings::default()
        };
        customize(&mut settings);

        let store = Arc::new(MemoryStore::new());
        let vcs = Arc::new(FakeVcs::default());
        let hosting = Arc::new(FakeHosting::default());
        let supervisor = Arc::new(FakeSupervisor::default());
        let databases = Arc::new(FakeDatabases::default());
        let ctx = Context::new(
            Arc::new(settings),
            store.clone(),
            vcs.clone(),
            hosting.clone(),
            supervisor.clone(),
            databases.clone(),
        );
        Self {
            ctx,
            store,
            vcs,
            hosting,
            supervisor,
            databases,
            _root: root,
        }
    }

    pub async fn repo(&self, name: &str) -> Repository {
        self.store
            .create_repository(NewRepository {
                name: name.to_string(),
                ..NewRepository::default()
            })
            .await
            .unwrap()
    }

    pub async fn branch(&self, repo: &Repository, ref_name: &str) -> Branch {
        self.store
            .create_branch(NewBranch::new(repo.id, ref_name))
            .await
            .unwrap()
    }

    pub async fn sticky_branch(&self, repo: &Repository, ref_name: &str) -> Branch {
        let mut branch = self.branch(repo, ref_name).await;
        branch.sticky = true;
        self.store.update_branch(&branch).await.unwrap();
        branch
    }

    pub async fn repo_with_branch(&self, name: &str, ref_name: &str) -> (Repository, Branch) {
        let repo = self.repo(name).await;
        let branch = self.branch(&repo, ref_name).await;
        (repo, branch)
    }

    pub async fn build(&self, repo: &Repository, branch: &Branch, commit: &str) -> Build {
        self.store
            .create_build(NewBuild {
                branch_id: branch.id,
                repo_id: repo.id,
                name: commit.to_string(),
                ..NewBuild::default()
            })
            .await
            .unwrap()
    }

    pub async fn reload(&self, build: &Build) -> Build {
        self.store.get_build(build.id).await.unwrap()
    }
}
