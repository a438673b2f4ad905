//! The periodic scheduling pass.

use shipyard_core::{
    Build, BuildFilter, BuildId, BuildOrder, BuildState, ProxyRoute, RepoId, Repository, Result,
};
use std::collections::HashSet;
use std::future::Future;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

use crate::Context;
use crate::catalog::discover_builds;
use crate::runner::{advance, kill};

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub discovered: usize,
    pub advanced: usize,
    pub admitted: usize,
    pub retired: usize,
    pub reaped: usize,
}

/// Drives discovery, admission, pipeline progress and retention.
pub struct Scheduler {
    ctx: Context,
}

impl Scheduler {
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// One full pass over the enabled repositories.
    ///
    /// Failures of a single repository or build are logged and skipped;
    /// only store failures on the shared queries abort the tick.
    pub async fn tick(&self) -> Result<TickReport> {
        let mut report = TickReport::default();
        let repos: Vec<Repository> = self
            .ctx
            .store
            .list_repositories()
            .await?
            .into_iter()
            .filter(Repository::is_enabled)
            .collect();
        let repo_ids: Vec<RepoId> = repos.iter().map(|r| r.id).collect();

        for repo in &repos {
            match discover_builds(&self.ctx, repo).await {
                Ok(created) => report.discovered += created,
                Err(e) => warn!(repo = %repo.name, error = %e, "Failed to update repository"),
            }
        }

        if !repo_ids.is_empty() {
            report.advanced = self.advance_active(&repo_ids).await?;
            report.admitted = self.admit_pending(&repo_ids).await?;
            report.retired = self.retire_running(&repo_ids).await?;
        }
        report.reaped = self.ctx.supervisor.reap();

        if let Err(e) = self.reload_proxy(&repos).await {
            warn!(error = %e, "Failed to reload proxy routes");
        }

        debug!(?report, "Tick done");
        Ok(report)
    }

    fn owned(&self, repo_ids: &[RepoId]) -> BuildFilter {
        BuildFilter::new()
            .repos(repo_ids.iter().copied())
            .host(self.ctx.settings.host.clone())
    }

    async fn advance_active(&self, repo_ids: &[RepoId]) -> Result<usize> {
        let active = self
            .ctx
            .store
            .search_builds(
                &self
                    .owned(repo_ids)
                    .states([BuildState::Testing, BuildState::Running, BuildState::Deathrow])
                    .order(BuildOrder::IdAsc),
            )
            .await?;
        let mut advanced = 0;
        for build in &active {
            match advance(&self.ctx, build).await {
                Ok(_) => advanced += 1,
                Err(e) => error!(build = %build.dest, error = %e, "Failed to advance build"),
            }
        }
        Ok(advanced)
    }

    /// Next pending build to admit: sticky branches first, then by sequence.
    async fn next_pending(&self, repo_ids: &[RepoId], tried: &HashSet<BuildId>) -> Result<Option<Build>> {
        let pending = BuildFilter::new()
            .repos(repo_ids.iter().copied())
            .state(BuildState::Pending)
            .order(BuildOrder::SequenceAsc);
        for filter in [pending.clone().sticky(true), pending] {
            let found = self.ctx.store.search_builds(&filter).await?;
            if let Some(build) = found.into_iter().find(|b| !tried.contains(&b.id)) {
                return Ok(Some(build));
            }
        }
        Ok(None)
    }

    async fn admit_pending(&self, repo_ids: &[RepoId]) -> Result<usize> {
        let mut tried = HashSet::new();
        let mut admitted = 0;
        loop {
            let testing = self
                .ctx
                .store
                .count_builds(&self.owned(repo_ids).state(BuildState::Testing))
                .await?;
            if testing >= self.ctx.settings.workers {
                break;
            }
            let Some(build) = self.next_pending(repo_ids, &tried).await? else {
                break;
            };
            tried.insert(build.id);
            match advance(&self.ctx, &build).await {
                Ok(started) if matches!(started.state, BuildState::Testing | BuildState::Running) => {
                    admitted += 1
                }
                Ok(started) => debug!(
                    build = %started.dest,
                    state = %started.state,
                    result = ?started.result,
                    "Build ended before it was admitted"
                ),
                Err(e) => error!(build = %build.dest, error = %e, "Failed to admit build"),
            }
        }
        Ok(admitted)
    }

    /// Kill running builds beyond `running_max`, keeping the newest running
    /// build of each sticky branch first.
    async fn retire_running(&self, repo_ids: &[RepoId]) -> Result<usize> {
        let running = self
            .ctx
            .store
            .search_builds(
                &self
                    .owned(repo_ids)
                    .state(BuildState::Running)
                    .order(BuildOrder::IdDesc),
            )
            .await?;
        let sticky: HashSet<_> = self
            .ctx
            .store
            .list_branches(repo_ids)
            .await?
            .into_iter()
            .filter(|b| b.sticky)
            .map(|b| b.id)
            .collect();

        let mut kept_branches = HashSet::new();
        let (mut order, mut rest) = (Vec::new(), Vec::new());
        for build in running {
            if sticky.contains(&build.branch_id) && kept_branches.insert(build.branch_id) {
                order.push(build);
            } else {
                rest.push(build);
            }
        }
        order.extend(rest);

        let mut retired = 0;
        for build in order.iter().skip(self.ctx.settings.running_max) {
            info!(build = %build.dest, "Retiring running build");
            match kill(&self.ctx, build, None).await {
                Ok(_) => retired += 1,
                Err(e) => error!(build = %build.dest, error = %e, "Failed to retire build"),
            }
        }
        Ok(retired)
    }

    async fn reload_proxy(&self, repos: &[Repository]) -> Result<()> {
        let Some(proxy) = &self.ctx.proxy else {
            return Ok(());
        };
        let proxied: Vec<RepoId> = repos.iter().filter(|r| r.nginx).map(|r| r.id).collect();
        let mut routes = Vec::new();
        if !proxied.is_empty() {
            let running = self
                .ctx
                .store
                .search_builds(
                    &BuildFilter::new()
                        .repos(proxied)
                        .state(BuildState::Running),
                )
                .await?;
            routes.extend(running.into_iter().filter_map(|b| {
                Some(ProxyRoute {
                    host: b.host?,
                    port: b.port?,
                    dest: b.dest,
                })
            }));
        }
        proxy.reload(&routes).await
    }

    /// Tick every `tick_interval` until `shutdown` resolves.
    ///
    /// Ticks never overlap; a tick that overruns delays the next one.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) {
        info!(
            host = %self.ctx.settings.host,
            interval = ?self.ctx.settings.tick_interval,
            "Starting scheduler"
        );
        let mut ticker = interval(self.ctx.settings.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Scheduler stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "Scheduler tick failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Job;
    use crate::testing::{TestEnv, ref_info};
    use async_trait::async_trait;
    use chrono::Utc;
    use shipyard_core::{BuildResult, ProcessSpec, ProxyRoutes, RepoMode, Store, Supervisor};
    use std::sync::{Arc, Mutex};

    const SERVER: &str = "git@example.com:acme/server.git";
    const TREE: [(&str, &str); 3] = [
        ("odoo-bin", ""),
        ("odoo/__init__.py", ""),
        ("odoo/addons/base/__manifest__.py", "{}"),
    ];

    #[derive(Default)]
    struct RecordingProxy {
        routes: Mutex<Vec<ProxyRoute>>,
    }

    #[async_trait]
    impl ProxyRoutes for RecordingProxy {
        async fn reload(&self, routes: &[ProxyRoute]) -> Result<()> {
            *self.routes.lock().unwrap() = routes.to_vec();
            Ok(())
        }
    }

    async fn count(env: &TestEnv, state: BuildState) -> usize {
        env.store
            .count_builds(&BuildFilter::new().state(state))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_sticky_branch_is_admitted_first() {
        let env = TestEnv::with_settings(|s| s.workers = 1).await;
        let repo = env.repo(SERVER).await;
        env.sticky_branch(&repo, "refs/heads/main").await;
        let now = Utc::now();
        env.vcs.set_refs(
            &repo,
            vec![
                ref_info("refs/heads/feature-x", "bbbbbb2", now),
                ref_info("refs/heads/main", "aaaaaa1", now),
            ],
        );
        for commit in ["aaaaaa1", "bbbbbb2"] {
            env.vcs.set_tree(&repo, commit, &TREE);
        }
        let scheduler = Scheduler::new(env.ctx.clone());

        let report = scheduler.tick().await.unwrap();
        assert_eq!(report.discovered, 2);
        assert_eq!(report.admitted, 1);
        assert_eq!(count(&env, BuildState::Testing).await, 1);

        let testing = env
            .store
            .search_builds(&BuildFilter::new().state(BuildState::Testing))
            .await
            .unwrap();
        let branch = env.store.get_branch(testing[0].branch_id).await.unwrap();
        assert_eq!(branch.name, "refs/heads/main");

        // Worker busy: the feature build waits.
        let report = scheduler.tick().await.unwrap();
        assert_eq!(report.admitted, 0);
        assert_eq!(count(&env, BuildState::Pending).await, 1);
    }

    #[tokio::test]
    async fn test_failed_admission_does_not_stop_the_queue() {
        let env = TestEnv::with_settings(|s| s.workers = 1).await;
        let repo = env.repo(SERVER).await;
        let now = Utc::now();
        env.vcs.set_refs(
            &repo,
            vec![
                ref_info("refs/heads/broken", "aaaaaa1", now),
                ref_info("refs/heads/ok", "bbbbbb2", now),
            ],
        );
        // Only the second commit has a server to run.
        env.vcs.set_tree(&repo, "bbbbbb2", &TREE);
        let scheduler = Scheduler::new(env.ctx.clone());

        let report = scheduler.tick().await.unwrap();

        // The broken build was tried but is not counted.
        assert_eq!(report.admitted, 1);
        assert_eq!(count(&env, BuildState::Testing).await, 1);
        let done = env
            .store
            .search_builds(&BuildFilter::new().state(BuildState::Done))
            .await
            .unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].result, Some(BuildResult::Ko));
    }

    #[tokio::test]
    async fn test_retention_keeps_sticky_builds() {
        let env = TestEnv::with_settings(|s| s.running_max = 1).await;
        let repo = env.repo(SERVER).await;
        let main = env.sticky_branch(&repo, "refs/heads/main").await;
        let feature = env.branch(&repo, "refs/heads/feature").await;
        let mut builds = Vec::new();
        for (branch, commit) in [(&main, "aaaaaa1"), (&feature, "bbbbbb2")] {
            let mut build = env.build(&repo, branch, commit).await;
            build.state = BuildState::Running;
            build.host = Some("worker-1".to_string());
            build.job = Some(Job::Run.name().to_string());
            env.store.update_build(&build).await.unwrap();
            let dir = env.ctx.build_dir(&build);
            let server = ProcessSpec::new(
                vec!["server".into()],
                dir.lock_path(Job::Run),
                dir.log_path(Job::Run),
            );
            env.supervisor.spawn(&server).unwrap();
            builds.push(build);
        }

        let report = Scheduler::new(env.ctx.clone()).tick().await.unwrap();

        assert_eq!(report.retired, 1);
        assert_eq!(env.reload(&builds[0]).await.state, BuildState::Running);
        assert_eq!(env.reload(&builds[1]).await.state, BuildState::Done);
    }

    #[tokio::test]
    async fn test_proxy_receives_running_builds_of_proxied_repositories() {
        let env = TestEnv::new().await;
        let proxy = Arc::new(RecordingProxy::default());
        let ctx = env.ctx.clone().with_proxy(proxy.clone());
        let (mut repo, branch) = env.repo_with_branch(SERVER, "refs/heads/main").await;
        repo.nginx = true;
        repo.mode = RepoMode::Hook;
        env.store.update_repository(&repo).await.unwrap();
        env.vcs.set_up_to_date(true);
        let mut build = env.build(&repo, &branch, "aaaaaa1").await;
        build.state = BuildState::Running;
        build.host = Some("worker-2".to_string());
        build.port = Some(2004);
        env.store.update_build(&build).await.unwrap();

        Scheduler::new(ctx).tick().await.unwrap();

        let routes = proxy.routes.lock().unwrap().clone();
        assert_eq!(
            routes,
            vec![ProxyRoute {
                dest: build.dest.clone(),
                host: "worker-2".to_string(),
                port: 2004,
            }]
        );
    }

    #[tokio::test]
    async fn test_disabled_repositories_are_ignored() {
        let env = TestEnv::new().await;
        let mut repo = env.repo(SERVER).await;
        repo.mode = RepoMode::Disabled;
        env.store.update_repository(&repo).await.unwrap();
        env.vcs
            .set_refs(&repo, vec![ref_info("refs/heads/main", "aaaaaa1", Utc::now())]);

        let report = Scheduler::new(env.ctx.clone()).tick().await.unwrap();
        assert_eq!(report, TickReport::default());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let env = TestEnv::new().await;
        let scheduler = Scheduler::new(env.ctx.clone());
        tokio::time::timeout(std::time::Duration::from_secs(5), scheduler.run(async {}))
            .await
            .unwrap();
    }
}
