//! Materializing branches and builds from the refs of a repository.

use chrono::{DateTime, Duration, Utc};
use shipyard_core::branch::PULL_PREFIX;
use shipyard_core::{
    Branch, Build, BuildFilter, BuildOrder, BuildResult, BuildState, Error, FetchOutcome,
    NewBranch, NewBuild, RefInfo, Repository, Result,
};
use tracing::{debug, info, warn};

use crate::Context;
use crate::actions::skip;
use crate::matcher::closest_branch;

/// Existing branch `ref_name` of `repo`, created when missing.
pub async fn upsert_branch(ctx: &Context, repo: &Repository, ref_name: &str) -> Result<Branch> {
    if let Some(branch) = ctx.store.find_branch(repo.id, ref_name).await? {
        return Ok(branch);
    }

    let mut new = NewBranch::new(repo.id, ref_name);
    let number = ref_name
        .strip_prefix(PULL_PREFIX)
        .and_then(|n| n.parse::<u64>().ok());
    if let Some(number) = number {
        match ctx.hosting.pull_info(repo, number).await {
            Ok(pull) => new.pull_head_name = pull.map(|p| p.head_ref),
            Err(e) => warn!(repo = %repo.name, pull = number, error = %e, "Failed to fetch pull info"),
        }
    }
    info!(repo = %repo.name, branch = ref_name, "New branch");
    ctx.store.create_branch(new).await
}

/// Create the build for a new commit on `branch`, if it has none yet.
///
/// On a branch that is not sticky, builds still waiting for admission are
/// skipped and the new build takes over the lowest of their sequences.
pub async fn on_new_commit(
    ctx: &Context,
    repo: &Repository,
    branch: &Branch,
    info: &RefInfo,
) -> Result<Option<Build>> {
    let known = ctx
        .store
        .count_builds(&BuildFilter::new().branch(branch.id).commit(&info.commit))
        .await?;
    if known > 0 {
        return Ok(None);
    }

    let mut sequence = None;
    if !branch.sticky {
        let waiting = ctx
            .store
            .search_builds(
                &BuildFilter::new()
                    .branch(branch.id)
                    .state(BuildState::Pending)
                    .order(BuildOrder::SequenceAsc),
            )
            .await?;
        sequence = waiting.first().map(|b| b.sequence);
        for build in &waiting {
            skip_if_pending(ctx, build).await?;
        }
    }

    let mut build = ctx
        .store
        .create_build(NewBuild {
            branch_id: branch.id,
            repo_id: repo.id,
            name: info.commit.clone(),
            sequence,
            state: BuildState::Pending,
            date: Some(info.date),
            author: info.author.clone(),
            author_email: info.author_email.clone(),
            committer: info.committer.clone(),
            committer_email: info.committer_email.clone(),
            subject: info.subject.clone(),
            ..NewBuild::default()
        })
        .await?;
    info!(repo = %repo.name, branch = %branch.name, build = %build.dest, "New build");

    detect_duplicate(ctx, &mut build).await?;
    Ok(Some(build))
}

/// Whether every dependency resolves to the same branch for both builds.
async fn same_dependencies(ctx: &Context, repo: &Repository, build: &Build, candidate: &Build) -> bool {
    for dependency in &repo.dependencies {
        let ours = closest_branch(ctx, build, *dependency).await;
        let theirs = closest_branch(ctx, candidate, *dependency).await;
        match (ours, theirs) {
            (Ok(ours), Ok(theirs)) if ours.name == theirs.name => {}
            (Ok(ours), Ok(theirs)) => {
                debug!(
                    build = %build.dest,
                    candidate = %candidate.dest,
                    ours = %ours.name,
                    theirs = %theirs.name,
                    "Dependency branches differ"
                );
                return false;
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!(build = %build.dest, error = %e, "Cannot resolve dependency branch");
                return false;
            }
        }
    }
    true
}

/// Turn `build` into a duplicate of an equivalent build of the repository
/// it duplicates, if there is one. Returns whether a reference was found.
pub async fn detect_duplicate(ctx: &Context, build: &mut Build) -> Result<bool> {
    let repo = ctx.store.get_repository(build.repo_id).await?;
    let Some(reference_repo) = repo.duplicate_of else {
        return Ok(false);
    };

    let candidates = ctx
        .store
        .search_builds(
            &BuildFilter::new()
                .repos([reference_repo])
                .commit(&build.name)
                .has_duplicate_link(false)
                .result_not(BuildResult::Skipped)
                .order(BuildOrder::IdAsc),
        )
        .await?;

    for candidate in candidates.iter().filter(|c| c.id != build.id) {
        if !same_dependencies(ctx, &repo, build, candidate).await {
            warn!(build = %build.dest, candidate = %candidate.dest, "Duplicate candidate rejected");
            continue;
        }
        let from = build.state;
        build.state = BuildState::Duplicate;
        build.duplicate_of = Some(candidate.id);
        ctx.save_from(build, from).await?;
        ctx.log_build(
            build.id,
            "detect_duplicate",
            &format!("Duplicate of build {}", candidate.dest),
        )
        .await;
        info!(build = %build.dest, reference = %candidate.dest, "Duplicate build");
        return Ok(true);
    }
    Ok(false)
}

async fn discover_ref(
    ctx: &Context,
    repo: &Repository,
    info: &RefInfo,
    oldest: DateTime<Utc>,
) -> Result<Option<Build>> {
    let branch = upsert_branch(ctx, repo, &info.name).await?;
    if info.date < oldest {
        debug!(branch = %branch.name, date = %info.date, "Ref too old to build");
        return Ok(None);
    }
    on_new_commit(ctx, repo, &branch, info).await
}

/// Skip a pending build unless it was admitted or killed meanwhile.
async fn skip_if_pending(ctx: &Context, build: &Build) -> Result<()> {
    match skip(ctx, build).await {
        Err(Error::Conflict(reason)) => {
            debug!(build = %build.dest, reason, "Build left the queue, not skipped");
            Ok(())
        }
        other => other.map(|_| ()),
    }
}

/// Skip pending builds that can never be admitted: everything past the
/// newest `running_max` pending builds of the repository.
pub async fn skip_overflow(ctx: &Context, repo: &Repository) -> Result<usize> {
    let overflow = ctx
        .store
        .search_builds(
            &BuildFilter::new()
                .repos([repo.id])
                .state(BuildState::Pending)
                .order(BuildOrder::SequenceDesc)
                .offset(ctx.settings.running_max),
        )
        .await?;
    for build in &overflow {
        debug!(build = %build.dest, "Skipping build beyond the queue limit");
        skip_if_pending(ctx, build).await?;
    }
    Ok(overflow.len())
}

/// Fetch `repo` and create builds for its new commits.
///
/// A failing ref is logged and does not stop the others. Returns the
/// number of builds created.
pub async fn discover_builds(ctx: &Context, repo: &Repository) -> Result<usize> {
    if ctx.vcs.fetch(repo).await? == FetchOutcome::UpToDate {
        debug!(repo = %repo.name, "Mirror up to date");
        return Ok(0);
    }

    let oldest = Utc::now() - Duration::days(ctx.settings.max_age_days);
    let mut created = 0;
    for info in ctx.vcs.list_refs(repo).await? {
        match discover_ref(ctx, repo, &info, oldest).await {
            Ok(Some(_)) => created += 1,
            Ok(None) => {}
            Err(e) => warn!(repo = %repo.name, git_ref = %info.name, error = %e, "Failed to process ref"),
        }
    }

    let skipped = skip_overflow(ctx, repo).await?;
    if created > 0 || skipped > 0 {
        info!(repo = %repo.name, created, skipped, "Discovered builds");
    }
    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{TestEnv, ref_info};
    use shipyard_core::Store;

    const SERVER: &str = "git@example.com:acme/server.git";

    #[tokio::test]
    async fn test_new_push_skips_pending_build_and_keeps_its_place() {
        let env = TestEnv::new().await;
        let repo = env.repo(SERVER).await;
        let now = Utc::now();

        env.vcs
            .set_refs(&repo, vec![ref_info("refs/heads/feature-x", "aaaaaa1", now)]);
        assert_eq!(discover_builds(&env.ctx, &repo).await.unwrap(), 1);
        env.vcs
            .set_refs(&repo, vec![ref_info("refs/heads/feature-x", "bbbbbb2", now)]);
        assert_eq!(discover_builds(&env.ctx, &repo).await.unwrap(), 1);

        let builds = env
            .store
            .search_builds(&BuildFilter::new().order(BuildOrder::IdAsc))
            .await
            .unwrap();
        assert_eq!(builds.len(), 2);
        assert_eq!(builds[0].state, BuildState::Done);
        assert_eq!(builds[0].result, Some(BuildResult::Skipped));
        assert_eq!(builds[1].state, BuildState::Pending);
        assert_eq!(builds[1].sequence, builds[0].sequence);
        assert_eq!(builds[1].subject, "commit bbbbbb2");

        // Seen commits are not built twice.
        assert_eq!(discover_builds(&env.ctx, &repo).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sticky_branch_keeps_every_pending_build() {
        let env = TestEnv::new().await;
        let repo = env.repo(SERVER).await;
        let master = env.sticky_branch(&repo, "refs/heads/master").await;
        let now = Utc::now();

        on_new_commit(&env.ctx, &repo, &master, &ref_info(&master.name, "aaaaaa1", now))
            .await
            .unwrap();
        on_new_commit(&env.ctx, &repo, &master, &ref_info(&master.name, "bbbbbb2", now))
            .await
            .unwrap();

        let pending = env
            .store
            .count_builds(&BuildFilter::new().state(BuildState::Pending))
            .await
            .unwrap();
        assert_eq!(pending, 2);
    }

    #[tokio::test]
    async fn test_old_refs_create_branches_only() {
        let env = TestEnv::new().await;
        let repo = env.repo(SERVER).await;
        env.vcs.set_refs(
            &repo,
            vec![ref_info("refs/heads/8.0", "aaaaaa1", Utc::now() - Duration::days(90))],
        );

        assert_eq!(discover_builds(&env.ctx, &repo).await.unwrap(), 0);
        assert!(env.store.find_branch(repo.id, "refs/heads/8.0").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_up_to_date_mirror_is_not_scanned() {
        let env = TestEnv::new().await;
        let repo = env.repo(SERVER).await;
        env.vcs
            .set_refs(&repo, vec![ref_info("refs/heads/master", "aaaaaa1", Utc::now())]);
        env.vcs.set_up_to_date(true);

        assert_eq!(discover_builds(&env.ctx, &repo).await.unwrap(), 0);
        assert!(env.store.find_branch(repo.id, "refs/heads/master").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pull_branch_records_head_name() {
        let env = TestEnv::new().await;
        let repo = env.repo(SERVER).await;
        env.hosting.add_pull(&repo, 7, "fix-login", "master", "open");

        let branch = upsert_branch(&env.ctx, &repo, "refs/pull/7").await.unwrap();
        assert_eq!(branch.pull_head_name.as_deref(), Some("fix-login"));
        let again = upsert_branch(&env.ctx, &repo, "refs/pull/7").await.unwrap();
        assert_eq!(again.id, branch.id);
    }

    #[tokio::test]
    async fn test_queue_overflow_is_skipped() {
        let env = TestEnv::with_settings(|s| s.running_max = 2).await;
        let repo = env.repo(SERVER).await;
        let now = Utc::now();
        env.vcs.set_refs(
            &repo,
            vec![
                ref_info("refs/heads/a", "aaaaaa1", now),
                ref_info("refs/heads/b", "bbbbbb2", now),
                ref_info("refs/heads/c", "cccccc3", now),
            ],
        );

        discover_builds(&env.ctx, &repo).await.unwrap();

        let builds = env
            .store
            .search_builds(&BuildFilter::new().order(BuildOrder::SequenceAsc))
            .await
            .unwrap();
        assert_eq!(builds.len(), 3);
        assert_eq!(builds[0].result, Some(BuildResult::Skipped));
        assert_eq!(builds[1].state, BuildState::Pending);
        assert_eq!(builds[2].state, BuildState::Pending);
    }

    #[tokio::test]
    async fn test_commit_in_duplicated_repository_becomes_duplicate() {
        let env = TestEnv::new().await;
        let (r1, r1_master) = env.repo_with_branch(SERVER, "refs/heads/master").await;
        let mut r2 = env.repo("git@example.com:acme/server-dev.git").await;
        r2.duplicate_of = Some(r1.id);
        env.store.update_repository(&r2).await.unwrap();
        let reference = env.build(&r1, &r1_master, "aaaaaa1").await;

        env.vcs
            .set_refs(&r2, vec![ref_info("refs/heads/master", "aaaaaa1", Utc::now())]);
        discover_builds(&env.ctx, &r2).await.unwrap();

        let created = env
            .store
            .search_builds(&BuildFilter::new().repos([r2.id]))
            .await
            .unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].state, BuildState::Duplicate);
        assert_eq!(created[0].duplicate_of, Some(reference.id));
    }

    #[tokio::test]
    async fn test_duplicate_rejected_when_dependencies_differ() {
        let env = TestEnv::new().await;
        let server = env.repo(SERVER).await;
        for name in ["refs/heads/11.0", "refs/heads/12.0"] {
            env.branch(&server, name).await;
            env.vcs.on_remote(&server, name);
        }

        let (mut r1, r1_branch) = env
            .repo_with_branch("git@example.com:acme/addons.git", "refs/heads/11.0")
            .await;
        r1.dependencies = vec![server.id];
        env.store.update_repository(&r1).await.unwrap();
        let mut r2 = env.repo("git@example.com:acme/addons-dev.git").await;
        r2.duplicate_of = Some(r1.id);
        r2.dependencies = vec![server.id];
        env.store.update_repository(&r2).await.unwrap();
        env.build(&r1, &r1_branch, "aaaaaa1").await;

        let same = env.branch(&r2, "refs/heads/11.0").await;
        let other = env.branch(&r2, "refs/heads/12.0").await;
        let info = ref_info(&other.name, "aaaaaa1", Utc::now());

        let rejected = on_new_commit(&env.ctx, &r2, &other, &info).await.unwrap().unwrap();
        assert_eq!(rejected.state, BuildState::Pending);
        assert_eq!(rejected.duplicate_of, None);

        let accepted = on_new_commit(&env.ctx, &r2, &same, &info).await.unwrap().unwrap();
        assert_eq!(accepted.state, BuildState::Duplicate);
    }
}
