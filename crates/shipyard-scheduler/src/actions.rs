//! Administrative operations on builds: skip, force and kill requests.

use shipyard_core::{
    Build, BuildFilter, BuildOrder, BuildResult, BuildState, Error, NewBuild, Result,
};
use tracing::{debug, info};

use crate::Context;
use crate::catalog::detect_duplicate;

/// Mark a build `done/skipped` without running it.
///
/// Builds that were waiting on it as duplicates are rebuilt on their own.
/// Fails with [`Error::Conflict`] when the build changed state meanwhile.
pub async fn skip(ctx: &Context, build: &Build) -> Result<Build> {
    if build.state == BuildState::Done && build.result == Some(BuildResult::Skipped) {
        return Ok(build.clone());
    }

    let mut skipped = build.clone();
    skipped.state = BuildState::Done;
    skipped.result = Some(BuildResult::Skipped);
    skipped.job = None;
    ctx.save_from(&skipped, build.state).await?;
    info!(build = %skipped.dest, "Skipped build");

    let waiting = ctx
        .store
        .search_builds(
            &BuildFilter::new()
                .duplicate_of(skipped.id)
                .state(BuildState::Duplicate),
        )
        .await?;
    for duplicate in waiting {
        ctx.log_build(
            duplicate.id,
            "skip",
            &format!("Reference build {} was skipped, rebuilding", skipped.dest),
        )
        .await;
        force(ctx, &duplicate).await?;
    }
    Ok(skipped)
}

/// Sequence for a forced build: the head of the pending queue, or after
/// every existing build when nothing is pending.
async fn force_sequence(ctx: &Context) -> Result<i64> {
    let head = ctx
        .store
        .search_builds(
            &BuildFilter::new()
                .state(BuildState::Pending)
                .order(BuildOrder::SequenceAsc)
                .limit(1),
        )
        .await?;
    if let Some(head) = head.first() {
        return Ok(head.sequence);
    }
    let last = ctx
        .store
        .search_builds(&BuildFilter::new().order(BuildOrder::SequenceDesc).limit(1))
        .await?;
    Ok(last.first().map(|b| b.sequence + 1).unwrap_or(1))
}

/// Rebuild a build at the head of the queue.
///
/// A skipped build is put back to pending; a started or finished build is
/// copied into a new pending build. Pending and testing builds are left
/// alone and `None` is returned.
pub async fn force(ctx: &Context, build: &Build) -> Result<Option<Build>> {
    match build.state {
        BuildState::Pending | BuildState::Testing => return Ok(None),
        BuildState::Done if build.result == Some(BuildResult::Skipped) => {
            let mut requeued = build.clone();
            requeued.state = BuildState::Pending;
            requeued.result = None;
            requeued.sequence = force_sequence(ctx).await?;
            ctx.save_from(&requeued, build.state).await?;
            ctx.log_build(requeued.id, "force", "Build requeued").await;
            info!(build = %requeued.dest, sequence = requeued.sequence, "Requeued skipped build");
            Ok(Some(requeued))
        }
        _ => {
            let mut copy = NewBuild::copy_of(build);
            copy.sequence = Some(force_sequence(ctx).await?);
            let mut rebuilt = ctx.store.create_build(copy).await?;
            ctx.log_build(rebuilt.id, "force", &format!("Rebuild of {}", build.dest))
                .await;
            info!(build = %rebuilt.dest, from = %build.dest, "Forced rebuild");
            detect_duplicate(ctx, &mut rebuilt).await?;
            Ok(Some(rebuilt))
        }
    }
}

/// Attempts at applying a kill request before giving up on a build that
/// keeps changing under us.
const KILL_ATTEMPTS: usize = 3;

/// Request the termination of a build.
///
/// A pending build is skipped right away; a testing or running build is
/// sent to deathrow and killed by its owner on the next tick. Requests on a
/// duplicate of a sticky branch's build target that build.
///
/// The request is applied to the stored build, so a scheduler pass moving
/// it forward at the same time cannot undo it.
pub async fn ask_kill(ctx: &Context, build: &Build, requested_by: &str) -> Result<Build> {
    let mut target_id = build.id;
    if let Some(reference) = build.duplicate_of {
        let referenced = ctx.store.get_build(reference).await?;
        if ctx.store.get_branch(referenced.branch_id).await?.sticky {
            target_id = referenced.id;
        }
    }

    for _ in 0..KILL_ATTEMPTS {
        let target = ctx.store.get_build(target_id).await?;
        match apply_kill(ctx, &target, requested_by).await {
            Err(Error::Conflict(reason)) => {
                debug!(build = %target.dest, reason, "Build changed while killing, retrying");
            }
            applied => return applied,
        }
    }
    Err(Error::Conflict(format!(
        "build {} keeps changing, kill not applied",
        target_id
    )))
}

async fn apply_kill(ctx: &Context, target: &Build, requested_by: &str) -> Result<Build> {
    match target.state {
        BuildState::Pending => {
            let skipped = skip(ctx, target).await?;
            ctx.log_build(
                skipped.id,
                "ask_kill",
                &format!("Skipping build {}, requested by {}", skipped.dest, requested_by),
            )
            .await;
            Ok(skipped)
        }
        BuildState::Testing | BuildState::Running => {
            let mut doomed = target.clone();
            doomed.state = BuildState::Deathrow;
            doomed.job = None;
            ctx.save_from(&doomed, target.state).await?;
            ctx.log_build(
                doomed.id,
                "ask_kill",
                &format!("Killing build {}, requested by {}", doomed.dest, requested_by),
            )
            .await;
            Ok(doomed)
        }
        _ => Ok(target.clone()),
    }
}
