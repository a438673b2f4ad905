//! Moving builds through the job pipeline.
//!
//! Every write here is conditional on the state the tick last read, so an
//! operator's kill or skip landing mid-tick is reloaded instead of undone.

use chrono::Utc;
use shipyard_core::{Build, BuildResult, BuildState, Error, Result};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::Context;
use crate::jobs::run_job;
use crate::pipeline::{Job, JobOutcome, PIPELINE};
use crate::ports::find_port;
use crate::status;
use crate::workspace::local_cleanup;

/// Times a build changed under the tick is reloaded before giving up.
const RELOADS: usize = 3;

/// Pid recorded in the lock of whichever job of `build` is still alive.
fn lock_holder(ctx: &Context, build: &Build) -> Result<Option<i32>> {
    let dir = ctx.build_dir(build);
    for descriptor in &PIPELINE {
        if let Some(pid) = ctx.supervisor.lock_holder(&dir.lock_path(descriptor.job))? {
            return Ok(Some(pid));
        }
    }
    Ok(None)
}

/// Stop a build owned by this host: kill its process group, mark it done,
/// report its status and reclaim its artifacts.
///
/// Builds of other hosts and finished builds are returned untouched. When
/// the stored build moved on meanwhile, the kill applies to the stored one.
pub async fn kill(ctx: &Context, build: &Build, result: Option<BuildResult>) -> Result<Build> {
    let mut current = build.clone();
    for _ in 0..RELOADS {
        if !current.is_owned_by(&ctx.settings.host) || current.state.is_terminal() {
            return Ok(current);
        }
        match terminate(ctx, &current, result).await {
            Err(Error::Conflict(reason)) => {
                debug!(build = %current.dest, reason, "Build changed before kill, reloading");
                current = ctx.store.get_build(current.id).await?;
            }
            other => return other,
        }
    }
    Err(Error::Conflict(format!(
        "build {} keeps changing, kill not applied",
        current.dest
    )))
}

async fn terminate(ctx: &Context, build: &Build, result: Option<BuildResult>) -> Result<Build> {
    ctx.log_build(build.id, "kill", &format!("Kill build {}", build.dest))
        .await;
    let pid = match build.pid {
        Some(pid) => Some(pid),
        None => lock_holder(ctx, build)?,
    };
    if let Some(pid) = pid {
        debug!(build = %build.dest, pid, "Killing process group");
        if let Err(e) = ctx.supervisor.kill_group(pid) {
            warn!(build = %build.dest, pid, error = %e, "Failed to kill process group");
        }
    }

    let mut killed = build.clone();
    killed.state = BuildState::Done;
    killed.job = None;
    if result.is_some() {
        killed.result = result;
    }
    ctx.save_from(&killed, build.state).await?;
    info!(build = %killed.dest, result = ?killed.result, "Killed build");

    status::report(ctx, &killed).await;
    local_cleanup(ctx, &killed).await;
    Ok(killed)
}

/// Time budget of the current job of `build`.
async fn job_timeout(ctx: &Context, build: &Build) -> Result<Duration> {
    let branch = ctx.store.get_branch(build.branch_id).await?;
    let timeout = branch.job_timeout().unwrap_or(ctx.settings.timeout);
    Ok(if branch.coverage {
        timeout.mul_f64(1.5)
    } else {
        timeout
    })
}

/// Admit a pending build: take a port, claim it for this host and queue
/// the first job.
async fn admit(ctx: &Context, build: &mut Build) -> Result<Job> {
    let first = Job::first();
    build.port = Some(find_port(ctx).await?);
    build.host = Some(ctx.settings.host.clone());
    build.state = BuildState::Testing;
    build.job = Some(first.name().to_string());
    build.job_start = Some(Utc::now());
    build.job_end = None;
    build.pid = None;
    ctx.save_from(build, BuildState::Pending).await?;
    info!(build = %build.dest, port = ?build.port, "Admitted build");
    Ok(first)
}

/// Advance `build` as far as it can go without waiting.
///
/// A pending build is admitted; an active build whose job released its
/// lock moves to the next job; a job that leaves no process to wait for is
/// followed by the next one right away. A job running past its budget is
/// killed, as are builds on deathrow and builds whose job fails to start.
///
/// `build` may be stale: when the stored state changed since it was read,
/// the stored build is advanced instead.
pub async fn advance(ctx: &Context, build: &Build) -> Result<Build> {
    let mut build = build.clone();
    for _ in 0..RELOADS {
        match drive(ctx, &mut build).await {
            Err(Error::Conflict(reason)) => {
                debug!(build = %build.dest, reason, "Build changed during tick, reloading");
                build = ctx.store.get_build(build.id).await?;
            }
            other => return other,
        }
    }
    Err(Error::Conflict(format!("build {} keeps changing", build.dest)))
}

async fn drive(ctx: &Context, build: &mut Build) -> Result<Build> {
    loop {
        let job = match build.state {
            BuildState::Deathrow => {
                return kill(ctx, build, Some(BuildResult::ManuallyKilled)).await;
            }
            BuildState::Done | BuildState::Duplicate => return Ok(build.clone()),
            BuildState::Pending => admit(ctx, build).await?,
            BuildState::Testing | BuildState::Running => {
                let Some(current) = build.job.as_deref().and_then(Job::from_name) else {
                    error!(build = %build.dest, job = ?build.job, "Unknown job");
                    return kill(ctx, build, Some(BuildResult::Ko)).await;
                };

                let lock = ctx.build_dir(build).lock_path(current);
                if ctx.supervisor.is_locked(&lock)? {
                    if build.pid.is_none() {
                        if let Some(pid) = ctx.supervisor.lock_holder(&lock)? {
                            build.pid = Some(pid);
                            ctx.save_from(build, build.state).await?;
                            info!(
                                build = %build.dest,
                                job = %current,
                                pid,
                                "Recovered job pid from its lock"
                            );
                        }
                    }
                    let now = Utc::now();
                    if !current.is_last() {
                        let budget = job_timeout(ctx, build).await?;
                        if build.job_time(now).is_some_and(|elapsed| elapsed > budget) {
                            info!(build = %build.dest, job = %current, "Job time exceeded");
                            build.job_end = Some(now);
                            ctx.save_from(build, build.state).await?;
                            return kill(ctx, build, Some(BuildResult::Killed)).await;
                        }
                    }
                    return Ok(build.clone());
                }

                debug!(build = %build.dest, job = %current, "Job finished");
                let from = build.state;
                let next = if current.is_last_test() {
                    build.state = BuildState::Running;
                    build.job_end = Some(Utc::now());
                    Some(Job::last())
                } else if current.is_last() {
                    build.state = BuildState::Done;
                    None
                } else {
                    current.next()
                };
                build.job = next.map(|job| job.name().to_string());
                build.pid = None;
                ctx.save_from(build, from).await?;

                match next {
                    Some(job) => job,
                    None => {
                        info!(build = %build.dest, result = ?build.result, "Build done");
                        local_cleanup(ctx, build).await;
                        return Ok(build.clone());
                    }
                }
            }
        };

        // The job is committed before it starts; its process records its
        // own pid in the job lock.
        match run_job(ctx, build, job).await {
            Ok(JobOutcome::Spawned(pid)) => {
                build.pid = Some(pid);
                ctx.save_from(build, build.state).await?;
                return Ok(build.clone());
            }
            Ok(JobOutcome::NoProcess) => continue,
            Err(e) => {
                // A job saving over a build that moved on is not a job failure.
                if matches!(e, Error::Conflict(_))
                    && ctx.store.get_build(build.id).await?.state != build.state
                {
                    return Err(e);
                }
                error!(build = %build.dest, job = %job, error = %e, "Job failed to start");
                ctx.log_build(build.id, job.name(), &format!("Failed running job: {}", e))
                    .await;
                return kill(ctx, build, Some(BuildResult::Ko)).await;
            }
        }
    }
}
