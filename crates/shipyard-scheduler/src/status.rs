//! Commit statuses reported to the hosting service.

use chrono::{DateTime, Utc};
use shipyard_config::Settings;
use shipyard_core::{Build, BuildResult, BuildState, CommitStatus, StatusState};
use tracing::{debug, warn};

use crate::Context;

/// Status describing `build`, or `None` for states that are not reported.
pub fn commit_status(settings: &Settings, build: &Build, now: DateTime<Utc>) -> Option<CommitStatus> {
    let mut description = format!("shipyard build {}", build.dest);
    let state = match build.state {
        BuildState::Testing => StatusState::Pending,
        BuildState::Running | BuildState::Done => {
            let runtime = build.job_time(now).map(|d| d.as_secs()).unwrap_or(0);
            description.push_str(&format!(" (runtime {}s)", runtime));
            match build.result {
                Some(BuildResult::Ok) => StatusState::Success,
                Some(BuildResult::Ko) => StatusState::Failure,
                _ => StatusState::Error,
            }
        }
        _ => return None,
    };

    Some(CommitStatus {
        state,
        target_url: format!("http://{}/build/{}", settings.domain, build.id),
        description,
        context: settings.status_context.clone(),
    })
}

/// Post the status of `build` on its commit. Failures are only logged.
pub async fn report(ctx: &Context, build: &Build) {
    let Some(status) = commit_status(&ctx.settings, build, Utc::now()) else {
        return;
    };
    let repo = match ctx.store.get_repository(build.repo_id).await {
        Ok(repo) => repo,
        Err(e) => {
            warn!(build = %build.dest, error = %e, "Cannot report status");
            return;
        }
    };
    debug!(build = %build.dest, state = ?status.state, "Reporting commit status");
    if let Err(e) = ctx.hosting.post_status(&repo, &build.name, &status).await {
        warn!(build = %build.dest, error = %e, "Failed to post commit status");
    }
}
