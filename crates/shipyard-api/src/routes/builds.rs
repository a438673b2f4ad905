//! Build inspection and administrative actions.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use shipyard_core::build::human_duration;
use shipyard_core::{Build, BuildFilter, BuildId, BuildLogEntry, BuildResult, BuildState};
use shipyard_scheduler::{ask_kill, force};
use tracing::info;

use crate::AppState;
use crate::error::ApiError;

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 500;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_builds))
        .route("/{id}", get(get_build))
        .route("/{id}/kill", post(kill_build))
        .route("/{id}/rebuild", post(rebuild))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    /// Repository name.
    pub repo: Option<String>,
    pub state: Option<String>,
    pub limit: Option<usize>,
}

/// A build with its derived fields and operator log.
#[derive(Debug, Serialize)]
pub struct BuildDetail {
    #[serde(flatten)]
    pub build: Build,
    /// Own result, or the reference build's result for duplicates.
    pub effective_result: Option<BuildResult>,
    pub job_time: Option<String>,
    pub job_age: Option<String>,
    pub domain: String,
    pub logs: Vec<BuildLogEntry>,
}

/// List builds, newest first.
async fn list_builds(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Build>>, ApiError> {
    let store = &state.ctx.store;
    let mut filter =
        BuildFilter::new().limit(query.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT));

    if let Some(name) = &query.repo {
        let repo = store
            .find_repository(name)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("repository {}", name)))?;
        filter = filter.repos([repo.id]);
    }
    if let Some(raw) = &query.state {
        let build_state: BuildState = raw.parse().map_err(ApiError::BadRequest)?;
        filter = filter.state(build_state);
    }

    Ok(Json(store.search_builds(&filter).await?))
}

async fn get_build(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<BuildDetail>, ApiError> {
    let store = &state.ctx.store;
    let build = store.get_build(BuildId::new(id)).await?;
    let repo = store.get_repository(build.repo_id).await?;

    let effective_result = match build.duplicate_of {
        Some(reference) => store.get_build(reference).await?.result,
        None => build.result,
    };
    let now = Utc::now();

    Ok(Json(BuildDetail {
        effective_result,
        job_time: build.job_time(now).map(human_duration),
        job_age: build.job_age(now).map(human_duration),
        domain: build.domain(repo.nginx, &state.ctx.settings.domain),
        logs: store.build_logs(build.id).await?,
        build,
    }))
}

/// Ask for a build to be skipped or killed.
async fn kill_build(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Build>, ApiError> {
    let build = state.ctx.store.get_build(BuildId::new(id)).await?;
    let build = ask_kill(&state.ctx, &build, "api").await?;
    info!(build = %build.dest, state = %build.state, "Kill requested");
    Ok(Json(build))
}

/// Requeue a build, or queue a fresh copy of it.
async fn rebuild(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<(StatusCode, Json<Build>), ApiError> {
    let build = state.ctx.store.get_build(BuildId::new(id)).await?;
    match force(&state.ctx, &build).await? {
        Some(queued) => {
            info!(build = %build.dest, queued = %queued.dest, "Rebuild requested");
            Ok((StatusCode::ACCEPTED, Json(queued)))
        }
        None => Err(ApiError::Conflict(format!(
            "build {} is already {}",
            build.id, build.state
        ))),
    }
}
