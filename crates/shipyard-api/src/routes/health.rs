//! Health check endpoints.

use axum::Router;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, http::StatusCode};
use serde_json::{Value, json};

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/health/ready", get(ready))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Ready once the store answers.
async fn ready(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    match state.ctx.store.list_repositories().await {
        Ok(repos) => (
            StatusCode::OK,
            Json(json!({ "status": "ready", "repositories": repos.len() })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "unavailable", "error": e.to_string() })),
        ),
    }
}
