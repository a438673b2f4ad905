//! API routes.

pub mod builds;
pub mod health;
pub mod hooks;

use crate::AppState;
use axum::Router;

/// Build the main API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(hooks::router())
        .nest("/builds", builds::router())
        .merge(health::router())
        .with_state(state)
}
