//! Push notifications from the code-hosting service.
//!
//! A hook only records when the repository was last notified; the next
//! scheduler tick fetches hook-mode repositories whose mirror is older.

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use shipyard_core::{RepoId, Secret};
use tracing::{info, warn};

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new().route("/hook/{repo_id}", post(hook))
}

async fn hook(
    State(state): State<AppState>,
    Path(repo_id): Path<i64>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let repo = state.ctx.store.get_repository(RepoId::new(repo_id)).await?;

    if let Some(secret) = state.webhook_secrets.get(&repo.name) {
        check_signature(secret, &body, &headers)
            .inspect_err(|e| warn!(repo = %repo.name, error = ?e, "Rejected hook"))?;
    }

    state.ctx.store.set_hook_time(repo.id, Utc::now()).await?;
    info!(repo = %repo.name, "Received hook");
    Ok(StatusCode::OK)
}

const SIGNATURE_HEADER: &str = "X-Hub-Signature-256";

/// Authenticate a hook body against the repository's secret, using the
/// `sha256=<hex>` HMAC the hosting service sends along.
fn check_signature(secret: &Secret, body: &[u8], headers: &HeaderMap) -> Result<(), ApiError> {
    let header = headers
        .get(SIGNATURE_HEADER)
        .ok_or_else(|| ApiError::Unauthorized(format!("Missing {} header", SIGNATURE_HEADER)))?;
    let digest = header
        .to_str()
        .ok()
        .and_then(|value| value.strip_prefix("sha256="))
        .and_then(|hex_digest| hex::decode(hex_digest).ok())
        .ok_or_else(|| {
            ApiError::Unauthorized("Malformed signature, expected sha256=<hex>".to_string())
        })?;

    let mut mac = Hmac::<Sha256>::new_from_slice(secret.expose().as_bytes())
        .map_err(|e| ApiError::Internal(format!("Unusable hook secret: {}", e)))?;
    mac.update(body);
    mac.verify_slice(&digest)
        .map_err(|_| ApiError::Unauthorized("Signature does not match the body".to_string()))
}
