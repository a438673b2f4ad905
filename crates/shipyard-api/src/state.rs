//! Application state.

use shipyard_config::Config;
use shipyard_core::Secret;
use shipyard_scheduler::Context;
use std::collections::HashMap;
use std::sync::Arc;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub ctx: Context,
    /// Webhook signing secrets by repository name.
    pub webhook_secrets: Arc<HashMap<String, Secret>>,
}

impl AppState {
    pub fn new(ctx: Context, webhook_secrets: HashMap<String, Secret>) -> Self {
        Self {
            ctx,
            webhook_secrets: Arc::new(webhook_secrets),
        }
    }

    /// State with the webhook secrets of every repository that declares one.
    pub fn from_config(ctx: Context, config: &Config) -> Self {
        let secrets = config
            .repos
            .iter()
            .filter_map(|r| r.webhook_secret().map(|s| (r.name.clone(), s)))
            .collect();
        Self::new(ctx, secrets)
    }
}
