//! Wiring of the production collaborators from a loaded configuration.

use anyhow::{Context as _, Result};
use shipyard_config::Config;
use shipyard_db::{PgDatabaseAdmin, PgStore, create_pool, run_migrations};
use shipyard_executor::LocalSupervisor;
use shipyard_git::{GitHubClient, GitMirror};
use shipyard_scheduler::{Context, FileProxy, sync_repositories};
use std::sync::Arc;
use tracing::info;

/// Connect to the store, apply migrations, synchronise the declared
/// repositories and build the scheduling context.
pub async fn connect(config: &Config) -> Result<Context> {
    let settings = Arc::new(config.settings.clone());
    let database_url = settings
        .database_url
        .as_deref()
        .context("database-url is not configured")?;

    info!("Connecting to database...");
    let pool = create_pool(database_url)
        .await
        .context("Failed to connect to the database")?;
    run_migrations(&pool)
        .await
        .context("Failed to run migrations")?;
    info!("Database connected");

    let admin_pool = match settings.admin_database_url.as_deref() {
        Some(url) => create_pool(url)
            .await
            .context("Failed to connect to the admin database")?,
        None => pool.clone(),
    };

    let store = Arc::new(PgStore::new(pool));
    let repos = sync_repositories(store.as_ref(), config)
        .await
        .context("Failed to synchronise repositories")?;
    info!(count = repos.len(), "Repositories synchronised");

    let mut ctx = Context::new(
        settings.clone(),
        store,
        Arc::new(GitMirror::new(settings.repo_root())),
        Arc::new(GitHubClient::new(config.tokens()).context("Failed to create GitHub client")?),
        Arc::new(LocalSupervisor::new()),
        Arc::new(PgDatabaseAdmin::new(admin_pool)),
    );
    if let Some(routes) = &settings.proxy_config {
        ctx = ctx.with_proxy(Arc::new(FileProxy::new(
            routes.clone(),
            settings.proxy_pid.clone(),
        )));
    }
    Ok(ctx)
}
