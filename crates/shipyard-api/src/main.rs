//! shipyard API server.
//!
//! Runs the scheduler loop and serves the hook and build endpoints.

use anyhow::Context as _;
use clap::Parser;
use shipyard_api::{AppState, bootstrap, routes};
use shipyard_config::load_config;
use shipyard_scheduler::Scheduler;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "shipyard-server")]
#[command(about = "shipyard build orchestrator server", long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(long, env = "SHIPYARD_CONFIG", default_value = "shipyard.kdl")]
    config: PathBuf,

    /// Overrides the configured database URL
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = load_config(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;
    if let Some(url) = args.database_url {
        config.settings.database_url = Some(url);
    }

    let ctx = bootstrap::connect(&config).await?;
    let state = AppState::from_config(ctx.clone(), &config);

    // Scheduler loop, stopped together with the server
    let (stop_tx, mut stop_rx) = watch::channel(false);
    let scheduler = Scheduler::new(ctx);
    let scheduler_task = tokio::spawn(async move {
        scheduler
            .run(async move {
                let _ = stop_rx.changed().await;
            })
            .await;
    });

    let app = routes::router(state).layer(TraceLayer::new_for_http());

    let listen = config.settings.listen.clone();
    info!("Starting server on {}", listen);
    let listener = TcpListener::bind(&listen)
        .await
        .with_context(|| format!("Failed to bind {}", listen))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Shutting down");
        })
        .await?;

    let _ = stop_tx.send(true);
    if let Err(e) = scheduler_task.await {
        error!(error = %e, "Scheduler task failed");
    }
    Ok(())
}
