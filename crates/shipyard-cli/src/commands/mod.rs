//! CLI command implementations.

pub mod builds;

use anyhow::{Context as _, Result};
use shipyard_api::bootstrap;
use shipyard_config::{Config, parse_config};
use shipyard_scheduler::Scheduler;
use std::path::Path;
use tracing::error;

pub fn validate(path: &Path) -> Result<()> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    match parse_config(&content) {
        Ok(config) => {
            println!("Configuration is valid");
            print!("{}", describe(&config));
            Ok(())
        }
        Err(e) => {
            println!("Configuration error: {}", e);
            std::process::exit(1);
        }
    }
}

/// One line for the host plus one per repository.
fn describe(config: &Config) -> String {
    let settings = &config.settings;
    let mut out = format!(
        "host {}: {} workers, {} running, root {}\n",
        settings.host,
        settings.workers,
        settings.running_max,
        settings.root.display()
    );
    for repo in &config.repos {
        out.push_str(&format!("  {} ({})", repo.name, repo.mode));
        if !repo.sticky.is_empty() {
            out.push_str(&format!(" sticky: {}", repo.sticky.join(", ")));
        }
        out.push('\n');
    }
    out
}

/// Run one scheduler pass and print what it did.
pub async fn tick(config: &Config) -> Result<()> {
    let ctx = bootstrap::connect(config).await?;
    let report = Scheduler::new(ctx).tick().await?;
    println!(
        "discovered {}, advanced {}, admitted {}, retired {}, reaped {}",
        report.discovered, report.advanced, report.admitted, report.retired, report.reaped
    );
    Ok(())
}

/// Run the scheduler loop until Ctrl-C.
pub async fn run(config: &Config) -> Result<()> {
    let ctx = bootstrap::connect(config).await?;
    Scheduler::new(ctx)
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
        })
        .await;
    Ok(())
}
