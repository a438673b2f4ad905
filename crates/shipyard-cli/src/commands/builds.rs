//! Build commands.

use anyhow::{Context as _, Result, anyhow};
use chrono::Utc;
use shipyard_api::bootstrap;
use shipyard_config::Config;
use shipyard_core::{Build, BuildFilter, BuildId, BuildState};
use shipyard_core::build::human_duration;
use shipyard_scheduler::{ask_kill, force};

fn row(build: &Build) -> String {
    let result = build.result.map(|r| r.as_str()).unwrap_or("-");
    format!(
        "{:>6}  {:<10} {:<16} {:<8} {}",
        build.id.get(),
        build.state.as_str(),
        result,
        build.job.as_deref().unwrap_or("-"),
        build.dest
    )
}

pub async fn list(
    config: &Config,
    repo: Option<String>,
    state: Option<String>,
    limit: usize,
) -> Result<()> {
    let ctx = bootstrap::connect(config).await?;
    let mut filter = BuildFilter::new().limit(limit);
    if let Some(name) = repo {
        let repo = ctx
            .store
            .find_repository(&name)
            .await?
            .ok_or_else(|| anyhow!("Unknown repository {}", name))?;
        filter = filter.repos([repo.id]);
    }
    if let Some(state) = state {
        let state: BuildState = state.parse().map_err(|e: String| anyhow!(e))?;
        filter = filter.state(state);
    }

    let builds = ctx.store.search_builds(&filter).await?;
    if builds.is_empty() {
        println!("No builds");
        return Ok(());
    }
    for build in &builds {
        println!("{}", row(build));
    }
    Ok(())
}

pub async fn show(config: &Config, id: i64) -> Result<()> {
    let ctx = bootstrap::connect(config).await?;
    let build = ctx
        .store
        .get_build(BuildId::new(id))
        .await
        .with_context(|| format!("Failed to load build {}", id))?;

    println!("{}", serde_json::to_string_pretty(&build)?);
    if let Some(elapsed) = build.job_time(Utc::now()) {
        println!("job time: {}", human_duration(elapsed));
    }
    for entry in ctx.store.build_logs(build.id).await? {
        println!("{} {}: {}", entry.created_at, entry.func, entry.message);
    }
    Ok(())
}

pub async fn kill(config: &Config, id: i64) -> Result<()> {
    let ctx = bootstrap::connect(config).await?;
    let build = ctx.store.get_build(BuildId::new(id)).await?;
    let build = ask_kill(&ctx, &build, "cli").await?;
    println!("{}", row(&build));
    Ok(())
}

pub async fn rebuild(config: &Config, id: i64) -> Result<()> {
    let ctx = bootstrap::connect(config).await?;
    let build = ctx.store.get_build(BuildId::new(id)).await?;
    match force(&ctx, &build).await? {
        Some(queued) => println!("{}", row(&queued)),
        None => println!("Build {} is already {}", build.id, build.state),
    }
    Ok(())
}
