//! shipyard CLI tool.

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use shipyard_config::{Config, load_config};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "shipyard")]
#[command(about = "shipyard build orchestrator CLI", long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(long, env = "SHIPYARD_CONFIG", default_value = "shipyard.kdl")]
    config: PathBuf,

    /// Overrides the configured database URL
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the configuration file
    Validate,
    /// Run a single scheduler pass
    Tick,
    /// Run the scheduler loop until interrupted
    Run,
    /// Skip a pending build or kill a testing/running one
    Kill {
        /// Build ID
        id: i64,
    },
    /// Requeue a build
    Rebuild {
        /// Build ID
        id: i64,
    },
    /// Manage builds
    Builds {
        #[command(subcommand)]
        command: BuildCommands,
    },
}

#[derive(Subcommand)]
enum BuildCommands {
    /// List recent builds
    List {
        /// Repository name
        #[arg(long)]
        repo: Option<String>,
        /// Build state
        #[arg(long)]
        state: Option<String>,
        /// Maximum number of builds to show
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Show a build and its log
    Show {
        /// Build ID
        id: i64,
    },
}

fn load(path: &Path, database_url: Option<&str>) -> anyhow::Result<Config> {
    let mut config =
        load_config(path).with_context(|| format!("Failed to load {}", path.display()))?;
    if let Some(url) = database_url {
        config.settings.database_url = Some(url.to_string());
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config = || load(&cli.config, cli.database_url.as_deref());
    match cli.command {
        Commands::Validate => commands::validate(&cli.config)?,
        Commands::Tick => commands::tick(&config()?).await?,
        Commands::Run => commands::run(&config()?).await?,
        Commands::Kill { id } => commands::builds::kill(&config()?, id).await?,
        Commands::Rebuild { id } => commands::builds::rebuild(&config()?, id).await?,
        Commands::Builds { command } => match command {
            BuildCommands::List { repo, state, limit } => {
                commands::builds::list(&config()?, repo, state, limit).await?;
            }
            BuildCommands::Show { id } => {
                commands::builds::show(&config()?, id).await?;
            }
        },
    }

    Ok(())
}
