//! KDL configuration parsing for the shipyard build orchestrator.
//!
//! One document holds the orchestrator settings (`shipyard { ... }`) and
//! the tracked repositories (`repo "<url>" { ... }`).

pub mod error;
mod nodes;
pub mod repos;
pub mod system;

pub use error::{ConfigError, ConfigResult};
pub use repos::RepoDecl;
pub use system::{Settings, hostname};

use kdl::KdlDocument;
use serde::{Deserialize, Serialize};
use shipyard_core::Secret;
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// A parsed configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub settings: Settings,
    pub repos: Vec<RepoDecl>,
}

impl Config {
    pub fn repo(&self, name: &str) -> Option<&RepoDecl> {
        self.repos.iter().find(|r| r.name == name)
    }

    /// Hosting API tokens of the repositories that declare one and have it set.
    pub fn tokens(&self) -> HashMap<String, Secret> {
        self.repos
            .iter()
            .filter_map(|r| r.token().map(|t| (r.name.clone(), t)))
            .collect()
    }
}

/// Parse a configuration from KDL text.
pub fn parse_config(kdl: &str) -> ConfigResult<Config> {
    let doc: KdlDocument = kdl.parse()?;

    let mut settings = Settings::default();
    let mut repos = Vec::new();

    for node in doc.nodes() {
        match node.name().value() {
            "shipyard" => system::parse_settings(node, &mut settings)?,
            "repo" => {
                let sequence = repos.len() as i32 + 1;
                repos.push(repos::parse_repo(node, sequence)?);
            }
            _ => {} // Ignore unknown nodes
        }
    }

    validate_repos(&repos)?;

    Ok(Config { settings, repos })
}

/// Read and parse a configuration file.
pub fn load_config(path: impl AsRef<Path>) -> ConfigResult<Config> {
    let content = std::fs::read_to_string(path)?;
    parse_config(&content)
}

fn validate_repos(repos: &[RepoDecl]) -> ConfigResult<()> {
    let mut names = HashSet::new();
    for repo in repos {
        if !names.insert(repo.name.as_str()) {
            return Err(ConfigError::Duplicate(format!("repo '{}'", repo.name)));
        }
    }

    for repo in repos {
        let references = repo.duplicate_of.iter().chain(repo.dependencies.iter());
        for reference in references {
            if !names.contains(reference.as_str()) {
                return Err(ConfigError::InvalidReference(format!(
                    "repo '{}' refers to unknown repo '{}'",
                    repo.name, reference
                )));
            }
        }
    }
    Ok(())
}
