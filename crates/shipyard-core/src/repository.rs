//! Tracked repositories.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::RepoId;

/// How a repository discovers new commits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepoMode {
    /// Never fetched, never scheduled.
    Disabled,
    /// Fetched on every scheduler tick.
    #[default]
    Poll,
    /// Fetched only after a webhook notification newer than the last fetch.
    Hook,
}

impl std::fmt::Display for RepoMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RepoMode::Disabled => write!(f, "disabled"),
            RepoMode::Poll => write!(f, "poll"),
            RepoMode::Hook => write!(f, "hook"),
        }
    }
}

impl std::str::FromStr for RepoMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "disabled" => Ok(RepoMode::Disabled),
            "poll" => Ok(RepoMode::Poll),
            "hook" => Ok(RepoMode::Hook),
            _ => Err(format!("Unknown repository mode: {}", s)),
        }
    }
}

/// Which modules are tested on top of the explicit module lists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModulesAuto {
    /// Only the explicit branch and repository lists.
    #[serde(rename = "none")]
    ExplicitOnly,
    /// Modules found in the repository itself, excluding dependencies.
    #[default]
    Repo,
    /// Every available module, dependencies included.
    All,
}

impl std::fmt::Display for ModulesAuto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModulesAuto::ExplicitOnly => write!(f, "none"),
            ModulesAuto::Repo => write!(f, "repo"),
            ModulesAuto::All => write!(f, "all"),
        }
    }
}

impl std::str::FromStr for ModulesAuto {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" => Ok(ModulesAuto::ExplicitOnly),
            "repo" => Ok(ModulesAuto::Repo),
            "all" => Ok(ModulesAuto::All),
            _ => Err(format!("Unknown modules-auto policy: {}", s)),
        }
    }
}

/// A tracked remote repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Repository {
    pub id: RepoId,
    /// Remote URL, also the repository identity.
    pub name: String,
    /// Display and processing order.
    pub sequence: i32,
    pub mode: RepoMode,
    /// Last time a webhook notified a push.
    pub hook_time: Option<DateTime<Utc>>,
    /// Repository searched for duplicate builds.
    pub duplicate_of: Option<RepoId>,
    /// Repositories whose closest branch is checked out alongside this one.
    pub dependencies: Vec<RepoId>,
    /// Comma-separated explicit modules to test.
    pub modules: Option<String>,
    pub modules_auto: ModulesAuto,
    /// Running builds are exposed through the reverse proxy.
    pub nginx: bool,
}

/// Fields needed to register a repository.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewRepository {
    pub name: String,
    pub sequence: i32,
    pub mode: RepoMode,
    pub modules: Option<String>,
    pub modules_auto: ModulesAuto,
    pub nginx: bool,
}

impl Repository {
    /// Host/owner/name form of the remote, e.g. `github.com/acme/server`.
    pub fn base(&self) -> String {
        let mut s = self.name.as_str();
        for scheme in ["https://", "http://", "ssh://"] {
            if let Some(rest) = s.strip_prefix(scheme) {
                s = rest;
                break;
            }
        }
        if let Some((_, rest)) = s.split_once('@') {
            s = rest;
        }
        let s = s.strip_suffix(".git").unwrap_or(s);
        s.replace(':', "/")
    }

    /// `(host, owner, repo)` for hosting API calls.
    pub fn api_coordinates(&self) -> Option<(String, String, String)> {
        let base = self.base();
        let mut parts = base.split('/').filter(|p| !p.is_empty());
        let host = parts.next()?;
        let owner = parts.next()?;
        let repo = parts.next()?;
        Some((host.to_string(), owner.to_string(), repo.to_string()))
    }

    /// Directory name of the bare mirror under `<root>/repo`.
    pub fn mirror_dir_name(&self) -> String {
        self.name.replace(['@', ':', '/'], "_")
    }

    /// Explicit modules, split and trimmed.
    pub fn explicit_modules(&self) -> Vec<String> {
        split_modules(self.modules.as_deref())
    }

    pub fn is_enabled(&self) -> bool {
        self.mode != RepoMode::Disabled
    }
}

/// Split a comma-separated module list, dropping empty entries.
pub fn split_modules(list: Option<&str>) -> Vec<String> {
    list.unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(String::from)
        .collect()
}
