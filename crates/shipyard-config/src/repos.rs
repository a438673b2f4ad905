//! Repository declarations.

use kdl::KdlNode;
use serde::{Deserialize, Serialize};
use shipyard_core::{ModulesAuto, NewRepository, RepoMode, Secret};

use crate::nodes::{flag, get_all_string_args, get_first_string_arg, require_string};
use crate::{ConfigError, ConfigResult};

/// A repository as declared in the configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepoDecl {
    /// Remote URL.
    pub name: String,
    pub sequence: i32,
    pub mode: RepoMode,
    /// Name of the repository searched for duplicate builds.
    pub duplicate_of: Option<String>,
    /// Names of the repositories checked out alongside this one.
    pub dependencies: Vec<String>,
    pub modules: Option<String>,
    pub modules_auto: ModulesAuto,
    /// Environment variable holding the hosting API token.
    pub token_env: Option<String>,
    /// Environment variable holding the webhook signing secret.
    pub webhook_secret_env: Option<String>,
    pub nginx: bool,
    /// Short names of the branches that are always kept.
    pub sticky: Vec<String>,
}

impl RepoDecl {
    pub fn token(&self) -> Option<Secret> {
        self.token_env.as_deref().and_then(Secret::from_env)
    }

    pub fn webhook_secret(&self) -> Option<Secret> {
        self.webhook_secret_env.as_deref().and_then(Secret::from_env)
    }

    pub fn to_new_repository(&self) -> NewRepository {
        NewRepository {
            name: self.name.clone(),
            sequence: self.sequence,
            mode: self.mode,
            modules: self.modules.clone(),
            modules_auto: self.modules_auto,
            nginx: self.nginx,
        }
    }
}

pub(crate) fn parse_repo(node: &KdlNode, sequence: i32) -> ConfigResult<RepoDecl> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("repo url".to_string()))?;

    let mut repo = RepoDecl {
        name,
        sequence,
        mode: RepoMode::Poll,
        duplicate_of: None,
        dependencies: Vec::new(),
        modules: None,
        modules_auto: ModulesAuto::Repo,
        token_env: None,
        webhook_secret_env: None,
        nginx: false,
        sticky: Vec::new(),
    };

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "mode" => {
                    repo.mode = require_string(child)?.parse().map_err(|message| {
                        ConfigError::InvalidValue {
                            field: format!("mode of repo '{}'", repo.name),
                            message,
                        }
                    })?;
                }
                "duplicate-of" => repo.duplicate_of = Some(require_string(child)?),
                "dependency" => repo.dependencies.extend(get_all_string_args(child)),
                "modules" => repo.modules = Some(require_string(child)?),
                "modules-auto" => {
                    repo.modules_auto = require_string(child)?.parse().map_err(|message| {
                        ConfigError::InvalidValue {
                            field: format!("modules-auto of repo '{}'", repo.name),
                            message,
                        }
                    })?;
                }
                "token-env" => repo.token_env = Some(require_string(child)?),
                "webhook-secret-env" => repo.webhook_secret_env = Some(require_string(child)?),
                "nginx" => repo.nginx = flag(child),
                "sticky" => repo.sticky.extend(get_all_string_args(child)),
                "sequence" => repo.sequence = crate::nodes::require_uint(child)?,
                _ => {}
            }
        }
    }

    Ok(repo)
}
