//! Orchestrator-wide settings.

use kdl::KdlNode;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::nodes::{require_string, require_uint};
use crate::{ConfigError, ConfigResult};

/// Immutable settings shared by the scheduler, pipeline runner and supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Root of the `repo/` mirrors and `build/` working directories.
    pub root: PathBuf,
    /// Maximum number of testing builds on this host.
    pub workers: usize,
    /// Maximum number of running builds kept on this host.
    pub running_max: usize,
    /// Default job timeout.
    pub timeout: Duration,
    pub starting_port: u16,
    /// Refs whose last commit is older than this many days are not built.
    pub max_age_days: i64,
    /// Days a finished build's artifacts are kept.
    pub retention_days: i64,
    /// Public domain of the orchestrator.
    pub domain: String,
    /// Identity of this worker host.
    pub host: String,
    pub tick_interval: Duration,
    pub database_url: Option<String>,
    /// Connection used to create and drop per-build databases.
    pub admin_database_url: Option<String>,
    pub listen: String,
    /// Routes file of the reverse proxy.
    pub proxy_config: Option<PathBuf>,
    /// Pid file of the reverse proxy, signalled after the routes change.
    pub proxy_pid: Option<PathBuf>,
    /// Context reported with commit statuses.
    pub status_context: String,
}

impl Default for Settings {
    fn default() -> Self {
        let host = hostname();
        Self {
            root: PathBuf::from("/var/lib/shipyard"),
            workers: 6,
            running_max: 75,
            timeout: Duration::from_secs(1800),
            starting_port: 2000,
            max_age_days: 30,
            retention_days: 7,
            domain: host.clone(),
            host,
            tick_interval: Duration::from_secs(10),
            database_url: None,
            admin_database_url: None,
            listen: "0.0.0.0:3000".to_string(),
            proxy_config: None,
            proxy_pid: None,
            status_context: "ci/shipyard".to_string(),
        }
    }
}

impl Settings {
    pub fn repo_root(&self) -> PathBuf {
        self.root.join("repo")
    }

    pub fn build_root(&self) -> PathBuf {
        self.root.join("build")
    }
}

/// Apply the children of the `shipyard { ... }` node over the defaults.
pub(crate) fn parse_settings(node: &KdlNode, settings: &mut Settings) -> ConfigResult<()> {
    let Some(children) = node.children() else {
        return Ok(());
    };

    let mut domain_set = false;
    for child in children.nodes() {
        match child.name().value() {
            "root" => settings.root = PathBuf::from(require_string(child)?),
            "workers" => settings.workers = require_uint(child)?,
            "running-max" => settings.running_max = require_uint(child)?,
            "timeout" => settings.timeout = Duration::from_secs(require_uint(child)?),
            "starting-port" => settings.starting_port = require_uint(child)?,
            "max-age" => settings.max_age_days = require_uint(child)?,
            "retention-days" => settings.retention_days = require_uint(child)?,
            "domain" => {
                settings.domain = require_string(child)?;
                domain_set = true;
            }
            "host" => settings.host = require_string(child)?,
            "tick-interval" => {
                settings.tick_interval = Duration::from_secs(require_uint(child)?)
            }
            "database-url" => settings.database_url = Some(require_string(child)?),
            "admin-database-url" => settings.admin_database_url = Some(require_string(child)?),
            "listen" => settings.listen = require_string(child)?,
            "proxy-config" => settings.proxy_config = Some(PathBuf::from(require_string(child)?)),
            "proxy-pid" => settings.proxy_pid = Some(PathBuf::from(require_string(child)?)),
            "status-context" => settings.status_context = require_string(child)?,
            _ => {} // Ignore unknown settings
        }
    }

    if !domain_set {
        settings.domain = settings.host.clone();
    }
    if settings.workers == 0 {
        return Err(ConfigError::InvalidValue {
            field: "workers".to_string(),
            message: "at least one worker is required".to_string(),
        });
    }
    if settings.tick_interval.is_zero() {
        return Err(ConfigError::InvalidValue {
            field: "tick-interval".to_string(),
            message: "must be at least one second".to_string(),
        });
    }
    Ok(())
}

/// Hostname of the machine, `localhost` when it cannot be read.
pub fn hostname() -> String {
    let mut buf = [0u8; 256];
    // SAFETY: the buffer is valid for `buf.len()` bytes and gethostname
    // writes at most that many.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if rc != 0 {
        return "localhost".to_string();
    }
    let len = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
    match std::str::from_utf8(&buf[..len]) {
        Ok(name) if !name.is_empty() => name.to_string(),
        _ => "localhost".to_string(),
    }
}
