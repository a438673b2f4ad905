//! Server command lines, built by probing the checked out tree.

use shipyard_config::Settings;
use shipyard_core::{Error, Result};

use crate::probe::file_contains;
use crate::workspace::BuildDir;

/// Server entry points, newest layout first.
pub const SERVER_BINARIES: [&str; 4] = [
    "odoo-bin",
    "openerp-server",
    "openerp-server.py",
    "bin/openerp-server.py",
];

/// Whether the server's option parser knows `option`.
pub fn supports(dir: &BuildDir, option: &str) -> bool {
    file_contains(&dir.server_path("tools/config.py"), option)
}

/// Database name of a connection URL, e.g. `shipyard` in `postgres://h/shipyard?x=y`.
fn database_name(url: &str) -> Option<&str> {
    let tail = url.rsplit('/').next()?;
    let name = tail.split('?').next()?;
    (!name.is_empty()).then_some(name)
}

/// Base command starting the server of a build on `port`.
pub fn server_command(settings: &Settings, dir: &BuildDir, port: u16) -> Result<Vec<String>> {
    let binary = SERVER_BINARIES
        .iter()
        .map(|b| dir.path(b))
        .find(|p| p.is_file())
        .ok_or_else(|| {
            Error::ExecutionFailed(format!("no server binary in {}", dir.root().display()))
        })?;

    let mut cmd = vec![
        binary.display().to_string(),
        format!("--xmlrpc-port={}", port),
    ];

    if supports(dir, "no-xmlrpcs") {
        cmd.push("--no-xmlrpcs".to_string());
    }
    if supports(dir, "no-netrpc") {
        cmd.push("--no-netrpc".to_string());
    }

    let log_db = settings
        .database_url
        .as_deref()
        .filter(|_| supports(dir, "log-db"));
    if let Some(url) = log_db {
        let target = if file_contains(&dir.server_path("sql_db.py"), "allow_uri") {
            Some(url)
        } else {
            database_name(url)
        };
        if let Some(target) = target {
            cmd.push(format!("--log-db={}", target));
            if supports(dir, "log-db-level") {
                cmd.push("--log-db-level".to_string());
                cmd.push("25".to_string());
            }
        }
    }

    if supports(dir, "data-dir") {
        let datadir = dir.path("datadir");
        std::fs::create_dir_all(&datadir)?;
        cmd.push("--data-dir".to_string());
        cmd.push(datadir.display().to_string());
    }

    Ok(cmd)
}
