//! Reverse-proxy routes kept in a plain file.

use async_trait::async_trait;
use shipyard_core::{Error, ProxyRoute, ProxyRoutes, Result};
use std::path::PathBuf;
use tracing::{debug, info};

/// One `<dest> <host>:<port>` line per route, sorted by destination.
pub fn render_routes(routes: &[ProxyRoute]) -> String {
    let mut lines: Vec<String> = routes
        .iter()
        .map(|r| format!("{} {}:{}\n", r.dest, r.host, r.port))
        .collect();
    lines.sort();
    lines.concat()
}

/// Writes the routes file and signals the front-end with SIGHUP.
#[derive(Debug, Clone)]
pub struct FileProxy {
    config_path: PathBuf,
    pid_path: Option<PathBuf>,
}

impl FileProxy {
    pub fn new(config_path: impl Into<PathBuf>, pid_path: Option<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
            pid_path,
        }
    }

    async fn signal_reload(&self) -> Result<()> {
        let Some(pid_path) = &self.pid_path else {
            return Ok(());
        };
        let content = match tokio::fs::read_to_string(pid_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %pid_path.display(), "Proxy is not running");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let pid: i32 = content
            .trim()
            .parse()
            .map_err(|_| Error::InvalidInput(format!("bad pid file {}", pid_path.display())))?;
        if pid <= 1 {
            return Err(Error::InvalidInput(format!("refusing to signal pid {}", pid)));
        }
        // SAFETY: kill(2) has no memory-safety preconditions.
        if unsafe { libc::kill(pid, libc::SIGHUP) } != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }
}

#[async_trait]
impl ProxyRoutes for FileProxy {
    async fn reload(&self, routes: &[ProxyRoute]) -> Result<()> {
        let content = render_routes(routes);
        match tokio::fs::read_to_string(&self.config_path).await {
            Ok(current) if current == content => return Ok(()),
            _ => {}
        }

        if let Some(parent) = self.config_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let staging = self.config_path.with_extension("tmp");
        tokio::fs::write(&staging, &content).await?;
        tokio::fs::rename(&staging, &self.config_path).await?;
        info!(path = %self.config_path.display(), routes = routes.len(), "Proxy routes updated");

        self.signal_reload().await
    }
}
