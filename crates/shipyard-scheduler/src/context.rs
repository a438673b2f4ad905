//! Handles shared by every part of the scheduler.

use shipyard_config::Settings;
use shipyard_core::{
    Build, BuildId, BuildState, DatabaseAdmin, Error, HostingApi, ProxyRoutes, Result, Store,
    Supervisor, Vcs,
};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::workspace::BuildDir;

/// Settings plus the external collaborators the orchestrator drives.
#[derive(Clone)]
pub struct Context {
    pub settings: Arc<Settings>,
    pub store: Arc<dyn Store>,
    pub vcs: Arc<dyn Vcs>,
    pub hosting: Arc<dyn HostingApi>,
    pub supervisor: Arc<dyn Supervisor>,
    pub databases: Arc<dyn DatabaseAdmin>,
    /// Reverse proxy; `None` when no routes file is configured.
    pub proxy: Option<Arc<dyn ProxyRoutes>>,
}

impl Context {
    pub fn new(
        settings: Arc<Settings>,
        store: Arc<dyn Store>,
        vcs: Arc<dyn Vcs>,
        hosting: Arc<dyn HostingApi>,
        supervisor: Arc<dyn Supervisor>,
        databases: Arc<dyn DatabaseAdmin>,
    ) -> Self {
        Self {
            settings,
            store,
            vcs,
            hosting,
            supervisor,
            databases,
            proxy: None,
        }
    }

    pub fn with_proxy(mut self, proxy: Arc<dyn ProxyRoutes>) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Working directory of a build.
    pub fn build_dir(&self, build: &Build) -> BuildDir {
        BuildDir::new(self.settings.build_root(), &build.dest)
    }

    /// Persist `build` if nobody changed its state since it was `from`.
    ///
    /// A lost race is reported as [`Error::Conflict`]; the caller reloads.
    pub async fn save_from(&self, build: &Build, from: BuildState) -> Result<()> {
        if self.store.transition_build(build, from).await? {
            return Ok(());
        }
        Err(Error::Conflict(format!(
            "build {} is no longer {}",
            build.dest, from
        )))
    }

    /// Append an operator-facing entry to a build's log. Never fails.
    pub async fn log_build(&self, build_id: BuildId, func: &str, message: &str) {
        debug!(build = %build_id, func, message, "Build log");
        if let Err(e) = self.store.append_build_log(build_id, func, message).await {
            warn!(build = %build_id, error = %e, "Failed to write build log");
        }
    }
}
