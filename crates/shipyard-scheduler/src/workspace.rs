//! Build working directories and the reclamation of stale artifacts.

use chrono::{Duration, Utc};
use shipyard_core::{Build, BuildFilter, BuildState, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::Context;
use crate::pipeline::Job;

/// Layout of `<root>/build/<dest>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildDir {
    root: PathBuf,
}

impl BuildDir {
    pub fn new(build_root: impl AsRef<Path>, dest: &str) -> Self {
        Self {
            root: build_root.as_ref().join(dest),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, relative: impl AsRef<Path>) -> PathBuf {
        self.root.join(relative)
    }

    pub fn logs(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn lock_path(&self, job: Job) -> PathBuf {
        self.logs().join(format!("{}.lock", job.name()))
    }

    pub fn log_path(&self, job: Job) -> PathBuf {
        self.logs().join(format!("{}.txt", job.name()))
    }

    /// Directory of the server package: `odoo` when present, `openerp` otherwise.
    pub fn server(&self) -> PathBuf {
        let odoo = self.root.join("odoo");
        if odoo.exists() {
            odoo
        } else {
            self.root.join("openerp")
        }
    }

    pub fn server_path(&self, relative: impl AsRef<Path>) -> PathBuf {
        self.server().join(relative)
    }
}

/// Numeric build id prefix of a database or directory name, e.g. `00012-...`.
fn id_prefix(name: &str) -> Option<i64> {
    let (digits, _) = name.split_once('-')?;
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Reclaim what a terminal build and its stale neighbours leave behind.
///
/// Failures are logged; cleanup never fails the caller.
pub async fn local_cleanup(ctx: &Context, build: &Build) {
    if let Err(e) = drop_build_databases(ctx, build).await {
        warn!(build = %build.dest, error = %e, "Failed to drop build databases");
    }
    if let Err(e) = remove_stale_directories(ctx).await {
        warn!(error = %e, "Failed to remove stale build directories");
    }
    if let Err(e) = drop_orphan_databases(ctx).await {
        warn!(error = %e, "Failed to drop orphan databases");
    }
}

async fn drop_build_databases(ctx: &Context, build: &Build) -> Result<()> {
    for name in ctx.databases.list_databases().await? {
        if name.starts_with(&build.dest) {
            debug!(build = %build.dest, database = %name, "Dropping build database");
            ctx.databases.drop_database(&name).await?;
        }
    }
    Ok(())
}

/// Remove build directories that are neither active nor within retention.
async fn remove_stale_directories(ctx: &Context) -> Result<()> {
    let build_root = ctx.settings.build_root();
    let mut names = Vec::new();
    let mut entries = match tokio::fs::read_dir(&build_root).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    if names.is_empty() {
        return Ok(());
    }

    let retention_start = Utc::now() - Duration::days(ctx.settings.retention_days);
    let known = ctx
        .store
        .search_builds(&BuildFilter::new().dests(names.iter().cloned()))
        .await?;
    let actives: HashSet<&str> = known
        .iter()
        .filter(|b| b.state != BuildState::Done || b.job_end.is_some_and(|end| end > retention_start))
        .map(|b| b.dest.as_str())
        .collect();

    for name in names.iter().filter(|n| !actives.contains(n.as_str())) {
        let path = build_root.join(name);
        info!(path = %path.display(), "Removing stale build directory");
        if let Err(e) = tokio::fs::remove_dir_all(&path).await {
            warn!(path = %path.display(), error = %e, "Failed to remove build directory");
        }
    }
    Ok(())
}

/// Drop `<id>-*` databases whose build is no longer testing or running.
async fn drop_orphan_databases(ctx: &Context) -> Result<()> {
    let live: HashSet<i64> = ctx
        .store
        .search_builds(&BuildFilter::new().states([BuildState::Testing, BuildState::Running]))
        .await?
        .iter()
        .map(|b| b.id.get())
        .collect();
    if live.is_empty() {
        return Ok(());
    }

    for name in ctx.databases.list_databases().await? {
        if id_prefix(&name).is_some_and(|id| !live.contains(&id)) {
            debug!(database = %name, "Dropping orphan database");
            ctx.databases.drop_database(&name).await?;
        }
    }
    Ok(())
}
