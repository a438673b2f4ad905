//! Assembling a build's source tree and choosing the modules to test.

use shipyard_core::repository::split_modules;
use shipyard_core::{Build, ModulesAuto, Result, ServerMatch};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::Context;
use crate::matcher::closest_branch;

const MANIFESTS: [&str; 2] = ["__manifest__.py", "__openerp__.py"];

/// Modules never tested unless named explicitly.
const BLACKLIST: [&str; 10] = [
    "auth_ldap",
    "document_ftp",
    "base_gengo",
    "website_gengo",
    "website_instantclick",
    "pad",
    "pad_project",
    "note_pad",
    "pos_cache",
    "pos_blackbox_be",
];

/// Module prefixes skipped unless named explicitly.
const SKIPPED_PREFIXES: [&str; 3] = ["hw_", "theme_", "l10n_"];

/// Keep available modules, dropping blacklisted and hardware, theme and
/// localization ones that were not asked for. First occurrence wins.
pub fn filter_modules(
    modules: &[String],
    available: &HashSet<String>,
    explicit: &HashSet<String>,
) -> Vec<String> {
    let mut seen = HashSet::new();
    modules
        .iter()
        .filter(|m| available.contains(*m))
        .filter(|m| {
            explicit.contains(*m)
                || (!SKIPPED_PREFIXES.iter().any(|p| m.starts_with(p))
                    && !BLACKLIST.contains(&m.as_str()))
        })
        .filter(|m| seen.insert(m.as_str()))
        .cloned()
        .collect()
}

/// Immediate subdirectories of `dir` holding a module manifest, by name.
pub(crate) async fn module_dirs(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(found),
        Err(e) => return Err(e),
    };
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if is_module(&path).await {
            found.push(path);
        }
    }
    found.sort();
    Ok(found)
}

async fn is_module(path: &Path) -> bool {
    if !is_dir(path).await {
        return false;
    }
    for manifest in MANIFESTS {
        let is_file = tokio::fs::metadata(path.join(manifest))
            .await
            .is_ok_and(|m| m.is_file());
        if is_file {
            return true;
        }
    }
    false
}

async fn is_dir(path: &Path) -> bool {
    tokio::fs::metadata(path).await.is_ok_and(|m| m.is_dir())
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path).await.is_ok_and(|m| m.is_file())
}

pub(crate) fn dir_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Every entry of `dir`, modules or not.
async fn children(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    if !is_dir(dir).await {
        return Ok(found);
    }
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        found.push(entry.path());
    }
    found.sort();
    Ok(found)
}

/// Export the build's commit, its dependencies when the tree carries no
/// server, and gather every module under the server's addons directory.
///
/// Records `server_match` and `modules` on the build.
pub async fn checkout(ctx: &Context, build: &mut Build) -> Result<()> {
    let dir = ctx.build_dir(build);
    if tokio::fs::try_exists(dir.root()).await? {
        tokio::fs::remove_dir_all(dir.root()).await?;
    }
    tokio::fs::create_dir_all(dir.logs()).await?;

    let repo = ctx.store.get_repository(build.repo_id).await?;
    let branch = ctx.store.get_branch(build.branch_id).await?;
    ctx.vcs.export_tree(&repo, &build.name, dir.root()).await?;

    let has_server =
        is_file(&dir.path("odoo/__init__.py")).await || is_file(&dir.path("openerp/__init__.py")).await;
    let mut server_match = ServerMatch::Builtin;

    let mut modules = branch.explicit_modules();
    modules.extend(repo.explicit_modules());
    let explicit: HashSet<String> = modules.iter().cloned().collect();
    let mut to_move = Vec::new();

    if !has_server {
        if repo.modules_auto == ModulesAuto::Repo {
            modules.extend(module_dirs(dir.root()).await?.iter().map(|p| dir_name(p)));
        }

        for dependency in &repo.dependencies {
            let closest = closest_branch(ctx, build, *dependency).await?;
            let source = ctx.store.get_repository(closest.repo_id).await?;
            debug!(
                build = %build.dest,
                server_match = %closest.server_match,
                branch = %closest.name,
                repo = %source.name,
                "Exporting dependency"
            );
            ctx.log_build(
                build.id,
                "Building environment",
                &format!(
                    "{} match branch {} of {}",
                    closest.server_match, closest.name, source.name
                ),
            )
            .await;
            ctx.vcs.export_tree(&source, &closest.name, dir.root()).await?;
            server_match = closest.server_match;
        }

        to_move = module_dirs(dir.root()).await?;
    }

    let addons = dir.server_path("addons");
    tokio::fs::create_dir_all(&addons).await?;
    let mut sources = children(&dir.path("addons")).await?;
    sources.extend(to_move);
    let mut moved = HashSet::new();
    for source in sources {
        if !moved.insert(source.clone()) || !tokio::fs::try_exists(&source).await? {
            continue;
        }
        let name = dir_name(&source);
        let target = addons.join(&name);
        if target == source {
            continue;
        }
        if let Ok(meta) = tokio::fs::symlink_metadata(&target).await {
            ctx.log_build(
                build.id,
                "Building environment",
                &format!("You have duplicate modules in your branches \"{}\"", name),
            )
            .await;
            if meta.is_dir() {
                tokio::fs::remove_dir_all(&target).await?;
            } else {
                tokio::fs::remove_file(&target).await?;
            }
        }
        tokio::fs::rename(&source, &target).await?;
    }

    let available: Vec<String> = module_dirs(&addons).await?.iter().map(|p| dir_name(p)).collect();
    let auto = repo.modules_auto;
    if auto == ModulesAuto::All || (auto != ModulesAuto::ExplicitOnly && has_server) {
        modules.extend(available.iter().cloned());
    }

    let available: HashSet<String> = available.into_iter().collect();
    let selected = filter_modules(&modules, &available, &explicit);
    debug!(build = %build.dest, modules = ?selected, "Modules to test");

    build.server_match = Some(server_match);
    build.modules = Some(selected.join(","));
    ctx.save_from(build, build.state).await
}

/// Modules recorded on a build by checkout.
pub fn build_modules(build: &Build) -> Vec<String> {
    split_modules(build.modules.as_deref())
}
