//! Finding the branch of another repository that best matches a build.
//!
//! Rules, in priority order:
//! 1. a branch with the same name
//! 2. an open pull request whose head has that name
//! 3. a branch whose name is a dashed prefix of it
//! 4. the common branch with the most recent merge base
//!
//! Pull requests are matched by their target branch name so that
//! unrelated pull requests sharing a number are never linked.

use shipyard_core::branch::{HEADS_PREFIX, PULL_PREFIX};
use shipyard_core::{Branch, Build, RepoId, Repository, Result, ServerMatch};
use std::collections::{HashMap, HashSet};
use tracing::debug;

use crate::Context;

/// Fallback ref when nothing matches.
pub const DEFAULT_BRANCH: &str = "master";

/// Where to take a dependency's tree from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosestBranch {
    pub repo_id: RepoId,
    /// Ref to export, e.g. `refs/heads/saas-11`.
    pub name: String,
    pub server_match: ServerMatch,
}

/// Name the build is matched by: the pull request target for pulls,
/// the short branch name otherwise.
pub async fn match_name(ctx: &Context, repo: &Repository, branch: &Branch) -> String {
    if let Some(number) = branch.pull_number() {
        match ctx.hosting.pull_info(repo, number).await {
            Ok(Some(pull)) => return pull.base_ref,
            Ok(None) => {}
            Err(e) => debug!(branch = %branch.name, error = %e, "No pull info"),
        }
    }
    branch.short_name().to_string()
}

/// `target` followed by its `duplicate_of` chain.
async fn target_chain(ctx: &Context, target: RepoId) -> Result<Vec<RepoId>> {
    let mut chain = vec![target];
    let mut current = ctx.store.get_repository(target).await?;
    while let Some(next) = current.duplicate_of {
        if chain.contains(&next) {
            break;
        }
        chain.push(next);
        current = ctx.store.get_repository(next).await?;
    }
    Ok(chain)
}

async fn exists_on_remote(ctx: &Context, branch: &Branch, repos: &HashMap<RepoId, Repository>) -> bool {
    let Some(repo) = repos.get(&branch.repo_id) else {
        return false;
    };
    match ctx.vcs.is_on_remote(repo, &branch.name).await {
        Ok(found) => found,
        Err(e) => {
            debug!(branch = %branch.name, error = %e, "Remote check failed");
            false
        }
    }
}

/// Closest branch of `target` (or a repository it duplicates) for `build`.
pub async fn closest_branch(ctx: &Context, build: &Build, target: RepoId) -> Result<ClosestBranch> {
    let branch = ctx.store.get_branch(build.branch_id).await?;
    let repo = ctx.store.get_repository(build.repo_id).await?;
    let name = match_name(ctx, &repo, &branch).await;
    let chain = target_chain(ctx, target).await?;
    debug!(build = %build.dest, name, repos = ?chain, "Searching closest branch");

    let mut repos = HashMap::new();
    for id in &chain {
        repos.insert(*id, ctx.store.get_repository(*id).await?);
    }
    let mut candidates = ctx.store.list_branches(&chain).await?;
    let rank = |b: &Branch| {
        let position = chain.iter().position(|id| *id == b.repo_id).unwrap_or(chain.len());
        (
            !b.sticky,
            position,
            std::cmp::Reverse(b.short_name().len()),
            std::cmp::Reverse(b.id),
        )
    };
    candidates.sort_by_key(rank);
    let found = |b: &Branch, server_match| ClosestBranch {
        repo_id: b.repo_id,
        name: b.name.clone(),
        server_match,
    };

    let heads: Vec<&Branch> = candidates.iter().filter(|b| b.is_head()).collect();

    if let Some(same) = heads.iter().find(|b| b.short_name() == name) {
        if exists_on_remote(ctx, same, &repos).await {
            return Ok(found(*same, ServerMatch::Exact));
        }
    }

    for pull in candidates.iter().filter(|b| {
        b.name.starts_with(PULL_PREFIX) && b.pull_head_name.as_deref() == Some(name.as_str())
    }) {
        let (Some(pull_repo), Some(number)) = (repos.get(&pull.repo_id), pull.pull_number()) else {
            continue;
        };
        if let Ok(Some(info)) = ctx.hosting.pull_info(pull_repo, number).await {
            if info.is_open() {
                return Ok(found(pull, ServerMatch::Exact));
            }
        }
    }

    for head in &heads {
        if name.starts_with(&format!("{}-", head.short_name()))
            && exists_on_remote(ctx, head, &repos).await
        {
            return Ok(found(*head, ServerMatch::Prefix));
        }
    }

    let own: HashSet<String> = ctx
        .store
        .list_branches(&[repo.id])
        .await?
        .into_iter()
        .filter(|b| b.is_head())
        .map(|b| b.name)
        .collect();
    for target_id in &chain {
        let mut common: Vec<(chrono::DateTime<chrono::Utc>, String)> = Vec::new();
        let shared = candidates
            .iter()
            .filter(|b| b.repo_id == *target_id && b.name.starts_with(HEADS_PREFIX))
            .filter(|b| own.contains(&b.name));
        for candidate in shared {
            let Ok(Some(base)) = ctx.vcs.merge_base(&repo, &branch.name, &candidate.name).await
            else {
                continue;
            };
            if let Ok(date) = ctx.vcs.commit_date(&repo, &base).await {
                common.push((date, candidate.name.clone()));
            }
        }
        common.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        if let Some((_, best)) = common.into_iter().next() {
            return Ok(ClosestBranch {
                repo_id: *target_id,
                name: best,
                server_match: ServerMatch::Fuzzy,
            });
        }
    }

    Ok(ClosestBranch {
        repo_id: target,
        name: DEFAULT_BRANCH.to_string(),
        server_match: ServerMatch::Default,
    })
}
