//! Applying the configured repositories to the store.

use shipyard_config::Config;
use shipyard_core::branch::HEADS_PREFIX;
use shipyard_core::{Error, NewBranch, RepoId, Repository, Result, Store};
use std::collections::{HashMap, HashSet};
use tracing::info;

/// Create or update every configured repository, then resolve references
/// between them and mark the configured sticky branches.
pub async fn sync_repositories(store: &dyn Store, config: &Config) -> Result<Vec<Repository>> {
    let mut repos = Vec::with_capacity(config.repos.len());
    for decl in &config.repos {
        let wanted = decl.to_new_repository();
        let repo = match store.find_repository(&decl.name).await? {
            Some(mut existing) => {
                existing.sequence = wanted.sequence;
                existing.mode = wanted.mode;
                existing.modules = wanted.modules;
                existing.modules_auto = wanted.modules_auto;
                existing.nginx = wanted.nginx;
                existing
            }
            None => {
                info!(repo = %decl.name, "Registering repository");
                store.create_repository(wanted).await?
            }
        };
        repos.push(repo);
    }

    let ids: HashMap<&str, RepoId> = repos.iter().map(|r| (r.name.as_str(), r.id)).collect();
    let resolve = |name: &str| {
        ids.get(name)
            .copied()
            .ok_or_else(|| Error::InvalidInput(format!("unknown repository '{}'", name)))
    };
    let mut resolved = Vec::with_capacity(repos.len());
    for (decl, repo) in config.repos.iter().zip(&repos) {
        let mut repo = repo.clone();
        repo.duplicate_of = decl.duplicate_of.as_deref().map(resolve).transpose()?;
        repo.dependencies = decl
            .dependencies
            .iter()
            .map(|name| resolve(name))
            .collect::<Result<_>>()?;
        store.update_repository(&repo).await?;
        sync_sticky_branches(store, &repo, &decl.sticky).await?;
        resolved.push(repo);
    }
    Ok(resolved)
}

async fn sync_sticky_branches(store: &dyn Store, repo: &Repository, sticky: &[String]) -> Result<()> {
    let wanted: HashSet<String> = sticky
        .iter()
        .map(|name| format!("{}{}", HEADS_PREFIX, name))
        .collect();

    for mut branch in store.list_branches(&[repo.id]).await? {
        if branch.sticky && !wanted.contains(&branch.name) {
            branch.sticky = false;
            store.update_branch(&branch).await?;
        }
    }
    for name in &wanted {
        let mut branch = match store.find_branch(repo.id, name).await? {
            Some(branch) => branch,
            None => store.create_branch(NewBranch::new(repo.id, name.as_str())).await?,
        };
        if !branch.sticky {
            branch.sticky = true;
            store.update_branch(&branch).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use shipyard_config::parse_config;
    use shipyard_core::{ModulesAuto, RepoMode};
    use shipyard_db::MemoryStore;

    const CONFIG: &str = r#"
        repo "git@github.com:acme/server.git" {
            mode "hook"
            sticky "master" "17.0"
        }
        repo "git@github.com:acme/addons.git" {
            duplicate-of "git@github.com:acme/server.git"
            dependency "git@github.com:acme/server.git"
            modules-auto "all"
        }
    "#;

    #[tokio::test]
    async fn test_sync_creates_and_links_repositories() {
        let store = MemoryStore::new();
        let config = parse_config(CONFIG).unwrap();

        let repos = sync_repositories(&store, &config).await.unwrap();

        let (server, addons) = (&repos[0], &repos[1]);
        assert_eq!(server.mode, RepoMode::Hook);
        assert_eq!(addons.duplicate_of, Some(server.id));
        assert_eq!(addons.dependencies, vec![server.id]);
        assert_eq!(addons.modules_auto, ModulesAuto::All);
        assert_eq!(store.get_repository(addons.id).await.unwrap(), *addons);

        let master = store
            .find_branch(server.id, "refs/heads/master")
            .await
            .unwrap()
            .unwrap();
        assert!(master.sticky);
    }

    #[tokio::test]
    async fn test_resync_updates_in_place() {
        let store = MemoryStore::new();
        sync_repositories(&store, &parse_config(CONFIG).unwrap())
            .await
            .unwrap();

        let changed = r#"
            repo "git@github.com:acme/server.git" {
                mode "disabled"
                sticky "17.0"
            }
        "#;
        let repos = sync_repositories(&store, &parse_config(changed).unwrap())
            .await
            .unwrap();

        assert_eq!(store.list_repositories().await.unwrap().len(), 2);
        assert_eq!(repos[0].mode, RepoMode::Disabled);
        let master = store
            .find_branch(repos[0].id, "refs/heads/master")
            .await
            .unwrap()
            .unwrap();
        assert!(!master.sticky);
    }
}
