//! Bare mirrors of the tracked repositories under `<root>/repo`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shipyard_core::{FetchOutcome, RefInfo, RepoMode, Repository, Result, Vcs};
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::GitError;

const REF_FIELDS: [&str; 8] = [
    "refname",
    "objectname",
    "committerdate:iso8601",
    "authorname",
    "authoremail",
    "subject",
    "committername",
    "committeremail",
];

/// Default budget of one git or tar invocation.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(600);

/// Git mirrors rooted at one directory, driven through the `git` binary.
///
/// Every command runs under a time budget and is killed when it overruns.
#[derive(Debug, Clone)]
pub struct GitMirror {
    root: PathBuf,
    timeout: Duration,
}

impl GitMirror {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            timeout: COMMAND_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run `cmd` to completion within the budget, collecting piped output.
    async fn run(&self, mut cmd: Command, name: &str) -> std::result::Result<Output, GitError> {
        cmd.stdin(Stdio::null()).kill_on_drop(true);
        match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(output) => Ok(output?),
            Err(_) => {
                warn!(command = name, timeout = ?self.timeout, "Command timed out");
                Err(GitError::Timeout {
                    command: name.to_string(),
                    after: self.timeout,
                })
            }
        }
    }

    /// Local path of a repository's bare mirror.
    pub fn path(&self, repo: &Repository) -> PathBuf {
        self.root.join(repo.mirror_dir_name())
    }

    async fn git(&self, repo: &Repository, args: &[&str]) -> std::result::Result<Output, GitError> {
        let git_dir = self.path(repo);
        debug!(repo = %repo.name, args = ?args, "git command");
        let mut cmd = Command::new("git");
        cmd.arg(format!("--git-dir={}", git_dir.display())).args(args);
        self.run(cmd, args.first().copied().unwrap_or("git")).await
    }

    /// Run a git command that must succeed and return its stdout.
    async fn git_ok(&self, repo: &Repository, args: &[&str]) -> std::result::Result<String, GitError> {
        let output = self.git(repo, args).await?;
        if !output.status.success() {
            return Err(GitError::CommandFailed {
                command: args.first().copied().unwrap_or_default().to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn ensure_cloned(&self, repo: &Repository) -> std::result::Result<(), GitError> {
        let path = self.path(repo);
        if path.join("refs").is_dir() {
            return Ok(());
        }
        tokio::fs::create_dir_all(&path).await?;

        info!(repo = %repo.name, path = %path.display(), "Cloning repository");
        let mut cmd = Command::new("git");
        cmd.args(["clone", "--bare", &repo.name]).arg(&path);
        let output = self.run(cmd, "clone").await?;

        if !output.status.success() {
            return Err(GitError::CommandFailed {
                command: "clone".to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    /// Whether a hook-mode repository was fetched after its last notification.
    fn fetched_since_hook(&self, repo: &Repository) -> bool {
        if repo.mode != RepoMode::Hook {
            return false;
        }
        let Some(hook_time) = repo.hook_time else {
            return false;
        };
        let fetch_head = self.path(repo).join("FETCH_HEAD");
        match std::fs::metadata(&fetch_head).and_then(|m| m.modified()) {
            Ok(modified) => DateTime::<Utc>::from(modified) > hook_time,
            Err(_) => false,
        }
    }
}

/// Parse `for-each-ref` output made of NUL-separated fields, one ref per line.
pub fn parse_refs(output: &str) -> std::result::Result<Vec<RefInfo>, GitError> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let fields: Vec<&str> = line.split('\0').collect();
            let &[name, commit, date, author, author_email, subject, committer, committer_email] =
                fields.as_slice()
            else {
                return Err(GitError::Parse(format!("ref line has {} fields", fields.len())));
            };
            Ok(RefInfo {
                name: name.to_string(),
                commit: commit.to_string(),
                date: parse_git_date(date)?,
                author: author.to_string(),
                author_email: strip_angles(author_email),
                subject: subject.to_string(),
                committer: committer.to_string(),
                committer_email: strip_angles(committer_email),
            })
        })
        .collect()
}

/// Parse git's ISO-like date, e.g. `2024-03-01 10:22:03 +0100`.
pub fn parse_git_date(date: &str) -> std::result::Result<DateTime<Utc>, GitError> {
    DateTime::parse_from_str(date.trim(), "%Y-%m-%d %H:%M:%S %z")
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| GitError::Parse(format!("date '{}': {}", date, e)))
}

fn strip_angles(email: &str) -> String {
    email
        .trim()
        .trim_start_matches('<')
        .trim_end_matches('>')
        .to_string()
}

#[async_trait]
impl Vcs for GitMirror {
    async fn fetch(&self, repo: &Repository) -> Result<FetchOutcome> {
        self.ensure_cloned(repo).await?;

        if self.fetched_since_hook(repo) {
            debug!(repo = %repo.name, "Skipping fetch, no hook since the last one");
            return Ok(FetchOutcome::UpToDate);
        }

        self.git_ok(repo, &["fetch", "-p", "origin", "+refs/heads/*:refs/heads/*"])
            .await?;
        self.git_ok(repo, &["fetch", "-p", "origin", "+refs/pull/*/head:refs/pull/*"])
            .await?;
        Ok(FetchOutcome::Fetched)
    }

    async fn list_refs(&self, repo: &Repository) -> Result<Vec<RefInfo>> {
        let format = REF_FIELDS
            .iter()
            .map(|f| format!("%({})", f))
            .collect::<Vec<_>>()
            .join("%00");
        let stdout = self
            .git_ok(
                repo,
                &[
                    "for-each-ref",
                    "--format",
                    &format,
                    "--sort=-committerdate",
                    "refs/heads",
                    "refs/pull",
                ],
            )
            .await?;
        Ok(parse_refs(&stdout)?)
    }

    async fn export_tree(&self, repo: &Repository, treeish: &str, dest: &Path) -> Result<()> {
        debug!(repo = %repo.name, treeish = %treeish, dest = %dest.display(), "Exporting tree");
        tokio::fs::create_dir_all(dest).await?;

        // Archive to a file first so a failed archive never leaves a partial tree.
        let archive = tempfile::NamedTempFile::new()?;
        let mut cmd = Command::new("git");
        cmd.arg(format!("--git-dir={}", self.path(repo).display()))
            .args(["archive", treeish])
            .stdout(Stdio::from(archive.reopen()?));
        let archived = self.run(cmd, "archive").await?;
        if !archived.status.success() {
            return Err(GitError::CommandFailed {
                command: "archive".to_string(),
                stderr: String::from_utf8_lossy(&archived.stderr).trim().to_string(),
            }
            .into());
        }

        let mut cmd = Command::new("tar");
        cmd.arg("-xmf")
            .arg(archive.path())
            .arg("-C")
            .arg(dest)
            .stdout(Stdio::null());
        let output = self.run(cmd, "tar").await?;
        if !output.status.success() {
            return Err(GitError::CommandFailed {
                command: "tar".to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }
            .into());
        }
        Ok(())
    }

    async fn merge_base(&self, repo: &Repository, a: &str, b: &str) -> Result<Option<String>> {
        let output = self.git(repo, &["merge-base", a, b]).await?;
        match output.status.code() {
            Some(0) => {}
            // No common ancestor.
            Some(1) => return Ok(None),
            code => {
                let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                warn!(repo = %repo.name, a, b, code, stderr = %stderr, "merge-base failed");
                return Err(GitError::CommandFailed {
                    command: "merge-base".to_string(),
                    stderr,
                }
                .into());
            }
        }
        let base = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok((!base.is_empty()).then_some(base))
    }

    async fn commit_date(&self, repo: &Repository, commit: &str) -> Result<DateTime<Utc>> {
        let stdout = self
            .git_ok(repo, &["log", "-1", "--format=%cd", "--date=iso", commit])
            .await?;
        Ok(parse_git_date(&stdout)?)
    }

    async fn is_on_remote(&self, repo: &Repository, ref_name: &str) -> Result<bool> {
        let output = self
            .git(repo, &["ls-remote", "-q", "--exit-code", &repo.name, ref_name])
            .await?;
        Ok(output.status.success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use shipyard_core::{ModulesAuto, RepoId};

    #[test]
    fn test_parse_refs() {
        let output = "refs/heads/master\0abc123\02024-03-01 10:22:03 +0100\0Jane\0<jane@example.com>\0Fix it\0John\0<john@example.com>\n\
                      refs/pull/12\0def456\02024-02-01 00:00:00 +0000\0Bob\0<bob@example.com>\0[ADD] thing\0Bob\0<bob@example.com>\n";
        let refs = parse_refs(output).unwrap();
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].name, "refs/heads/master");
        assert_eq!(refs[0].commit, "abc123");
        assert_eq!(refs[0].date, Utc.with_ymd_and_hms(2024, 3, 1, 9, 22, 3).unwrap());
        assert_eq!(refs[0].author_email, "jane@example.com");
        assert_eq!(refs[0].committer, "John");
        assert_eq!(refs[1].subject, "[ADD] thing");
    }

    #[test]
    fn test_parse_refs_rejects_short_lines() {
        assert!(parse_refs("refs/heads/master\0abc\n").is_err());
        assert!(parse_refs("").unwrap().is_empty());
    }

    fn repo(name: &str, mode: RepoMode, hook_time: Option<DateTime<Utc>>) -> Repository {
        Repository {
            id: RepoId::new(1),
            name: name.to_string(),
            sequence: 1,
            mode,
            hook_time,
            duplicate_of: None,
            dependencies: Vec::new(),
            modules: None,
            modules_auto: ModulesAuto::Repo,
            nginx: false,
        }
    }

    #[test]
    fn test_hook_freshness() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = GitMirror::new(dir.path());
        let past = Utc::now() - chrono::Duration::hours(1);
        let future = Utc::now() + chrono::Duration::hours(1);

        let hooked = repo("git@example.com:a/b.git", RepoMode::Hook, Some(past));
        std::fs::create_dir_all(mirror.path(&hooked)).unwrap();
        assert!(!mirror.fetched_since_hook(&hooked));

        std::fs::write(mirror.path(&hooked).join("FETCH_HEAD"), "").unwrap();
        assert!(mirror.fetched_since_hook(&hooked));

        let notified = repo("git@example.com:a/b.git", RepoMode::Hook, Some(future));
        assert!(!mirror.fetched_since_hook(&notified));

        let polled = repo("git@example.com:a/b.git", RepoMode::Poll, Some(past));
        assert!(!mirror.fetched_since_hook(&polled));
    }

    #[test]
    fn test_mirror_path() {
        let mirror = GitMirror::new("/srv/repo");
        let r = repo("git@github.com:acme/server.git", RepoMode::Poll, None);
        assert_eq!(
            mirror.path(&r),
            PathBuf::from("/srv/repo/git_github.com_acme_server.git")
        );
    }

    /// Run git in `dir` with a fixed identity, returning trimmed stdout.
    fn sh_git(dir: &Path, args: &[&str]) -> String {
        let output = std::process::Command::new("git")
            .args(["-c", "user.name=Ada", "-c", "user.email=ada@example.com"])
            .args(args)
            .current_dir(dir)
            .output()
            .unwrap();
        assert!(
            output.status.success(),
            "git {:?}: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    /// A work repository with `master`, a `feature` branch on top of it and
    /// an unrelated `lonely` branch.
    fn upstream(dir: &Path) -> (String, String) {
        sh_git(dir, &["init", "-q"]);
        std::fs::write(dir.join("README"), "hello").unwrap();
        sh_git(dir, &["add", "README"]);
        sh_git(dir, &["commit", "-q", "-m", "first"]);
        sh_git(dir, &["branch", "-M", "master"]);
        let master = sh_git(dir, &["rev-parse", "HEAD"]);
        sh_git(dir, &["checkout", "-q", "-b", "feature"]);
        sh_git(dir, &["commit", "-q", "--allow-empty", "-m", "second"]);
        sh_git(dir, &["checkout", "-q", "--orphan", "lonely"]);
        sh_git(dir, &["commit", "-q", "--allow-empty", "-m", "unrelated"]);
        let feature = sh_git(dir, &["rev-parse", "feature"]);
        (master, feature)
    }

    async fn fetched_mirror() -> (tempfile::TempDir, GitMirror, Repository, String, String) {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("work");
        std::fs::create_dir_all(&work).unwrap();
        let (master, feature) = upstream(&work);
        let mirror = GitMirror::new(dir.path().join("repo"));
        let r = repo(&work.display().to_string(), RepoMode::Poll, None);
        assert_eq!(mirror.fetch(&r).await.unwrap(), FetchOutcome::Fetched);
        (dir, mirror, r, master, feature)
    }

    #[tokio::test]
    async fn test_list_refs_of_a_fetched_mirror() {
        let (_dir, mirror, r, master, feature) = fetched_mirror().await;

        let refs = mirror.list_refs(&r).await.unwrap();
        let find = |name: &str| refs.iter().find(|i| i.name == name).map(|i| i.commit.clone());
        assert_eq!(find("refs/heads/master"), Some(master));
        assert_eq!(find("refs/heads/feature"), Some(feature.clone()));
        assert!(find("refs/heads/lonely").is_some());
        let info = refs.iter().find(|i| i.name == "refs/heads/feature").unwrap();
        assert_eq!(info.subject, "second");
        assert_eq!(info.author_email, "ada@example.com");

        let date = mirror.commit_date(&r, &feature).await.unwrap();
        assert_eq!(date, info.date);
    }

    #[tokio::test]
    async fn test_merge_base_without_common_ancestor() {
        let (_dir, mirror, r, master, _) = fetched_mirror().await;

        assert_eq!(
            mirror.merge_base(&r, "refs/heads/feature", "refs/heads/master").await.unwrap(),
            Some(master)
        );
        assert_eq!(
            mirror.merge_base(&r, "refs/heads/lonely", "refs/heads/master").await.unwrap(),
            None
        );
        // An unknown ref is a failure, not a missing ancestor.
        assert!(mirror.merge_base(&r, "refs/heads/nope", "refs/heads/master").await.is_err());
    }

    #[tokio::test]
    async fn test_export_tree() {
        let (dir, mirror, r, master, _) = fetched_mirror().await;
        let dest = dir.path().join("build");

        mirror.export_tree(&r, &master, &dest).await.unwrap();
        assert_eq!(std::fs::read_to_string(dest.join("README")).unwrap(), "hello");

        let missing = "0123456789abcdef0123456789abcdef01234567";
        let err = mirror.export_tree(&r, missing, &dir.path().join("other")).await.unwrap_err();
        assert!(matches!(err, shipyard_core::Error::Vcs(_)));
        assert!(!dir.path().join("other/README").exists());
    }

    #[tokio::test]
    async fn test_is_on_remote() {
        let (_dir, mirror, r, _, _) = fetched_mirror().await;
        assert!(mirror.is_on_remote(&r, "refs/heads/feature").await.unwrap());
        assert!(!mirror.is_on_remote(&r, "refs/heads/gone").await.unwrap());
    }

    #[tokio::test]
    async fn test_command_over_budget_is_a_timeout() {
        let (_dir, mirror, r, _, _) = fetched_mirror().await;
        let mirror = mirror.with_timeout(Duration::ZERO);

        let err = mirror.list_refs(&r).await.unwrap_err();
        assert!(matches!(err, shipyard_core::Error::Timeout(_)));
    }
}
