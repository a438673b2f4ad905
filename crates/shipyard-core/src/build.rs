//! Builds: one attempt to test a commit of a branch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{BranchId, BuildId, RepoId};

/// Lifecycle state of a build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildState {
    /// Waiting for admission.
    #[default]
    Pending,
    /// Running the test jobs.
    Testing,
    /// Tests finished, the last job serves the build.
    Running,
    Done,
    /// Mirrors the result of an equivalent build.
    Duplicate,
    /// An administrator asked for the build to be killed.
    Deathrow,
}

impl BuildState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildState::Pending => "pending",
            BuildState::Testing => "testing",
            BuildState::Running => "running",
            BuildState::Done => "done",
            BuildState::Duplicate => "duplicate",
            BuildState::Deathrow => "deathrow",
        }
    }

    /// States whose builds own a job and a port.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            BuildState::Testing | BuildState::Running | BuildState::Deathrow
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BuildState::Done | BuildState::Duplicate)
    }
}

impl std::fmt::Display for BuildState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BuildState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(BuildState::Pending),
            "testing" => Ok(BuildState::Testing),
            "running" => Ok(BuildState::Running),
            "done" => Ok(BuildState::Done),
            "duplicate" => Ok(BuildState::Duplicate),
            "deathrow" => Ok(BuildState::Deathrow),
            _ => Err(format!("Unknown build state: {}", s)),
        }
    }
}

/// Judged outcome of a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildResult {
    Ok,
    Warn,
    Ko,
    Skipped,
    Killed,
    ManuallyKilled,
}

impl BuildResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildResult::Ok => "ok",
            BuildResult::Warn => "warn",
            BuildResult::Ko => "ko",
            BuildResult::Skipped => "skipped",
            BuildResult::Killed => "killed",
            BuildResult::ManuallyKilled => "manually_killed",
        }
    }
}

impl std::fmt::Display for BuildResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BuildResult {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ok" => Ok(BuildResult::Ok),
            "warn" => Ok(BuildResult::Warn),
            "ko" => Ok(BuildResult::Ko),
            "skipped" => Ok(BuildResult::Skipped),
            "killed" => Ok(BuildResult::Killed),
            "manually_killed" => Ok(BuildResult::ManuallyKilled),
            _ => Err(format!("Unknown build result: {}", s)),
        }
    }
}

/// How the branch of a dependency repository was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerMatch {
    /// The build's own tree contains the server.
    Builtin,
    /// Same branch name, or an open pull request with that head name.
    Exact,
    /// A branch whose name is a dashed prefix of the build's branch.
    Prefix,
    /// Most recent common ancestor.
    Fuzzy,
    /// Nothing matched, fell back to `master`.
    Default,
}

impl ServerMatch {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerMatch::Builtin => "builtin",
            ServerMatch::Exact => "exact",
            ServerMatch::Prefix => "prefix",
            ServerMatch::Fuzzy => "fuzzy",
            ServerMatch::Default => "default",
        }
    }
}

impl std::fmt::Display for ServerMatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ServerMatch {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "builtin" => Ok(ServerMatch::Builtin),
            "exact" => Ok(ServerMatch::Exact),
            "prefix" => Ok(ServerMatch::Prefix),
            "fuzzy" => Ok(ServerMatch::Fuzzy),
            "default" => Ok(ServerMatch::Default),
            _ => Err(format!("Unknown server match: {}", s)),
        }
    }
}

/// A build record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Build {
    pub id: BuildId,
    pub branch_id: BranchId,
    pub repo_id: RepoId,
    /// Commit id.
    pub name: String,
    /// Admission order; lower is admitted first.
    pub sequence: i64,
    pub state: BuildState,
    pub result: Option<BuildResult>,
    /// Name of the pipeline job being executed.
    pub job: Option<String>,
    pub job_start: Option<DateTime<Utc>>,
    pub job_end: Option<DateTime<Utc>>,
    /// Worker host owning the build.
    pub host: Option<String>,
    pub port: Option<u16>,
    /// Process group leader of the current job.
    pub pid: Option<i32>,
    pub duplicate_of: Option<BuildId>,
    pub server_match: Option<ServerMatch>,
    /// Comma-separated modules selected at checkout.
    pub modules: Option<String>,
    /// Directory name under `<root>/build`.
    pub dest: String,
    pub date: Option<DateTime<Utc>>,
    pub author: String,
    pub author_email: String,
    pub committer: String,
    pub committer_email: String,
    pub subject: String,
    pub created_at: DateTime<Utc>,
}

/// Fields needed to create a build.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewBuild {
    pub branch_id: BranchId,
    pub repo_id: RepoId,
    pub name: String,
    /// Explicit sequence; defaults to the new build's id.
    pub sequence: Option<i64>,
    pub state: BuildState,
    pub duplicate_of: Option<BuildId>,
    pub modules: Option<String>,
    pub date: Option<DateTime<Utc>>,
    pub author: String,
    pub author_email: String,
    pub committer: String,
    pub committer_email: String,
    pub subject: String,
}

impl NewBuild {
    /// Copy of an existing build, used for rebuilds.
    pub fn copy_of(build: &Build) -> Self {
        Self {
            branch_id: build.branch_id,
            repo_id: build.repo_id,
            name: build.name.clone(),
            sequence: None,
            state: BuildState::Pending,
            duplicate_of: None,
            modules: build.modules.clone(),
            date: build.date,
            author: build.author.clone(),
            author_email: build.author_email.clone(),
            committer: build.committer.clone(),
            committer_email: build.committer_email.clone(),
            subject: build.subject.clone(),
        }
    }
}

/// Destination directory name: `<id:05>-<nickname>-<commit[:6]>`, lowercase.
pub fn build_dest(id: BuildId, nickname: &str, commit: &str) -> String {
    let nick: String = nickname
        .chars()
        .filter(|c| !matches!(c, '"' | '\'' | '~' | ':'))
        .map(|c| if matches!(c, '_' | '/' | '.') { '-' } else { c })
        .take(32)
        .collect();
    let commit: String = commit.chars().take(6).collect();
    format!("{:05}-{}-{}", id.get(), nick, commit).to_lowercase()
}

impl Build {
    /// Time spent in the jobs so far, or in total once `job_end` is set.
    pub fn job_time(&self, now: DateTime<Utc>) -> Option<Duration> {
        let start = self.job_start?;
        let end = self.job_end.unwrap_or(now);
        (end - start).to_std().ok()
    }

    /// Time since the current job series started.
    pub fn job_age(&self, now: DateTime<Utc>) -> Option<Duration> {
        (now - self.job_start?).to_std().ok()
    }

    /// Public address of a running build.
    pub fn domain(&self, proxied: bool, public_domain: &str) -> String {
        match (proxied, &self.host, self.port) {
            (true, Some(host), _) => format!("{}.{}", self.dest, host),
            (_, _, Some(port)) => format!("{}:{}", public_domain, port),
            _ => public_domain.to_string(),
        }
    }

    pub fn is_owned_by(&self, host: &str) -> bool {
        self.host.as_deref() == Some(host)
    }
}

/// An operator-facing log entry attached to a build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildLogEntry {
    pub build_id: BuildId,
    pub func: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// Human readable duration: `3d`, `2h`, `5m` or `40s`.
pub fn human_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    for (delay, unit) in [(86400, 'd'), (3600, 'h'), (60, 'm')] {
        if secs >= delay {
            return format!("{}{}", secs / delay, unit);
        }
    }
    format!("{}s", secs)
}
