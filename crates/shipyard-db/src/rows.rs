//! Database rows and their conversion into domain records.

use chrono::{DateTime, Utc};
use shipyard_core::{
    Branch, BranchId, Build, BuildId, BuildLogEntry, RepoId, Repository,
};

use crate::DbError;

/// Database row for repositories. Dependencies live in their own table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RepositoryRow {
    pub id: i64,
    pub name: String,
    pub sequence: i32,
    pub mode: String,
    pub hook_time: Option<DateTime<Utc>>,
    pub duplicate_of: Option<i64>,
    pub modules: Option<String>,
    pub modules_auto: String,
    pub nginx: bool,
}

impl RepositoryRow {
    pub fn into_repository(self, dependencies: Vec<RepoId>) -> Result<Repository, DbError> {
        Ok(Repository {
            id: RepoId::new(self.id),
            mode: self.mode.parse().map_err(DbError::InvalidData)?,
            modules_auto: self.modules_auto.parse().map_err(DbError::InvalidData)?,
            name: self.name,
            sequence: self.sequence,
            hook_time: self.hook_time,
            duplicate_of: self.duplicate_of.map(RepoId::new),
            dependencies,
            modules: self.modules,
            nginx: self.nginx,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BranchRow {
    pub id: i64,
    pub repo_id: i64,
    pub name: String,
    pub sticky: bool,
    pub coverage: bool,
    pub pull_head_name: Option<String>,
    pub modules: Option<String>,
    pub job_timeout: Option<i32>,
}

impl From<BranchRow> for Branch {
    fn from(row: BranchRow) -> Self {
        Branch {
            id: BranchId::new(row.id),
            repo_id: RepoId::new(row.repo_id),
            name: row.name,
            sticky: row.sticky,
            coverage: row.coverage,
            pull_head_name: row.pull_head_name,
            modules: row.modules,
            job_timeout: row.job_timeout,
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BuildRow {
    pub id: i64,
    pub branch_id: i64,
    pub repo_id: i64,
    pub name: String,
    pub sequence: i64,
    pub state: String,
    pub result: Option<String>,
    pub job: Option<String>,
    pub job_start: Option<DateTime<Utc>>,
    pub job_end: Option<DateTime<Utc>>,
    pub host: Option<String>,
    pub port: Option<i32>,
    pub pid: Option<i32>,
    pub duplicate_of: Option<i64>,
    pub server_match: Option<String>,
    pub modules: Option<String>,
    pub dest: String,
    pub date: Option<DateTime<Utc>>,
    pub author: String,
    pub author_email: String,
    pub committer: String,
    pub committer_email: String,
    pub subject: String,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<BuildRow> for Build {
    type Error = DbError;

    fn try_from(row: BuildRow) -> Result<Self, Self::Error> {
        let port = row
            .port
            .map(u16::try_from)
            .transpose()
            .map_err(|_| DbError::InvalidData(format!("build {} has an invalid port", row.id)))?;

        Ok(Build {
            id: BuildId::new(row.id),
            branch_id: BranchId::new(row.branch_id),
            repo_id: RepoId::new(row.repo_id),
            name: row.name,
            sequence: row.sequence,
            state: row.state.parse().map_err(DbError::InvalidData)?,
            result: row
                .result
                .map(|r| r.parse())
                .transpose()
                .map_err(DbError::InvalidData)?,
            job: row.job,
            job_start: row.job_start,
            job_end: row.job_end,
            host: row.host,
            port,
            pid: row.pid,
            duplicate_of: row.duplicate_of.map(BuildId::new),
            server_match: row
                .server_match
                .map(|m| m.parse())
                .transpose()
                .map_err(DbError::InvalidData)?,
            modules: row.modules,
            dest: row.dest,
            date: row.date,
            author: row.author,
            author_email: row.author_email,
            committer: row.committer,
            committer_email: row.committer_email,
            subject: row.subject,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BuildLogRow {
    pub build_id: i64,
    pub func: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl From<BuildLogRow> for BuildLogEntry {
    fn from(row: BuildLogRow) -> Self {
        BuildLogEntry {
            build_id: BuildId::new(row.build_id),
            func: row.func,
            message: row.message,
            created_at: row.created_at,
        }
    }
}
