//! PostgreSQL implementation of the record store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shipyard_core::branch::NewBranch;
use shipyard_core::build::build_dest;
use shipyard_core::repository::NewRepository;
use shipyard_core::{
    Branch, BranchId, Build, BuildFilter, BuildId, BuildLogEntry, BuildOrder, BuildState, NewBuild,
    RepoId, Repository, Result, Store,
};
use sqlx::{PgPool, Postgres, QueryBuilder};
use std::collections::HashMap;

use crate::rows::{BranchRow, BuildLogRow, BuildRow, RepositoryRow};
use crate::{DbError, DbResult};

const REPOSITORY_COLUMNS: &str =
    "id, name, sequence, mode, hook_time, duplicate_of, modules, modules_auto, nginx";

const BRANCH_COLUMNS: &str =
    "id, repo_id, name, sticky, coverage, pull_head_name, modules, job_timeout";

/// PostgreSQL-backed store.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn load_dependencies(&self, repo_ids: &[i64]) -> DbResult<HashMap<i64, Vec<RepoId>>> {
        let rows: Vec<(i64, i64)> = sqlx::query_as(
            r#"
            SELECT repo_id, dependency_id FROM repository_dependencies
            WHERE repo_id = ANY($1)
            ORDER BY repo_id, position
            "#,
        )
        .bind(repo_ids)
        .fetch_all(&self.pool)
        .await?;

        let mut deps: HashMap<i64, Vec<RepoId>> = HashMap::new();
        for (repo_id, dependency_id) in rows {
            deps.entry(repo_id).or_default().push(RepoId::new(dependency_id));
        }
        Ok(deps)
    }

    async fn hydrate_repositories(&self, rows: Vec<RepositoryRow>) -> DbResult<Vec<Repository>> {
        let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
        let mut deps = self.load_dependencies(&ids).await?;
        rows.into_iter()
            .map(|row| {
                let dependencies = deps.remove(&row.id).unwrap_or_default();
                row.into_repository(dependencies)
            })
            .collect()
    }

    pub async fn insert_repository(&self, new: NewRepository) -> DbResult<Repository> {
        let row = sqlx::query_as::<_, RepositoryRow>(&format!(
            r#"
            INSERT INTO repositories (name, sequence, mode, modules, modules_auto, nginx)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {REPOSITORY_COLUMNS}
            "#
        ))
        .bind(&new.name)
        .bind(new.sequence)
        .bind(new.mode.to_string())
        .bind(&new.modules)
        .bind(new.modules_auto.to_string())
        .bind(new.nginx)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| DbError::on_conflict(e, format!("repository {}", new.name)))?;

        row.into_repository(Vec::new())
    }

    pub async fn repository_by_id(&self, id: RepoId) -> DbResult<Repository> {
        let row = sqlx::query_as::<_, RepositoryRow>(&format!(
            "SELECT {REPOSITORY_COLUMNS} FROM repositories WHERE id = $1"
        ))
        .bind(id.get())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("repository {}", id)))?;

        let mut repos = self.hydrate_repositories(vec![row]).await?;
        repos
            .pop()
            .ok_or_else(|| DbError::NotFound(format!("repository {}", id)))
    }

    pub async fn repository_by_name(&self, name: &str) -> DbResult<Option<Repository>> {
        let row = sqlx::query_as::<_, RepositoryRow>(&format!(
            "SELECT {REPOSITORY_COLUMNS} FROM repositories WHERE name = $1"
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(self.hydrate_repositories(vec![row]).await?.pop()),
            None => Ok(None),
        }
    }

    pub async fn all_repositories(&self) -> DbResult<Vec<Repository>> {
        let rows = sqlx::query_as::<_, RepositoryRow>(&format!(
            "SELECT {REPOSITORY_COLUMNS} FROM repositories ORDER BY sequence, id"
        ))
        .fetch_all(&self.pool)
        .await?;

        self.hydrate_repositories(rows).await
    }

    pub async fn save_repository(&self, repo: &Repository) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE repositories
            SET name = $2, sequence = $3, mode = $4, hook_time = $5, duplicate_of = $6,
                modules = $7, modules_auto = $8, nginx = $9
            WHERE id = $1
            "#,
        )
        .bind(repo.id.get())
        .bind(&repo.name)
        .bind(repo.sequence)
        .bind(repo.mode.to_string())
        .bind(repo.hook_time)
        .bind(repo.duplicate_of.map(|r| r.get()))
        .bind(&repo.modules)
        .bind(repo.modules_auto.to_string())
        .bind(repo.nginx)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("repository {}", repo.id)));
        }

        sqlx::query("DELETE FROM repository_dependencies WHERE repo_id = $1")
            .bind(repo.id.get())
            .execute(&mut *tx)
            .await?;

        for (position, dependency) in repo.dependencies.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO repository_dependencies (repo_id, dependency_id, position)
                VALUES ($1, $2, $3)
                "#,
            )
            .bind(repo.id.get())
            .bind(dependency.get())
            .bind(position as i32)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn touch_hook_time(&self, id: RepoId, at: DateTime<Utc>) -> DbResult<()> {
        sqlx::query("UPDATE repositories SET hook_time = $2 WHERE id = $1")
            .bind(id.get())
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn insert_branch(&self, new: NewBranch) -> DbResult<Branch> {
        let row = sqlx::query_as::<_, BranchRow>(&format!(
            r#"
            INSERT INTO branches (repo_id, name, sticky, coverage, pull_head_name)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {BRANCH_COLUMNS}
            "#
        ))
        .bind(new.repo_id.get())
        .bind(&new.name)
        .bind(new.sticky)
        .bind(new.coverage)
        .bind(&new.pull_head_name)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| DbError::on_conflict(e, format!("branch {}", new.name)))?;

        Ok(row.into())
    }

    pub async fn branch_by_id(&self, id: BranchId) -> DbResult<Branch> {
        let row = sqlx::query_as::<_, BranchRow>(&format!(
            "SELECT {BRANCH_COLUMNS} FROM branches WHERE id = $1"
        ))
        .bind(id.get())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("branch {}", id)))?;

        Ok(row.into())
    }

    pub async fn branch_by_name(&self, repo_id: RepoId, name: &str) -> DbResult<Option<Branch>> {
        let row = sqlx::query_as::<_, BranchRow>(&format!(
            "SELECT {BRANCH_COLUMNS} FROM branches WHERE repo_id = $1 AND name = $2"
        ))
        .bind(repo_id.get())
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    pub async fn branches_of(&self, repo_ids: &[RepoId]) -> DbResult<Vec<Branch>> {
        let ids: Vec<i64> = repo_ids.iter().map(|r| r.get()).collect();
        let rows = sqlx::query_as::<_, BranchRow>(&format!(
            "SELECT {BRANCH_COLUMNS} FROM branches WHERE repo_id = ANY($1) ORDER BY id DESC"
        ))
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    pub async fn save_branch(&self, branch: &Branch) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE branches
            SET sticky = $2, coverage = $3, pull_head_name = $4, modules = $5, job_timeout = $6
            WHERE id = $1
            "#,
        )
        .bind(branch.id.get())
        .bind(branch.sticky)
        .bind(branch.coverage)
        .bind(&branch.pull_head_name)
        .bind(&branch.modules)
        .bind(branch.job_timeout)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_build(&self, new: NewBuild) -> DbResult<Build> {
        let branch = self.branch_by_id(new.branch_id).await?;

        let mut tx = self.pool.begin().await?;
        let (id,): (i64,) =
            sqlx::query_as("SELECT nextval(pg_get_serial_sequence('builds', 'id'))")
                .fetch_one(&mut *tx)
                .await?;
        let dest = build_dest(BuildId::new(id), branch.nickname(), &new.name);

        let row = sqlx::query_as::<_, BuildRow>(
            r#"
            INSERT INTO builds (
                id, branch_id, repo_id, name, sequence, state, duplicate_of, modules, dest,
                date, author, author_email, committer, committer_email, subject
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(new.branch_id.get())
        .bind(new.repo_id.get())
        .bind(&new.name)
        .bind(new.sequence.unwrap_or(id))
        .bind(new.state.as_str())
        .bind(new.duplicate_of.map(|b| b.get()))
        .bind(&new.modules)
        .bind(&dest)
        .bind(new.date)
        .bind(&new.author)
        .bind(&new.author_email)
        .bind(&new.committer)
        .bind(&new.committer_email)
        .bind(&new.subject)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        row.try_into()
    }

    pub async fn build_by_id(&self, id: BuildId) -> DbResult<Build> {
        let row = sqlx::query_as::<_, BuildRow>("SELECT * FROM builds WHERE id = $1")
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("build {}", id)))?;

        row.try_into()
    }

    pub async fn save_build(&self, build: &Build) -> DbResult<()> {
        if self.write_build(build, None).await? == 0 {
            return Err(DbError::NotFound(format!("build {}", build.id)));
        }
        Ok(())
    }

    /// Save `build` only if its stored state is still `from`.
    pub async fn save_build_from(&self, build: &Build, from: BuildState) -> DbResult<bool> {
        if self.write_build(build, Some(from)).await? == 1 {
            return Ok(true);
        }
        // Tell a missing row apart from a lost race.
        self.build_by_id(build.id).await?;
        Ok(false)
    }

    async fn write_build(&self, build: &Build, from: Option<BuildState>) -> DbResult<u64> {
        let updated = sqlx::query(
            r#"
            UPDATE builds
            SET sequence = $2, state = $3, result = $4, job = $5, job_start = $6, job_end = $7,
                host = $8, port = $9, pid = $10, duplicate_of = $11, server_match = $12,
                modules = $13
            WHERE id = $1 AND ($14::TEXT IS NULL OR state = $14)
            "#,
        )
        .bind(build.id.get())
        .bind(build.sequence)
        .bind(build.state.as_str())
        .bind(build.result.map(|r| r.as_str()))
        .bind(&build.job)
        .bind(build.job_start)
        .bind(build.job_end)
        .bind(&build.host)
        .bind(build.port.map(i32::from))
        .bind(build.pid)
        .bind(build.duplicate_of.map(|b| b.get()))
        .bind(build.server_match.map(|m| m.as_str()))
        .bind(&build.modules)
        .bind(from.map(|s| s.as_str()))
        .execute(&self.pool)
        .await?;

        Ok(updated.rows_affected())
    }

    pub async fn find_builds(&self, filter: &BuildFilter) -> DbResult<Vec<Build>> {
        let mut qb = QueryBuilder::<Postgres>::new(
            "SELECT b.* FROM builds b JOIN branches br ON br.id = b.branch_id WHERE TRUE",
        );
        push_conditions(&mut qb, filter);

        qb.push(match filter.order {
            BuildOrder::SequenceAsc => " ORDER BY b.sequence ASC, b.id ASC",
            BuildOrder::SequenceDesc => " ORDER BY b.sequence DESC, b.id DESC",
            BuildOrder::IdAsc => " ORDER BY b.id ASC",
            BuildOrder::IdDesc => " ORDER BY b.id DESC",
        });
        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ").push_bind(limit as i64);
        }
        if filter.offset > 0 {
            qb.push(" OFFSET ").push_bind(filter.offset as i64);
        }

        let rows = qb.build_query_as::<BuildRow>().fetch_all(&self.pool).await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    pub async fn count(&self, filter: &BuildFilter) -> DbResult<usize> {
        let mut qb = QueryBuilder::<Postgres>::new(
            "SELECT COUNT(*) FROM builds b JOIN branches br ON br.id = b.branch_id WHERE TRUE",
        );
        push_conditions(&mut qb, filter);

        let count: i64 = qb.build_query_scalar().fetch_one(&self.pool).await?;
        Ok(count.max(0) as usize)
    }

    pub async fn insert_build_log(
        &self,
        build_id: BuildId,
        func: &str,
        message: &str,
    ) -> DbResult<()> {
        sqlx::query("INSERT INTO build_logs (build_id, func, message) VALUES ($1, $2, $3)")
            .bind(build_id.get())
            .bind(func)
            .bind(message)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn logs_of(&self, build_id: BuildId) -> DbResult<Vec<BuildLogEntry>> {
        let rows = sqlx::query_as::<_, BuildLogRow>(
            "SELECT build_id, func, message, created_at FROM build_logs WHERE build_id = $1 ORDER BY id",
        )
        .bind(build_id.get())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}

/// Append the `WHERE` conditions of a build filter.
fn push_conditions(qb: &mut QueryBuilder<'_, Postgres>, filter: &BuildFilter) {
    if let Some(ids) = &filter.ids {
        let ids: Vec<i64> = ids.iter().map(|b| b.get()).collect();
        qb.push(" AND b.id = ANY(").push_bind(ids).push(")");
    }
    if let Some(repo_ids) = &filter.repo_ids {
        let ids: Vec<i64> = repo_ids.iter().map(|r| r.get()).collect();
        qb.push(" AND b.repo_id = ANY(").push_bind(ids).push(")");
    }
    if let Some(branch_id) = filter.branch_id {
        qb.push(" AND b.branch_id = ").push_bind(branch_id.get());
    }
    if let Some(name) = &filter.name {
        qb.push(" AND b.name = ").push_bind(name.clone());
    }
    if let Some(states) = &filter.states {
        let states: Vec<String> = states.iter().map(|s| s.as_str().to_string()).collect();
        qb.push(" AND b.state = ANY(").push_bind(states).push(")");
    }
    if let Some(host) = &filter.host {
        qb.push(" AND b.host = ").push_bind(host.clone());
    }
    if let Some(sticky) = filter.sticky {
        qb.push(" AND br.sticky = ").push_bind(sticky);
    }
    match filter.has_duplicate_link {
        Some(true) => {
            qb.push(" AND b.duplicate_of IS NOT NULL");
        }
        Some(false) => {
            qb.push(" AND b.duplicate_of IS NULL");
        }
        None => {}
    }
    if let Some(reference) = filter.duplicate_of {
        qb.push(" AND b.duplicate_of = ").push_bind(reference.get());
    }
    if let Some(result) = filter.result_not {
        qb.push(" AND (b.result IS NULL OR b.result <> ")
            .push_bind(result.as_str())
            .push(")");
    }
    if let Some(dests) = &filter.dests {
        qb.push(" AND b.dest = ANY(").push_bind(dests.clone()).push(")");
    }
}

#[async_trait]
impl Store for PgStore {
    async fn create_repository(&self, new: NewRepository) -> Result<Repository> {
        Ok(self.insert_repository(new).await?)
    }

    async fn get_repository(&self, id: RepoId) -> Result<Repository> {
        Ok(self.repository_by_id(id).await?)
    }

    async fn find_repository(&self, name: &str) -> Result<Option<Repository>> {
        Ok(self.repository_by_name(name).await?)
    }

    async fn list_repositories(&self) -> Result<Vec<Repository>> {
        Ok(self.all_repositories().await?)
    }

    async fn update_repository(&self, repo: &Repository) -> Result<()> {
        Ok(self.save_repository(repo).await?)
    }

    async fn set_hook_time(&self, id: RepoId, at: DateTime<Utc>) -> Result<()> {
        Ok(self.touch_hook_time(id, at).await?)
    }

    async fn create_branch(&self, new: NewBranch) -> Result<Branch> {
        Ok(self.insert_branch(new).await?)
    }

    async fn get_branch(&self, id: BranchId) -> Result<Branch> {
        Ok(self.branch_by_id(id).await?)
    }

    async fn find_branch(&self, repo_id: RepoId, name: &str) -> Result<Option<Branch>> {
        Ok(self.branch_by_name(repo_id, name).await?)
    }

    async fn list_branches(&self, repo_ids: &[RepoId]) -> Result<Vec<Branch>> {
        Ok(self.branches_of(repo_ids).await?)
    }

    async fn update_branch(&self, branch: &Branch) -> Result<()> {
        Ok(self.save_branch(branch).await?)
    }

    async fn create_build(&self, new: NewBuild) -> Result<Build> {
        Ok(self.insert_build(new).await?)
    }

    async fn get_build(&self, id: BuildId) -> Result<Build> {
        Ok(self.build_by_id(id).await?)
    }

    async fn update_build(&self, build: &Build) -> Result<()> {
        Ok(self.save_build(build).await?)
    }

    async fn transition_build(&self, build: &Build, from: BuildState) -> Result<bool> {
        Ok(self.save_build_from(build, from).await?)
    }

    async fn search_builds(&self, filter: &BuildFilter) -> Result<Vec<Build>> {
        Ok(self.find_builds(filter).await?)
    }

    async fn count_builds(&self, filter: &BuildFilter) -> Result<usize> {
        Ok(self.count(filter).await?)
    }

    async fn append_build_log(&self, build_id: BuildId, func: &str, message: &str) -> Result<()> {
        Ok(self.insert_build_log(build_id, func, message).await?)
    }

    async fn build_logs(&self, build_id: BuildId) -> Result<Vec<BuildLogEntry>> {
        Ok(self.logs_of(build_id).await?)
    }
}
