//! Per-build PostgreSQL databases.

use async_trait::async_trait;
use shipyard_core::{DatabaseAdmin, Error, Result};
use sqlx::PgPool;
use tracing::debug;

use crate::{DbError, DbResult};

/// Creates and drops the databases owned by builds.
///
/// Uses a maintenance connection, typically to the `postgres` database.
#[derive(Clone)]
pub struct PgDatabaseAdmin {
    pool: PgPool,
}

impl PgDatabaseAdmin {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Quote a database name, rejecting anything outside `[a-z0-9_-]`.
fn quoted(name: &str) -> Result<String> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
    if !valid {
        return Err(Error::InvalidInput(format!("invalid database name: {}", name)));
    }
    Ok(format!("\"{}\"", name))
}

impl PgDatabaseAdmin {
    async fn execute(&self, statement: String) -> DbResult<()> {
        sqlx::query(&statement).execute(&self.pool).await?;
        Ok(())
    }

    async fn owned_databases(&self) -> DbResult<Vec<String>> {
        let names: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT datname FROM pg_database
            WHERE pg_get_userbyid(datdba) = current_user
            ORDER BY datname
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(names.into_iter().map(|(name,)| name).collect())
    }
}

#[async_trait]
impl DatabaseAdmin for PgDatabaseAdmin {
    async fn create_database(&self, name: &str) -> Result<()> {
        let ident = quoted(name)?;
        debug!(database = %name, "Creating database");
        self.execute(format!("DROP DATABASE IF EXISTS {}", ident))
            .await
            .map_err(Error::from)?;
        self.execute(format!("CREATE DATABASE {}", ident))
            .await
            .map_err(|e| match e {
                DbError::Database(err) => Error::from(DbError::on_conflict(err, name)),
                other => Error::from(other),
            })
    }

    async fn drop_database(&self, name: &str) -> Result<()> {
        let ident = quoted(name)?;
        debug!(database = %name, "Dropping database");
        Ok(self.execute(format!("DROP DATABASE IF EXISTS {}", ident)).await?)
    }

    async fn list_databases(&self) -> Result<Vec<String>> {
        Ok(self.owned_databases().await?)
    }
}
