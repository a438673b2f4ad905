//! Record store for the shipyard build orchestrator.
//!
//! Provides the PostgreSQL store, an in-memory store and the admin
//! connection that manages per-build databases.

pub mod admin;
pub mod error;
pub mod memory;
pub mod pg;
pub mod rows;

pub use admin::PgDatabaseAdmin;
pub use error::{DbError, DbResult};
pub use memory::MemoryStore;
pub use pg::PgStore;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Create a new database connection pool.
pub async fn create_pool(database_url: &str) -> DbResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Run database migrations.
pub async fn run_migrations(pool: &PgPool) -> DbResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
