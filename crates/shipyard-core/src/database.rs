//! Ephemeral per-build databases.

use async_trait::async_trait;

use crate::Result;

/// Administration of the databases builds test against.
#[async_trait]
pub trait DatabaseAdmin: Send + Sync {
    /// Create an empty database, dropping any previous one with that name.
    async fn create_database(&self, name: &str) -> Result<()>;

    /// Drop a database if it exists.
    async fn drop_database(&self, name: &str) -> Result<()>;

    /// Databases owned by the orchestrator's role.
    async fn list_databases(&self) -> Result<Vec<String>>;
}
