//! Database error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate: {0}")]
    Duplicate(String),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

pub type DbResult<T> = std::result::Result<T, DbError>;

impl DbError {
    /// Map unique violations to `Duplicate`, keep everything else.
    pub(crate) fn on_conflict(err: sqlx::Error, what: impl Into<String>) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                DbError::Duplicate(what.into())
            }
            _ => DbError::Database(err),
        }
    }
}

impl From<DbError> for shipyard_core::Error {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound(what) => shipyard_core::Error::NotFound(what),
            DbError::Duplicate(what) => shipyard_core::Error::Conflict(what),
            DbError::InvalidData(msg) => shipyard_core::Error::InvalidInput(msg),
            other => shipyard_core::Error::Store(other.to_string()),
        }
    }
}
