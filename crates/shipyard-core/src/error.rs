//! Error types for shipyard.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    #[error("vcs error: {0}")]
    Vcs(String),

    #[error("hosting api error: {0}")]
    Hosting(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
