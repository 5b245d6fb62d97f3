//! Repository error type shared by all persistence backends

use thiserror::Error;

/// Result type for repository operations
pub type RepositoryResult<T> = std::result::Result<T, RepositoryError>;

/// Categorized persistence error
///
/// Call sites decide failure semantics from the category: `Unavailable`
/// drives fail-closed policy decisions, `AlreadyUsed` maps to the 409
/// capability-token response, and everything else surfaces as an internal
/// error with detail kept server-side.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// Row not found
    #[error("not found")]
    NotFound,

    /// Unique or referential constraint violation
    #[error("conflict: {0}")]
    Conflict(String),

    /// Single-use token was already consumed
    #[error("token already used")]
    AlreadyUsed,

    /// Store unreachable (connection, pool, timeout)
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Any other backend failure
    #[error("store error: {0}")]
    Backend(String),
}

impl From<sqlx::Error> for RepositoryError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => Self::NotFound,
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                Self::Unavailable(err.to_string())
            }
            sqlx::Error::Io(_) => Self::Unavailable(err.to_string()),
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                Self::Conflict(db.to_string())
            }
            sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
                Self::Conflict(db.to_string())
            }
            _ => Self::Backend(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for RepositoryError {
    fn from(err: serde_json::Error) -> Self {
        Self::Backend(format!("serialization: {}", err))
    }
}
