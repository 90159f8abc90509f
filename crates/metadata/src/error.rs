//! Metadata store error types.

use thiserror::Error;

/// Metadata store operation errors.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type for metadata operations.
pub type MetadataResult<T> = std::result::Result<T, MetadataError>;

/// Map a sqlx error to the store taxonomy, turning unique-key violations
/// into `Conflict` so handlers can answer 409 without inspecting SQLSTATEs.
pub(crate) fn map_write_err(err: sqlx::Error, what: &str) -> MetadataError {
    if let sqlx::Error::Database(db_err) = &err
        && matches!(db_err.kind(), sqlx::error::ErrorKind::UniqueViolation)
    {
        return MetadataError::Conflict(what.to_string());
    }
    MetadataError::Database(err)
}
