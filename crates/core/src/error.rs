//! Core error types.

use thiserror::Error;

/// Errors produced by core domain types.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    #[error("invalid reference: {0}")]
    InvalidReference(String),

    #[error("invalid namespace: {0}")]
    InvalidNamespace(String),

    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("token error: {0}")]
    Token(String),

    #[error("password error: {0}")]
    Password(String),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, Error>;
