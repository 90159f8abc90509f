//! HTTP API server for the wharf container registry.
//!
//! This crate provides the Registry V2 protocol surface:
//! - Blob upload lifecycles (monolithic, chunked, resumable)
//! - Manifest push/pull with tag and digest resolution
//! - Catalog and tag discovery
//! - Account routes and the token/ACL middleware
//! - The upload transaction manager and its deadline sweeper

pub mod auth;
pub mod error;
pub mod handlers;
pub mod routes;
pub mod state;
pub mod uploads;

pub use error::{ApiResult, ErrorCode, RegistryError};
pub use routes::create_router;
pub use state::AppState;
pub use uploads::UploadManager;
