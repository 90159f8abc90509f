//! Blob object store abstraction and backends for wharf.
//!
//! This crate provides:
//! - Content-addressed object storage behind an opaque-key interface
//! - Backends: local filesystem and S3-compatible services

pub mod backends;
pub mod error;
pub mod traits;

pub use backends::{filesystem::FilesystemBackend, s3::S3Backend};
pub use error::{StorageError, StorageResult};
pub use traits::{ByteStream, ObjectMeta, ObjectStore};

use std::sync::Arc;
use wharf_core::config::DfsConfig;

/// Create an object store from configuration.
pub async fn from_config(config: &DfsConfig) -> StorageResult<Arc<dyn ObjectStore>> {
    match config {
        DfsConfig::Filesystem { path } => {
            let backend = FilesystemBackend::new(path).await?;
            Ok(Arc::new(backend))
        }
        DfsConfig::S3 {
            endpoint,
            access_key,
            secret_key,
            bucket,
            chunk_size: _,
        } => {
            if access_key.is_empty() || secret_key.is_empty() {
                return Err(StorageError::Config(
                    "s3 config requires both access_key and secret_key".to_string(),
                ));
            }
            let backend = S3Backend::new(endpoint, access_key, secret_key, bucket);
            Ok(Arc::new(backend))
        }
    }
}
