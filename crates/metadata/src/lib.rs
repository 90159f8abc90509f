//! Metadata store abstraction and implementations for wharf.
//!
//! This crate provides the registry's control-plane data model:
//! - Users and login sessions
//! - Manifests, configs, and tag references
//! - Layers and in-flight blob fragments
//! - Explicit transaction handles for the upload commit path

pub mod error;
pub mod models;
pub mod postgres;
pub mod store;

pub use error::{MetadataError, MetadataResult};
pub use postgres::PostgresStore;
pub use store::{MetadataStore, SqliteStore, StoreTxn};

use std::sync::Arc;
use wharf_core::config::{DatabaseConfig, DatabaseKind};

/// Create a metadata store from configuration.
pub async fn from_config(config: &DatabaseConfig) -> MetadataResult<Arc<dyn MetadataStore>> {
    config.validate().map_err(MetadataError::Config)?;

    match config.kind {
        DatabaseKind::Sqlite => {
            let store = SqliteStore::new(&config.name).await?;
            Ok(Arc::new(store) as Arc<dyn MetadataStore>)
        }
        DatabaseKind::Postgres => {
            tracing::info!(
                host = %config.host,
                database = %config.name,
                "Connecting to PostgreSQL"
            );
            let store = PostgresStore::connect(config).await?;
            Ok(Arc::new(store) as Arc<dyn MetadataStore>)
        }
    }
}
