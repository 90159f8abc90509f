//! Application state shared across handlers.

use crate::uploads::UploadManager;
use std::sync::Arc;
use wharf_core::config::AppConfig;
use wharf_core::token::TokenSigner;
use wharf_metadata::MetadataStore;
use wharf_storage::ObjectStore;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<AppConfig>,
    /// Blob object store.
    pub storage: Arc<dyn ObjectStore>,
    /// Metadata store.
    pub metadata: Arc<dyn MetadataStore>,
    /// Upload transaction manager.
    pub uploads: Arc<UploadManager>,
    /// Session token signer.
    pub signer: TokenSigner,
}

impl AppState {
    /// Create a new application state.
    ///
    /// # Panics
    ///
    /// Panics if the configuration is invalid; `main` validates before
    /// constructing state, so this only fires on programmer error.
    pub fn new(
        config: AppConfig,
        storage: Arc<dyn ObjectStore>,
        metadata: Arc<dyn MetadataStore>,
    ) -> Self {
        if let Err(error) = config.validate() {
            panic!("invalid configuration: {error}");
        }

        let signer = TokenSigner::new(&config.registry.signing_secret);

        Self {
            config: Arc::new(config),
            storage,
            metadata,
            uploads: Arc::new(UploadManager::new()),
            signer,
        }
    }
}
