//! wharf registry server binary.

use anyhow::{Context, Result};
use clap::Parser;
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use wharf_core::AppConfig;
use wharf_server::{AppState, create_router};

/// Name of the configuration file inside the config directory.
const CONFIG_FILE: &str = "wharf.toml";

/// wharf - an OCI/Docker Registry V2 server
#[derive(Parser, Debug)]
#[command(name = "wharfd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Directory containing wharf.toml
    #[arg(default_value = "./")]
    config_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("wharf v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration: wharf.toml overlaid with WHARF_ env vars.
    let config_path = args.config_dir.join(CONFIG_FILE);
    let mut figment = Figment::new();
    if config_path.exists() {
        tracing::info!(config_path = %config_path.display(), "Loading configuration from file");
        figment = figment.merge(Toml::file(&config_path));
    } else {
        tracing::info!(
            config_path = %config_path.display(),
            "No config file found, using environment variables only"
        );
    }

    let config: AppConfig = figment
        .merge(Env::prefixed("WHARF_").split("__"))
        .extract()
        .context("failed to load configuration")?;

    config
        .validate()
        .map_err(|problems| anyhow::anyhow!(problems))
        .context("invalid configuration")?;

    if config.registry.tls.is_some() {
        tracing::warn!(
            "registry.tls is configured but native TLS termination is not built in; \
             terminate TLS at the fronting proxy"
        );
    }

    // Initialize the blob object store and verify connectivity before
    // accepting requests.
    let storage = wharf_storage::from_config(&config.dfs)
        .await
        .context("failed to initialize object store")?;
    storage
        .health_check()
        .await
        .context("object store health check failed")?;
    tracing::info!(backend = storage.backend_name(), "Object store initialized");

    // Initialize the metadata store.
    let metadata = wharf_metadata::from_config(&config.database)
        .await
        .context("failed to initialize metadata store")?;
    metadata
        .health_check()
        .await
        .context("metadata store health check failed")?;
    tracing::info!("Metadata store initialized");

    let address = config.registry.address();
    let state = AppState::new(config, storage, metadata);

    // Upload sessions carry a 30-minute deadline; the sweeper aborts the
    // stragglers.
    let _sweeper = Arc::clone(&state.uploads).spawn_sweeper();
    tracing::info!("Upload session sweeper spawned");

    let router = create_router(state);

    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("failed to bind {address}"))?;
    tracing::info!(address = %address, "Registry listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to install ctrl-c handler");
        return;
    }
    tracing::info!("Shutdown signal received");
}
