//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level application configuration.
///
/// Loaded by the server binary from `wharf.toml` merged with `WHARF_`
/// environment variables; `validate()` runs before anything else starts.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppConfig {
    pub registry: RegistryConfig,
    pub database: DatabaseConfig,
    /// Blob object store. Defaults to a local filesystem directory.
    #[serde(default)]
    pub dfs: DfsConfig,
    /// Email delivery hook point (verification, password reset). Optional;
    /// nothing in the core sends mail.
    #[serde(default)]
    pub email: Option<EmailConfig>,
    /// OAuth hook point. Optional; the core only exposes the upsert path.
    #[serde(default)]
    pub oauth: Option<OauthConfig>,
    pub environment: Environment,
    pub web_app_url: String,
    #[serde(default)]
    pub debug: bool,
}

impl AppConfig {
    /// Validate required fields, collecting every failure.
    pub fn validate(&self) -> Result<(), String> {
        let mut problems: Vec<String> = Vec::new();

        if self.registry.signing_secret.is_empty() {
            problems.push("registry.signing_secret must not be empty".to_string());
        }
        if self.registry.host.is_empty() {
            problems.push("registry.host must not be empty".to_string());
        }
        if self.registry.fqdn.is_empty() {
            problems.push("registry.fqdn must not be empty".to_string());
        }
        if let Err(e) = self.database.validate() {
            problems.push(e);
        }
        if self.web_app_url.is_empty() {
            problems.push("web_app_url must not be empty".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems.join("; "))
        }
    }

    /// Create a test configuration backed by SQLite and local storage.
    ///
    /// **For testing only.**
    pub fn for_testing() -> Self {
        Self {
            registry: RegistryConfig {
                host: "127.0.0.1".to_string(),
                port: 5000,
                fqdn: "registry.test".to_string(),
                signing_secret: "test-signing-secret".to_string(),
                tls: None,
            },
            database: DatabaseConfig {
                kind: DatabaseKind::Sqlite,
                host: String::new(),
                port: 0,
                username: String::new(),
                password: String::new(),
                name: ":memory:".to_string(),
                max_connections: default_max_connections(),
                statement_timeout_ms: default_statement_timeout_ms(),
            },
            dfs: DfsConfig::default(),
            email: None,
            oauth: None,
            environment: Environment::Ci,
            web_app_url: "http://localhost:3000".to_string(),
            debug: false,
        }
    }
}

/// Registry listener configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegistryConfig {
    pub host: String,
    pub port: u16,
    /// Public name of the registry, used in externally-visible URLs.
    pub fqdn: String,
    /// HMAC secret for session tokens. Required.
    pub signing_secret: String,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

impl RegistryConfig {
    /// The socket address to bind.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// TLS key material, referenced by path.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TlsConfig {
    pub private_key: PathBuf,
    pub certificate: PathBuf,
}

/// Metadata database backend kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseKind {
    /// PostgreSQL (production).
    Postgres,
    /// SQLite (testing and small deployments).
    Sqlite,
}

/// Metadata database configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub kind: DatabaseKind,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Database name for PostgreSQL; file path for SQLite.
    pub name: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Per-statement timeout. Enforced server-side on PostgreSQL; advisory
    /// on SQLite.
    #[serde(default = "default_statement_timeout_ms")]
    pub statement_timeout_ms: u64,
}

impl DatabaseConfig {
    /// Validate backend-specific required fields.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("database.name must not be empty".to_string());
        }
        if self.kind == DatabaseKind::Postgres {
            let mut missing = Vec::new();
            if self.host.is_empty() {
                missing.push("database.host");
            }
            if self.port == 0 {
                missing.push("database.port");
            }
            if self.username.is_empty() {
                missing.push("database.username");
            }
            if self.password.is_empty() {
                missing.push("database.password");
            }
            if !missing.is_empty() {
                return Err(format!(
                    "postgres config requires: {}",
                    missing.join(", ")
                ));
            }
        }
        Ok(())
    }

    /// PostgreSQL connection URL.
    pub fn postgres_url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.username, self.password, self.host, self.port, self.name
        )
    }
}

fn default_max_connections() -> u32 {
    16
}

fn default_statement_timeout_ms() -> u64 {
    30_000
}

/// Blob object store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DfsConfig {
    /// Local filesystem storage.
    Filesystem { path: PathBuf },
    /// S3-compatible storage (MinIO, SeaweedFS, AWS).
    S3 {
        endpoint: String,
        access_key: String,
        secret_key: String,
        bucket: String,
        #[serde(default = "default_chunk_size")]
        chunk_size: u64,
    },
}

impl Default for DfsConfig {
    fn default() -> Self {
        Self::Filesystem {
            path: PathBuf::from("./data/blobs"),
        }
    }
}

fn default_chunk_size() -> u64 {
    16 * 1024 * 1024
}

/// Email delivery configuration (hook point only).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EmailConfig {
    pub api_key: String,
    pub send_as: String,
}

/// OAuth provider configuration (hook point only).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OauthConfig {
    #[serde(default)]
    pub github: Option<GithubOauthConfig>,
}

/// GitHub OAuth application credentials.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GithubOauthConfig {
    pub client_id: String,
    pub client_secret: String,
}

/// Deployment environment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Environment {
    Production,
    Staging,
    Local,
    Ci,
}
