use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Errors loading or validating configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("configuration errors:\n  - {}", .0.join("\n  - "))]
    Invalid(Vec<String>),
}

/// Global configuration for the gateway
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// HTTP listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Upstream control plane connection
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Service account used to authenticate against the upstream
    #[serde(default)]
    pub service_account: ServiceAccountConfig,

    /// Frontend bundle served on every non-API path
    #[serde(default)]
    pub frontend: FrontendConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Listen address (default: 127.0.0.1:12000)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Maximum time to wait for in-flight requests on shutdown
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

impl ServerConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn bind_addr(&self) -> Result<SocketAddr, String> {
        self.bind
            .parse()
            .map_err(|e| format!("invalid bind address '{}': {}", self.bind, e))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct UpstreamConfig {
    /// Omni endpoint, e.g. https://omni.example.com or grpc://127.0.0.1:8080
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Skip server certificate verification for https endpoints
    #[serde(default)]
    pub insecure_skip_tls_verify: bool,

    /// Extra CA bundle (PEM) trusted in addition to the webpki roots
    pub ca_cert: Option<PathBuf>,

    /// Serialized FileDescriptorSet describing the services exposed under /api
    pub descriptor_set: Option<PathBuf>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            insecure_skip_tls_verify: false,
            ca_cert: None,
            descriptor_set: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceAccountConfig {
    /// Identity name created on bootstrap
    #[serde(default = "default_service_account_name")]
    pub name: String,

    /// Role granted to a bootstrapped identity
    #[serde(default = "default_service_account_role")]
    pub role: String,

    /// Validity window of a generated key
    #[serde(default = "default_key_lifetime_days")]
    pub key_lifetime_days: u32,

    /// Pre-encoded credential; when set, bootstrap is skipped
    ///
    /// Normally sourced from the environment rather than the config file.
    pub key: Option<String>,

    /// Bearer token for the administrative bootstrap connection
    pub admin_token: Option<String>,
}

impl ServiceAccountConfig {
    pub fn key_lifetime(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.key_lifetime_days))
    }
}

impl Default for ServiceAccountConfig {
    fn default() -> Self {
        Self {
            name: default_service_account_name(),
            role: default_service_account_role(),
            key_lifetime_days: default_key_lifetime_days(),
            key: None,
            admin_token: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct FrontendConfig {
    /// Directory holding the built bundle (must contain index.html)
    #[serde(default = "default_dist_dir")]
    pub dist_dir: PathBuf,

    /// max-age for fingerprinted assets
    #[serde(default = "default_max_age")]
    pub max_age_secs: u64,

    /// Load the bundle into memory at startup instead of reading it per request
    #[serde(default = "default_preload")]
    pub preload: bool,
}

impl Default for FrontendConfig {
    fn default() -> Self {
        Self {
            dist_dir: default_dist_dir(),
            max_age_secs: default_max_age(),
            preload: default_preload(),
        }
    }
}

// Default value functions
fn default_bind_address() -> String {
    "127.0.0.1:12000".to_string()
}

fn default_shutdown_timeout() -> u64 {
    5
}

fn default_endpoint() -> String {
    "https://localhost:8099".to_string()
}

fn default_service_account_name() -> String {
    "omni-inspector".to_string()
}

fn default_service_account_role() -> String {
    "Admin".to_string()
}

fn default_key_lifetime_days() -> u32 {
    365
}

fn default_dist_dir() -> PathBuf {
    PathBuf::from("frontend/dist")
}

fn default_max_age() -> u64 {
    7200 // 2 hours
}

fn default_preload() -> bool {
    true
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if let Err(e) = self.server.bind_addr() {
            errors.push(e);
        }

        if self.upstream.endpoint.trim().is_empty() {
            errors.push("upstream 'endpoint' must not be empty".to_string());
        }

        if self.service_account.name.trim().is_empty() {
            errors.push("service_account 'name' must not be empty".to_string());
        }

        if self.service_account.key_lifetime_days == 0 {
            errors.push("service_account 'key_lifetime_days' must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            return Err(ConfigError::Invalid(errors));
        }

        Ok(())
    }
}
