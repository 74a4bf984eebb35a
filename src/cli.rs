//! Command-line flags and environment overrides
//!
//! Everything read from the process (flags, environment) is folded into a single
//! [`Config`] here; no other module looks at process-wide state.

use clap::Parser;
use std::path::PathBuf;

use crate::config::{Config, ConfigError};

/// Environment variables that may carry a pre-encoded service account, in lookup order
pub const SERVICE_ACCOUNT_ENV_VARS: [&str; 2] =
    ["OMNI_SERVICE_ACCOUNT_KEY", "SIDERO_SERVICE_ACCOUNT_KEY"];

/// Environment variable carrying the bootstrap admin token
pub const ADMIN_TOKEN_ENV_VAR: &str = "OMNI_ADMIN_TOKEN";

#[derive(Debug, Parser)]
#[command(name = "omni-inspector")]
#[command(about = "Serve the Omni inspector UI and its JSON API gateway")]
#[command(version)]
pub struct Cli {
    /// Omni endpoint
    #[arg(long, value_name = "URL")]
    pub endpoint: Option<String>,

    /// Optional TOML configuration file
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Skip TLS certificate verification for https endpoints
    #[arg(long)]
    pub insecure_skip_tls_verify: bool,

    /// FileDescriptorSet describing the services exposed under /api
    #[arg(long, value_name = "PATH")]
    pub descriptor_set: Option<PathBuf>,

    /// Directory holding the built frontend bundle
    #[arg(long, value_name = "PATH")]
    pub dist_dir: Option<PathBuf>,

    /// Listen address for the HTTP surface
    #[arg(long, value_name = "ADDR")]
    pub bind: Option<String>,

    /// Bearer token for the administrative bootstrap connection
    #[arg(long, env = ADMIN_TOKEN_ENV_VAR, hide_env_values = true)]
    pub admin_token: Option<String>,
}

impl Cli {
    /// Build the effective configuration: file, then environment, then flags
    pub fn into_config(
        self,
        env_credential: Option<(&'static str, String)>,
    ) -> Result<Config, ConfigError> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };

        if let Some((_, value)) = env_credential {
            config.service_account.key = Some(value);
        }

        if let Some(endpoint) = self.endpoint {
            config.upstream.endpoint = endpoint;
        }
        if self.insecure_skip_tls_verify {
            config.upstream.insecure_skip_tls_verify = true;
        }
        if let Some(path) = self.descriptor_set {
            config.upstream.descriptor_set = Some(path);
        }
        if let Some(dir) = self.dist_dir {
            config.frontend.dist_dir = dir;
        }
        if let Some(bind) = self.bind {
            config.server.bind = bind;
        }
        if let Some(token) = self.admin_token {
            config.service_account.admin_token = Some(token);
        }

        config.validate()?;
        Ok(config)
    }
}

/// Find a pre-encoded service account in the environment
///
/// Returns the variable it was found in together with its value.
pub fn service_account_from_env() -> Option<(&'static str, String)> {
    SERVICE_ACCOUNT_ENV_VARS.iter().find_map(|key| {
        std::env::var(key)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(|value| (*key, value))
    })
}
