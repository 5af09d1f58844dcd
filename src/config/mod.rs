//! Configuration module for the gateway.
//!
//! The gateway is configured via a TOML file, with support for environment
//! variable interpolation using `${VAR_NAME}` syntax.
//!
//! # Example
//!
//! ```toml
//! [auth.jwt]
//! secret = "${JWT_SECRET_KEY}"
//!
//! [database]
//! type = "sqlite"
//! path = "chatgate.db"
//!
//! [limits.rate_limit]
//! requests_per_second = 100
//! burst = 10
//! ```

mod auth;
mod credentials;
mod database;
mod limits;
mod observability;
mod server;

use std::path::Path;

pub use auth::*;
pub use credentials::*;
pub use database::*;
pub use limits::*;
pub use observability::*;
use serde::{Deserialize, Serialize};
pub use server::*;

use crate::pricing::PricingConfig;

/// Root configuration for the gateway.
///
/// Every section is optional except `auth.jwt.secret`, which has no safe
/// default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    /// HTTP server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration for quotas, usage records and credentials.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Bearer token and anti-forgery configuration.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Rate limits and quota defaults.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Per-model price overrides used for cost calculation.
    #[serde(default)]
    pub pricing: PricingConfig,

    /// Provider credential encryption.
    #[serde(default)]
    pub credentials: CredentialsConfig,

    /// Observability configuration (logging, metrics).
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl GatewayConfig {
    /// Load configuration from a TOML file.
    ///
    /// Environment variables in the format `${VAR_NAME}` are expanded.
    /// Missing variables cause an error.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(e, path.as_ref().to_path_buf()))?;

        Self::from_str(&contents)
    }

    /// Parse configuration from a TOML string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(contents: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(contents)?;
        let config: GatewayConfig = toml::from_str(&expanded).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration for consistency and completeness.
    fn validate(&self) -> Result<(), ConfigError> {
        self.server.cors.validate()?;
        self.database.validate()?;
        self.auth.validate()?;
        self.limits.validate()?;
        self.credentials.validate()?;
        self.pricing.validate().map_err(ConfigError::Validation)?;
        self.observability.validate()?;

        if self.limits.quota.enabled && self.database.is_none() {
            tracing::warn!(
                "Quota enforcement is enabled but no database is configured; \
                 quota admission and usage recording are disabled"
            );
        }

        Ok(())
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {1}: {0}")]
    Io(std::io::Error, std::path::PathBuf),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),

    #[error("Configuration validation error: {0}")]
    Validation(String),
}

/// Expand `${VAR}` references. References after a `#` on the same line are
/// left untouched so commented-out settings never require their variables.
fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let re = regex::Regex::new(r"\$\{([^}]+)\}")
        .map_err(|e| ConfigError::Validation(e.to_string()))?;
    let mut result = String::with_capacity(input.len());

    for line in input.lines() {
        let comment_pos = line.find('#');
        let mut last_end = 0;

        for cap in re.captures_iter(line) {
            let Some(whole) = cap.get(0) else { continue };

            if let Some(pos) = comment_pos
                && whole.start() >= pos
            {
                continue;
            }

            result.push_str(&line[last_end..whole.start()]);

            let var_name = &cap[1];
            let value = std::env::var(var_name)
                .map_err(|_| ConfigError::EnvVarNotFound(var_name.to_string()))?;
            result.push_str(&value);

            last_end = whole.end();
        }

        result.push_str(&line[last_end..]);
        result.push('\n');
    }

    if !input.ends_with('\n') && result.ends_with('\n') {
        result.pop();
    }

    Ok(result)
}
