use serde::{Deserialize, Serialize};

use super::ConfigError;

/// Provider credential encryption settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CredentialsConfig {
    /// Where the 32-byte AES-256-GCM key comes from.
    #[serde(default)]
    pub key_provider: KeyProviderConfig,
}

/// Source of the credential encryption key.
///
/// Keys must decode to exactly 32 bytes; anything else is rejected at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum KeyProviderConfig {
    /// Read the key from an environment variable (base64, or 32 raw bytes).
    Env {
        #[serde(default = "default_key_var")]
        var: String,
    },
    /// Key given inline in the configuration file (base64, or 32 raw bytes).
    /// Intended for tests and local development.
    Static { key: String },
}

impl Default for KeyProviderConfig {
    fn default() -> Self {
        KeyProviderConfig::Env {
            var: default_key_var(),
        }
    }
}

impl CredentialsConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match &self.key_provider {
            KeyProviderConfig::Env { var } if var.is_empty() => Err(ConfigError::Validation(
                "credentials.key_provider.var cannot be empty".into(),
            )),
            KeyProviderConfig::Static { key } if key.is_empty() => Err(ConfigError::Validation(
                "credentials.key_provider.key cannot be empty".into(),
            )),
            _ => Ok(()),
        }
    }
}

fn default_key_var() -> String {
    "ENCRYPTION_KEY".to_string()
}
