//! Key management for provider credential encryption.
//!
//! The credential cipher never reads its key directly. A [`KeyProvider`] is
//! chosen at startup from configuration and must hand back exactly 32 bytes:
//! - Environment variable (default, `ENCRYPTION_KEY`)
//! - Static key from the config file (for testing and local development)
//!
//! Keys are accepted as standard base64 or as 32 raw bytes. Keys of any other
//! length are rejected, never padded or truncated.

mod cipher;

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
pub use cipher::{CipherError, CredentialCipher};
use thiserror::Error;
use zeroize::Zeroizing;

use crate::config::KeyProviderConfig;

/// Length in bytes of an AES-256 key.
pub const KEY_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("Secret not found: {0}")]
    NotFound(String),

    #[error("Encryption key must be exactly {expected} bytes, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type SecretResult<T> = Result<T, SecretError>;

/// A 256-bit symmetric key. Zeroed on drop.
#[derive(Clone)]
pub struct EncryptionKey(Zeroizing<[u8; KEY_LEN]>);

impl EncryptionKey {
    /// Generate a fresh random key.
    pub fn generate() -> Self {
        use rand::RngCore;

        let mut bytes = Zeroizing::new([0u8; KEY_LEN]);
        rand::rngs::OsRng.fill_bytes(bytes.as_mut());
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Standard base64 form, as accepted by the key providers.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0.as_ref())
    }

    /// Parse a configured key: base64 that decodes to 32 bytes, or exactly 32 raw bytes.
    pub fn parse(value: &str) -> SecretResult<Self> {
        let trimmed = value.trim();
        if let Ok(decoded) = STANDARD.decode(trimmed) {
            let decoded = Zeroizing::new(decoded);
            if decoded.len() == KEY_LEN {
                return Self::try_from(decoded.as_slice());
            }
        }
        Self::try_from(trimmed.as_bytes())
    }
}

impl TryFrom<&[u8]> for EncryptionKey {
    type Error = SecretError;

    fn try_from(bytes: &[u8]) -> SecretResult<Self> {
        if bytes.len() != KEY_LEN {
            return Err(SecretError::InvalidKeyLength {
                expected: KEY_LEN,
                actual: bytes.len(),
            });
        }
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        key.copy_from_slice(bytes);
        Ok(Self(key))
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncryptionKey(***)")
    }
}

/// Source of the credential encryption key.
#[async_trait]
pub trait KeyProvider: Send + Sync {
    /// Fetch the key. Implementations must reject anything that is not 32 bytes.
    async fn encryption_key(&self) -> SecretResult<EncryptionKey>;

    /// Short name used in logs.
    fn name(&self) -> &'static str;
}

/// Reads the key from an environment variable.
pub struct EnvKeyProvider {
    var: String,
}

impl EnvKeyProvider {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }

    fn read_key(&self) -> SecretResult<EncryptionKey> {
        let value = Zeroizing::new(
            std::env::var(&self.var).map_err(|_| SecretError::NotFound(self.var.clone()))?,
        );
        EncryptionKey::parse(&value)
    }
}

#[async_trait]
impl KeyProvider for EnvKeyProvider {
    async fn encryption_key(&self) -> SecretResult<EncryptionKey> {
        self.read_key()
    }

    fn name(&self) -> &'static str {
        "env"
    }
}

/// Holds a key given directly in configuration.
pub struct StaticKeyProvider {
    key: Zeroizing<String>,
}

impl StaticKeyProvider {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: Zeroizing::new(key.into()),
        }
    }
}

#[async_trait]
impl KeyProvider for StaticKeyProvider {
    async fn encryption_key(&self) -> SecretResult<EncryptionKey> {
        EncryptionKey::parse(&self.key)
    }

    fn name(&self) -> &'static str {
        "static"
    }
}

/// Build the configured key provider.
pub fn key_provider_from_config(config: &KeyProviderConfig) -> Box<dyn KeyProvider> {
    match config {
        KeyProviderConfig::Env { var } => Box::new(EnvKeyProvider::new(var.clone())),
        KeyProviderConfig::Static { key } => Box::new(StaticKeyProvider::new(key.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_B64: &str = "MDEyMzQ1Njc4OWFiY2RlZjAxMjM0NTY3ODlhYmNkZWY=";

    #[test]
    fn test_parse_base64_key() {
        let key = EncryptionKey::parse(KEY_B64).unwrap();
        assert_eq!(key.as_bytes(), b"0123456789abcdef0123456789abcdef");
    }

    #[test]
    fn test_parse_raw_key() {
        let key = EncryptionKey::parse("0123456789abcdef0123456789abcdef").unwrap();
        assert_eq!(key.to_base64(), KEY_B64);
    }

    #[test]
    fn test_short_key_rejected() {
        let err = EncryptionKey::parse("too-short").unwrap_err();
        assert!(matches!(
            err,
            SecretError::InvalidKeyLength {
                expected: 32,
                actual: 9
            }
        ));
    }

    #[test]
    fn test_long_key_rejected() {
        let long = "x".repeat(48);
        assert!(matches!(
            EncryptionKey::parse(&long),
            Err(SecretError::InvalidKeyLength { actual: 48, .. })
        ));
    }

    #[test]
    fn test_generated_key_round_trips_through_base64() {
        let key = EncryptionKey::generate();
        let parsed = EncryptionKey::parse(&key.to_base64()).unwrap();
        assert_eq!(key.as_bytes(), parsed.as_bytes());
    }

    #[test]
    fn test_debug_hides_key() {
        let key = EncryptionKey::parse(KEY_B64).unwrap();
        assert_eq!(format!("{key:?}"), "EncryptionKey(***)");
    }

    #[test]
    fn test_env_provider_missing_var() {
        let provider = EnvKeyProvider::new("CHATGATE_TEST_KEY_UNSET");
        temp_env::with_var_unset("CHATGATE_TEST_KEY_UNSET", || {
            assert!(matches!(provider.read_key(), Err(SecretError::NotFound(_))));
        });
    }

    #[test]
    fn test_env_provider_reads_key() {
        let provider = EnvKeyProvider::new("CHATGATE_TEST_KEY");
        temp_env::with_var("CHATGATE_TEST_KEY", Some(KEY_B64), || {
            assert_eq!(
                provider.read_key().unwrap().as_bytes(),
                b"0123456789abcdef0123456789abcdef"
            );
        });
    }

    #[test]
    fn test_env_provider_rejects_wrong_length() {
        let provider = EnvKeyProvider::new("CHATGATE_TEST_SHORT_KEY");
        temp_env::with_var("CHATGATE_TEST_SHORT_KEY", Some("c2hvcnQ="), || {
            assert!(matches!(
                provider.read_key(),
                Err(SecretError::InvalidKeyLength { .. })
            ));
        });
    }

    #[tokio::test]
    async fn test_static_provider_from_config() {
        let provider = key_provider_from_config(&KeyProviderConfig::Static {
            key: KEY_B64.into(),
        });
        assert_eq!(provider.name(), "static");
        assert!(provider.encryption_key().await.is_ok());
    }
}
