//! AES-256-GCM envelope for provider API keys.
//!
//! A blob is standard base64 of `nonce (12 bytes) || ciphertext || tag (16 bytes)`.
//! Every call to [`CredentialCipher::encrypt`] draws a fresh random nonce, so
//! encrypting the same key twice yields different blobs.

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng},
};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use thiserror::Error;
use zeroize::Zeroizing;

use super::{EncryptionKey, KeyProvider, SecretError};

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum CipherError {
    #[error("Ciphertext is not valid base64")]
    Encoding,

    #[error("Ciphertext too short: {0} bytes")]
    TooShort(usize),

    #[error("Ciphertext failed authentication")]
    Authentication,

    #[error("Decrypted value is not valid UTF-8")]
    Utf8,

    #[error("Encryption failed")]
    Encryption,
}

/// Encrypts and decrypts provider API keys with a process-wide key.
#[derive(Clone)]
pub struct CredentialCipher {
    cipher: Aes256Gcm,
}

impl CredentialCipher {
    pub fn new(key: &EncryptionKey) -> Self {
        let key = Key::<Aes256Gcm>::from_slice(key.as_bytes());
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }

    /// Fetch the key from `provider` and build the cipher.
    pub async fn from_provider(provider: &dyn KeyProvider) -> Result<Self, SecretError> {
        let key = provider.encryption_key().await?;
        tracing::debug!(provider = provider.name(), "Loaded credential encryption key");
        Ok(Self::new(&key))
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, CipherError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| CipherError::Encryption)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(blob))
    }

    /// Decrypt a blob produced by [`encrypt`](Self::encrypt).
    ///
    /// Fails closed: a malformed or tampered blob is always an error.
    pub fn decrypt(&self, blob: &str) -> Result<Zeroizing<String>, CipherError> {
        let data = STANDARD
            .decode(blob.trim())
            .map_err(|_| CipherError::Encoding)?;
        if data.len() < NONCE_LEN + TAG_LEN {
            return Err(CipherError::TooShort(data.len()));
        }

        let (nonce, ciphertext) = data.split_at(NONCE_LEN);
        let plaintext = Zeroizing::new(
            self.cipher
                .decrypt(Nonce::from_slice(nonce), ciphertext)
                .map_err(|_| CipherError::Authentication)?,
        );

        let text = std::str::from_utf8(&plaintext).map_err(|_| CipherError::Utf8)?;
        Ok(Zeroizing::new(text.to_owned()))
    }
}

impl std::fmt::Debug for CredentialCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialCipher").finish_non_exhaustive()
    }
}
