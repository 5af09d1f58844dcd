use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;

use crate::{
    db::{DbError, DbPool},
    models::{CreateProviderCredential, ProviderCredential, RevealedCredential},
    secrets::{CipherError, CredentialCipher},
};

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("Provider credential not found")]
    NotFound,

    /// Stored blob failed to decrypt. Never falls back to a default key.
    #[error("Credential decryption failed: {0}")]
    Cipher(#[from] CipherError),

    #[error("Database error: {0}")]
    Database(DbError),
}

impl From<DbError> for CredentialError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound => CredentialError::NotFound,
            other => CredentialError::Database(other),
        }
    }
}

/// Provider API key storage. Keys are encrypted before they reach the
/// repository and only decrypted on the internal retrieval path.
#[derive(Clone)]
pub struct ProviderCredentialService {
    db: Arc<DbPool>,
    cipher: CredentialCipher,
}

impl ProviderCredentialService {
    pub fn new(db: Arc<DbPool>, cipher: CredentialCipher) -> Self {
        Self { db, cipher }
    }

    /// Create or replace the user's key for `input.provider`.
    pub async fn store(
        &self,
        user_id: &str,
        input: &CreateProviderCredential,
    ) -> Result<ProviderCredential, CredentialError> {
        let encrypted = self.cipher.encrypt(&input.api_key)?;
        let credential = self
            .db
            .provider_credentials()
            .upsert(
                user_id,
                &input.provider,
                &encrypted,
                &input.models_enabled,
                Utc::now(),
            )
            .await?;
        tracing::info!(user_id, provider = %input.provider, "Stored provider credential");
        Ok(credential)
    }

    pub async fn list(
        &self,
        user_id: &str,
        include_inactive: bool,
    ) -> Result<Vec<ProviderCredential>, CredentialError> {
        Ok(self
            .db
            .provider_credentials()
            .list_by_user(user_id, include_inactive)
            .await?)
    }

    /// Soft delete: the row stays and can be restored.
    pub async fn delete(&self, user_id: &str, provider: &str) -> Result<(), CredentialError> {
        self.db
            .provider_credentials()
            .soft_delete(user_id, provider, Utc::now())
            .await?;
        tracing::info!(user_id, provider, "Deactivated provider credential");
        Ok(())
    }

    pub async fn hard_delete(&self, user_id: &str, provider: &str) -> Result<(), CredentialError> {
        self.db
            .provider_credentials()
            .hard_delete(user_id, provider)
            .await?;
        tracing::info!(user_id, provider, "Permanently deleted provider credential");
        Ok(())
    }

    pub async fn restore(
        &self,
        user_id: &str,
        provider: &str,
    ) -> Result<ProviderCredential, CredentialError> {
        let credential = self
            .db
            .provider_credentials()
            .restore(user_id, provider, Utc::now())
            .await?;
        tracing::info!(user_id, provider, "Restored provider credential");
        Ok(credential)
    }

    /// Decrypt the active key for (user, provider) and mark it used.
    pub async fn reveal(
        &self,
        user_id: &str,
        provider: &str,
    ) -> Result<RevealedCredential, CredentialError> {
        let repo = self.db.provider_credentials();
        let credential = repo
            .get_active(user_id, provider)
            .await?
            .ok_or(CredentialError::NotFound)?;

        let api_key = self.cipher.decrypt(&credential.encrypted_key).map_err(|e| {
            tracing::error!(
                user_id,
                provider,
                credential_id = %credential.id,
                error = %e,
                "Stored provider credential failed to decrypt"
            );
            e
        })?;

        repo.touch_last_used(credential.id, Utc::now()).await?;

        Ok(RevealedCredential {
            provider: credential.provider,
            api_key: api_key.as_str().to_owned(),
            models_enabled: credential.models_enabled,
        })
    }
}
