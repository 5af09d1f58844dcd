use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use super::validators::PROVIDER_NAME_REGEX;

/// A stored provider API key. `encrypted_key` is a cipher blob, never plaintext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderCredential {
    pub id: Uuid,
    pub user_id: String,
    pub provider: String,
    pub encrypted_key: String,
    pub models_enabled: Vec<String>,
    pub is_active: bool,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// API view of a credential. Carries no key material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderCredentialResponse {
    pub id: Uuid,
    pub user_id: String,
    pub provider: String,
    pub has_key: bool,
    pub models_enabled: Vec<String>,
    pub is_active: bool,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<ProviderCredential> for ProviderCredentialResponse {
    fn from(c: ProviderCredential) -> Self {
        Self {
            id: c.id,
            user_id: c.user_id,
            provider: c.provider,
            has_key: !c.encrypted_key.is_empty(),
            models_enabled: c.models_enabled,
            is_active: c.is_active,
            last_used_at: c.last_used_at,
            created_at: c.created_at,
            updated_at: c.updated_at,
        }
    }
}

/// Create-or-update request. Upserts by (user, provider).
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateProviderCredential {
    #[validate(length(min = 1, max = 64), regex(path = *PROVIDER_NAME_REGEX))]
    pub provider: String,

    #[validate(length(min = 1, max = 4096))]
    pub api_key: String,

    #[serde(default)]
    #[validate(length(max = 256))]
    pub models_enabled: Vec<String>,

    /// Target user. Only admins may act on behalf of another user.
    #[serde(default)]
    pub user_id: Option<String>,
}

/// Decrypted credential returned on the internal retrieval path.
#[derive(Clone, Serialize)]
pub struct RevealedCredential {
    pub provider: String,
    pub api_key: String,
    pub models_enabled: Vec<String>,
}

impl std::fmt::Debug for RevealedCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RevealedCredential")
            .field("provider", &self.provider)
            .field("api_key", &"***")
            .field("models_enabled", &self.models_enabled)
            .finish()
    }
}
