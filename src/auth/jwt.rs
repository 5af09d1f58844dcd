//! HS256 bearer tokens.
//!
//! [`TokenValidator`] verifies signature, `exp` and `nbf` (and `iss` when an
//! issuer is configured). [`TokenIssuer`] mints tokens with the same secret.

use chrono::Utc;
use jsonwebtoken::{
    Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode, errors::ErrorKind,
};
use serde::{Deserialize, Serialize};

use super::AuthError;
use crate::{config::JwtConfig, observability::metrics};

/// Claims carried by a gateway token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: String,

    #[serde(default)]
    pub email: String,

    #[serde(default)]
    pub roles: Vec<String>,

    /// Expiration time (Unix timestamp)
    pub exp: i64,

    /// Issued at (Unix timestamp)
    #[serde(default)]
    pub iat: i64,

    /// Not before (Unix timestamp)
    #[serde(default)]
    pub nbf: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
}

/// Verifies bearer tokens.
#[derive(Clone)]
pub struct TokenValidator {
    key: DecodingKey,
    validation: Validation,
}

impl TokenValidator {
    pub fn new(config: &JwtConfig) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.validate_nbf = true;
        validation.validate_aud = false;
        validation.leeway = config.leeway_secs;
        if let Some(issuer) = &config.issuer {
            validation.set_issuer(&[issuer]);
        }

        Self {
            key: DecodingKey::from_secret(config.secret.as_bytes()),
            validation,
        }
    }

    pub fn validate(&self, token: &str) -> Result<Claims, AuthError> {
        let data = decode::<Claims>(token, &self.key, &self.validation).map_err(|e| {
            let err = match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::ExpiredToken,
                _ => AuthError::InvalidToken,
            };
            tracing::debug!(error = %e, code = err.code(), "JWT validation failed");
            metrics::record_auth_failure(err.code());
            err
        })?;
        Ok(data.claims)
    }
}

impl std::fmt::Debug for TokenValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenValidator")
            .field("issuer", &self.validation.iss)
            .field("leeway", &self.validation.leeway)
            .finish_non_exhaustive()
    }
}

/// Mints bearer tokens.
#[derive(Clone)]
pub struct TokenIssuer {
    key: EncodingKey,
    issuer: Option<String>,
    ttl_secs: i64,
}

impl TokenIssuer {
    pub fn new(config: &JwtConfig) -> Self {
        Self {
            key: EncodingKey::from_secret(config.secret.as_bytes()),
            issuer: config.issuer.clone(),
            ttl_secs: i64::try_from(config.token_ttl_secs).unwrap_or(i64::MAX),
        }
    }

    /// Issue a token with the configured lifetime.
    pub fn issue(&self, user_id: &str, email: &str, roles: &[String]) -> Result<String, AuthError> {
        self.issue_with_ttl(user_id, email, roles, self.ttl_secs)
    }

    pub fn issue_with_ttl(
        &self,
        user_id: &str,
        email: &str,
        roles: &[String],
        ttl_secs: i64,
    ) -> Result<String, AuthError> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            user_id: user_id.to_string(),
            email: email.to_string(),
            roles: roles.to_vec(),
            exp: now.saturating_add(ttl_secs),
            iat: now,
            nbf: now,
            iss: self.issuer.clone(),
        };
        self.sign(&claims)
    }

    /// Re-issue still-valid claims with a fresh expiry.
    pub fn refresh(&self, claims: &Claims) -> Result<String, AuthError> {
        self.issue(&claims.user_id, &claims.email, &claims.roles)
    }

    fn sign(&self, claims: &Claims) -> Result<String, AuthError> {
        encode(&Header::new(Algorithm::HS256), claims, &self.key)
            .map_err(|e| AuthError::Internal(format!("Failed to sign token: {e}")))
    }
}
