use serde::{Deserialize, Serialize};

use super::ConfigError;

/// Minimum accepted length of the HMAC signing secret.
pub const MIN_JWT_SECRET_LEN: usize = 32;

/// Authentication and anti-forgery configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    /// Bearer token (JWT) settings.
    #[serde(default)]
    pub jwt: JwtConfig,

    /// Double-submit cookie CSRF protection.
    #[serde(default)]
    pub csrf: CsrfConfig,
}

impl AuthConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.jwt.validate()?;
        self.csrf.validate()
    }
}

/// HS256 token settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JwtConfig {
    /// Shared HMAC secret. Usually `"${JWT_SECRET_KEY}"`.
    /// Must be at least 32 characters.
    #[serde(default)]
    pub secret: String,

    /// Expected `iss` claim. Issued tokens carry it and validated tokens must match.
    #[serde(default)]
    pub issuer: Option<String>,

    /// Lifetime of issued tokens in seconds.
    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: u64,

    /// Clock skew tolerated when checking `exp` and `nbf`.
    #[serde(default)]
    pub leeway_secs: u64,

    /// Cookie consulted when no `Authorization: Bearer` header is present.
    #[serde(default = "default_auth_cookie")]
    pub cookie_name: String,
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            issuer: None,
            token_ttl_secs: default_token_ttl(),
            leeway_secs: 0,
            cookie_name: default_auth_cookie(),
        }
    }
}

impl JwtConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.secret.len() < MIN_JWT_SECRET_LEN {
            return Err(ConfigError::Validation(format!(
                "auth.jwt.secret must be at least {} characters",
                MIN_JWT_SECRET_LEN
            )));
        }
        if self.token_ttl_secs == 0 {
            return Err(ConfigError::Validation(
                "auth.jwt.token_ttl_secs must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

fn default_token_ttl() -> u64 {
    86400 // 24 hours
}

fn default_auth_cookie() -> String {
    "auth_token".to_string()
}

/// Double-submit cookie settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CsrfConfig {
    /// Enable the forgery guard.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Cookie holding the token. Readable by page scripts.
    #[serde(default = "default_csrf_cookie")]
    pub cookie_name: String,

    /// Header the caller echoes the token in on mutating requests.
    #[serde(default = "default_csrf_header")]
    pub header_name: String,

    /// Cookie lifetime in seconds.
    #[serde(default = "default_csrf_max_age")]
    pub max_age_secs: i64,

    /// Set the `Secure` attribute on the cookie.
    #[serde(default)]
    pub secure: bool,

    /// Path prefixes that skip the guard entirely (unauthenticated entry points).
    #[serde(default = "default_csrf_exempt")]
    pub exempt_paths: Vec<String>,
}

impl Default for CsrfConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cookie_name: default_csrf_cookie(),
            header_name: default_csrf_header(),
            max_age_secs: default_csrf_max_age(),
            secure: false,
            exempt_paths: default_csrf_exempt(),
        }
    }
}

impl CsrfConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.header_name.parse::<http::HeaderName>().is_err() {
            return Err(ConfigError::Validation(format!(
                "auth.csrf.header_name '{}' is not a valid header name",
                self.header_name
            )));
        }
        if self.max_age_secs <= 0 {
            return Err(ConfigError::Validation(
                "auth.csrf.max_age_secs must be positive".into(),
            ));
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_csrf_cookie() -> String {
    "_csrf".to_string()
}

fn default_csrf_header() -> String {
    "X-CSRF-Token".to_string()
}

fn default_csrf_max_age() -> i64 {
    3600
}

fn default_csrf_exempt() -> Vec<String> {
    vec![
        "/api/v1/auth/register".to_string(),
        "/api/v1/auth/login".to_string(),
    ]
}
