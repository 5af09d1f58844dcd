//! Double-submit cookie forgery guard.
//!
//! The guard keeps a random token in a cookie that page scripts can read.
//! Mutating requests must echo it in a header; a cross-site attacker can make
//! the browser send the cookie but cannot read it to fill in the header.

use axum::{
    Json,
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use rand::RngCore;
use subtle::ConstantTimeEq;
use tower_cookies::{
    Cookie,
    cookie::{SameSite, time::Duration},
};

use crate::{api_types::ErrorResponse, config::CsrfConfig, observability::metrics};

const TOKEN_BYTES: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsrfError {
    /// Mutating request without the token header
    Missing,
    /// Header token does not match the cookie, or there is no cookie
    Invalid,
}

impl CsrfError {
    pub fn code(&self) -> &'static str {
        match self {
            CsrfError::Missing => "CSRF_TOKEN_MISSING",
            CsrfError::Invalid => "CSRF_TOKEN_INVALID",
        }
    }
}

impl IntoResponse for CsrfError {
    fn into_response(self) -> Response {
        let message = match self {
            CsrfError::Missing => "CSRF token missing",
            CsrfError::Invalid => "CSRF token invalid",
        };
        metrics::record_gateway_error("permission_error", self.code());
        let body = ErrorResponse::with_type("permission_error", self.code(), message);
        (StatusCode::FORBIDDEN, Json(body)).into_response()
    }
}

/// Result of a forgery check.
#[derive(Debug)]
pub struct CsrfCheck {
    /// Cookie to set on the response, present when the request had none.
    /// Set even when the request is rejected so the next attempt can succeed.
    pub set_cookie: Option<Cookie<'static>>,
    pub outcome: Result<(), CsrfError>,
}

impl CsrfCheck {
    fn pass() -> Self {
        Self {
            set_cookie: None,
            outcome: Ok(()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ForgeryGuard {
    config: CsrfConfig,
}

impl ForgeryGuard {
    pub fn new(config: CsrfConfig) -> Self {
        Self { config }
    }

    pub fn cookie_name(&self) -> &str {
        &self.config.cookie_name
    }

    pub fn header_name(&self) -> &str {
        &self.config.header_name
    }

    pub fn is_exempt(&self, path: &str) -> bool {
        !self.config.enabled
            || self
                .config
                .exempt_paths
                .iter()
                .any(|prefix| path.starts_with(prefix.as_str()))
    }

    pub fn check(
        &self,
        method: &Method,
        path: &str,
        cookie_token: Option<&str>,
        header_token: Option<&str>,
    ) -> CsrfCheck {
        if self.is_exempt(path) {
            return CsrfCheck::pass();
        }

        let set_cookie = match cookie_token {
            Some(_) => None,
            None => Some(self.mint_cookie()),
        };

        let outcome = if is_mutating(method) {
            verify(cookie_token, header_token)
        } else {
            Ok(())
        };

        if let Err(e) = outcome {
            tracing::debug!(method = %method, path, code = e.code(), "CSRF check failed");
            metrics::record_csrf_rejection(e.code());
        }

        CsrfCheck {
            set_cookie,
            outcome,
        }
    }

    fn mint_cookie(&self) -> Cookie<'static> {
        Cookie::build((self.config.cookie_name.clone(), generate_token()))
            .path("/")
            .max_age(Duration::seconds(self.config.max_age_secs))
            .http_only(false)
            .same_site(SameSite::Lax)
            .secure(self.config.secure)
            .build()
    }
}

fn is_mutating(method: &Method) -> bool {
    matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
}

fn verify(cookie_token: Option<&str>, header_token: Option<&str>) -> Result<(), CsrfError> {
    let header = header_token
        .filter(|h| !h.is_empty())
        .ok_or(CsrfError::Missing)?;
    let cookie = cookie_token.ok_or(CsrfError::Invalid)?;

    let header = normalize(header);
    let cookie = normalize(cookie);
    if bool::from(header.as_bytes().ct_eq(cookie.as_bytes())) {
        Ok(())
    } else {
        Err(CsrfError::Invalid)
    }
}

/// Decode percent escapes (`%3D`, `%2B`, `%2F`, either case) and lowercase.
fn normalize(token: &str) -> String {
    let decoded = urlencoding::decode(token)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| token.to_string());
    decoded.to_ascii_lowercase()
}

/// 32 random bytes, standard base64.
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    STANDARD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard() -> ForgeryGuard {
        ForgeryGuard::new(CsrfConfig::default())
    }

    #[test]
    fn test_matching_token_passes() {
        let check = guard().check(&Method::POST, "/api/v1/chat", Some("abc123"), Some("abc123"));
        assert_eq!(check.outcome, Ok(()));
        assert!(check.set_cookie.is_none());
    }

    #[test]
    fn test_mismatched_token_invalid() {
        let check = guard().check(&Method::POST, "/api/v1/chat", Some("abc123"), Some("abc124"));
        assert_eq!(check.outcome, Err(CsrfError::Invalid));
        assert_eq!(CsrfError::Invalid.code(), "CSRF_TOKEN_INVALID");
    }

    #[test]
    fn test_missing_header() {
        let check = guard().check(&Method::DELETE, "/api/v1/chat/1", Some("abc123"), None);
        assert_eq!(check.outcome, Err(CsrfError::Missing));
        assert_eq!(CsrfError::Missing.code(), "CSRF_TOKEN_MISSING");
    }

    #[test]
    fn test_empty_header_is_missing() {
        let check = guard().check(&Method::PUT, "/api/v1/x", Some("abc123"), Some(""));
        assert_eq!(check.outcome, Err(CsrfError::Missing));
    }

    #[test]
    fn test_login_is_exempt() {
        let check = guard().check(&Method::POST, "/api/v1/auth/login", None, None);
        assert_eq!(check.outcome, Ok(()));
        assert!(check.set_cookie.is_none());

        let check = guard().check(&Method::POST, "/api/v1/auth/register", None, None);
        assert_eq!(check.outcome, Ok(()));
    }

    #[test]
    fn test_safe_methods_pass_and_mint_cookie() {
        let check = guard().check(&Method::GET, "/api/v1/chat", None, None);
        assert_eq!(check.outcome, Ok(()));

        let cookie = check.set_cookie.unwrap();
        assert_eq!(cookie.name(), "_csrf");
        assert_eq!(cookie.path(), Some("/"));
        assert_eq!(cookie.http_only(), Some(false));
        assert_eq!(cookie.same_site(), Some(SameSite::Lax));
        assert_eq!(cookie.max_age(), Some(Duration::seconds(3600)));
        assert_eq!(STANDARD.decode(cookie.value()).unwrap().len(), 32);
    }

    #[test]
    fn test_no_cookie_on_mutation_is_invalid_but_mints() {
        let check = guard().check(&Method::POST, "/api/v1/chat", None, Some("abc123"));
        assert_eq!(check.outcome, Err(CsrfError::Invalid));
        assert!(check.set_cookie.is_some());
    }

    #[test]
    fn test_percent_encoded_header_normalized() {
        let token = "a+b/c==";
        for header in ["a%2Bb%2Fc%3D%3D", "a%2bb%2fc%3d%3d"] {
            let check = guard().check(&Method::PATCH, "/api/v1/x", Some(token), Some(header));
            assert_eq!(check.outcome, Ok(()), "header {header}");
        }
    }

    #[test]
    fn test_comparison_is_case_insensitive() {
        let check = guard().check(&Method::POST, "/api/v1/x", Some("AbC123"), Some("aBc123"));
        assert_eq!(check.outcome, Ok(()));
    }

    #[test]
    fn test_disabled_guard_passes() {
        let guard = ForgeryGuard::new(CsrfConfig {
            enabled: false,
            ..Default::default()
        });
        let check = guard.check(&Method::POST, "/api/v1/chat", None, None);
        assert_eq!(check.outcome, Ok(()));
        assert!(check.set_cookie.is_none());
    }

    #[test]
    fn test_generated_tokens_differ() {
        assert_ne!(generate_token(), generate_token());
    }
}
