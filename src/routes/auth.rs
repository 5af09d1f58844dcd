//! Token refresh.
//!
//! Tokens are minted elsewhere (or by `chatgate token` for local testing);
//! the gateway only extends still-valid ones.

use axum::{
    Json,
    extract::State,
    http::{HeaderMap, HeaderValue, header::SET_COOKIE},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use tower_cookies::{
    Cookie,
    cookie::{SameSite, time::Duration},
};

use super::error::ApiError;
use crate::{
    AppState,
    auth::{AuthError, cookie_value, extract_token},
};

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub token: String,
    pub token_type: &'static str,
    pub expires_in: u64,
}

/// Re-issue the caller's token with a fresh expiry.
///
/// Roles and email are carried over unchanged. When the token arrived in the
/// auth cookie the cookie is replaced as well.
#[tracing::instrument(name = "auth.refresh", skip_all)]
pub async fn refresh(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let jwt = &state.config.auth.jwt;
    let token = extract_token(&headers, &jwt.cookie_name).ok_or(AuthError::Unauthenticated)?;
    let claims = state.token_validator.validate(&token)?;
    let refreshed = state.token_issuer.refresh(&claims)?;
    tracing::debug!(user_id = %claims.user_id, "Token refreshed");

    let from_cookie = cookie_value(&headers, &jwt.cookie_name).is_some_and(|c| c == token);
    let body = TokenResponse {
        token: refreshed.clone(),
        token_type: "Bearer",
        expires_in: jwt.token_ttl_secs,
    };
    let mut response = Json(body).into_response();

    if from_cookie {
        let cookie = Cookie::build((jwt.cookie_name.clone(), refreshed))
            .path("/")
            .http_only(true)
            .same_site(SameSite::Lax)
            .secure(state.config.auth.csrf.secure)
            .max_age(Duration::seconds(
                i64::try_from(jwt.token_ttl_secs).unwrap_or(i64::MAX),
            ))
            .build();
        match HeaderValue::from_str(&cookie.to_string()) {
            Ok(value) => {
                response.headers_mut().append(SET_COOKIE, value);
            }
            Err(e) => tracing::warn!(error = %e, "Refreshed token is not a valid cookie value"),
        }
    }

    Ok(response)
}
