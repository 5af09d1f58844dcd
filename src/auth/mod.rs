//! Bearer token authentication.

mod error;
mod identity;
pub mod jwt;

use axum::http::{HeaderMap, header};
pub use error::AuthError;
pub use identity::{Identity, ROLE_ADMIN, ROLE_INTERNAL};
pub use jwt::{Claims, TokenIssuer, TokenValidator};
use tower_cookies::Cookie;

/// Pull the bearer token from a request.
///
/// `Authorization: Bearer <token>` takes precedence over the `cookie_name` cookie.
pub fn extract_token(headers: &HeaderMap, cookie_name: &str) -> Option<String> {
    if let Some(value) = headers.get(header::AUTHORIZATION)
        && let Ok(value) = value.to_str()
        && let Some((scheme, token)) = value.split_once(' ')
        && scheme.eq_ignore_ascii_case("bearer")
    {
        let token = token.trim();
        if !token.is_empty() {
            return Some(token.to_string());
        }
    }

    cookie_value(headers, cookie_name)
}

/// Value of the named cookie, if the request carries it.
pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(Cookie::split_parse)
        .filter_map(Result::ok)
        .find(|cookie| cookie.name() == name)
        .map(|cookie| cookie.value().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    fn headers(pairs: &[(header::HeaderName, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(name.clone(), HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[test]
    fn test_bearer_header() {
        let h = headers(&[(header::AUTHORIZATION, "Bearer abc.def.ghi")]);
        assert_eq!(extract_token(&h, "auth_token").as_deref(), Some("abc.def.ghi"));
    }

    #[test]
    fn test_bearer_scheme_case_insensitive() {
        let h = headers(&[(header::AUTHORIZATION, "bearer abc")]);
        assert_eq!(extract_token(&h, "auth_token").as_deref(), Some("abc"));
    }

    #[test]
    fn test_header_takes_precedence_over_cookie() {
        let h = headers(&[
            (header::AUTHORIZATION, "Bearer from-header"),
            (header::COOKIE, "auth_token=from-cookie"),
        ]);
        assert_eq!(extract_token(&h, "auth_token").as_deref(), Some("from-header"));
    }

    #[test]
    fn test_cookie_fallback() {
        let h = headers(&[(header::COOKIE, "_csrf=xyz; auth_token=from-cookie")]);
        assert_eq!(extract_token(&h, "auth_token").as_deref(), Some("from-cookie"));
    }

    #[test]
    fn test_non_bearer_scheme_ignored() {
        let h = headers(&[(header::AUTHORIZATION, "Basic dXNlcjpwYXNz")]);
        assert_eq!(extract_token(&h, "auth_token"), None);
    }

    #[test]
    fn test_multiple_cookie_headers() {
        let h = headers(&[
            (header::COOKIE, "theme=dark"),
            (header::COOKIE, "_csrf=tok"),
        ]);
        assert_eq!(cookie_value(&h, "_csrf").as_deref(), Some("tok"));
        assert_eq!(cookie_value(&h, "missing"), None);
    }
}
