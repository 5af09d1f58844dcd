use std::net::{IpAddr, SocketAddr};

use axum::{
    Json,
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};

use crate::{
    api_types::ErrorResponse, config::TrustedProxiesConfig, observability::metrics,
    rate_limiter::RateLimitDecision,
};

const FORWARDED_FOR: &str = "X-Forwarded-For";
const REAL_IP: &str = "X-Real-IP";

/// A client ran out of request tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitError {
    pub limit: u32,
    pub remaining: u32,
    pub retry_after_secs: u64,
}

impl From<RateLimitDecision> for RateLimitError {
    fn from(decision: RateLimitDecision) -> Self {
        Self {
            limit: decision.limit,
            remaining: decision.remaining,
            retry_after_secs: decision.retry_after_secs,
        }
    }
}

impl IntoResponse for RateLimitError {
    fn into_response(self) -> Response {
        let code = "rate_limit_exceeded";
        metrics::record_gateway_error("rate_limit_error", code);

        let body = ErrorResponse::with_type(
            "rate_limit_error",
            code,
            format!(
                "Rate limit exceeded. Try again in {} seconds",
                self.retry_after_secs
            ),
        );
        let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();

        let headers = response.headers_mut();
        set_rate_limit_headers(headers, self.limit, self.remaining, self.retry_after_secs);
        headers.insert("Retry-After", HeaderValue::from(self.retry_after_secs));

        response
    }
}

/// Attach `X-RateLimit-*` headers describing the caller's bucket.
pub fn add_rate_limit_headers(mut response: Response, decision: &RateLimitDecision) -> Response {
    set_rate_limit_headers(
        response.headers_mut(),
        decision.limit,
        decision.remaining,
        decision.retry_after_secs,
    );
    response
}

fn set_rate_limit_headers(headers: &mut HeaderMap, limit: u32, remaining: u32, reset: u64) {
    headers.insert("X-RateLimit-Limit", HeaderValue::from(limit));
    headers.insert("X-RateLimit-Remaining", HeaderValue::from(remaining));
    headers.insert("X-RateLimit-Reset", HeaderValue::from(reset));
}

/// Resolve the client IP for rate limiting.
///
/// Proxy headers are only honored when the connecting peer is a trusted
/// proxy. X-Forwarded-For is read right-to-left, skipping trusted hops, so a
/// client cannot pick its own bucket by prepending addresses. With
/// `dangerously_trust_all` the leftmost address wins.
pub fn extract_client_ip_from_parts(
    headers: &HeaderMap,
    connecting_addr: Option<SocketAddr>,
    trusted_proxies: &TrustedProxiesConfig,
) -> Option<IpAddr> {
    let connecting_ip = connecting_addr.map(|addr| addr.ip());

    if !trusted_proxies.is_configured() {
        return connecting_ip;
    }

    let should_trust_headers = match connecting_ip {
        Some(ip) => trusted_proxies.trusts(ip),
        // No peer address (in-process callers) - only trust-all applies
        None => trusted_proxies.dangerously_trust_all,
    };

    if !should_trust_headers {
        if let Some(ip) = connecting_ip
            && headers.contains_key(FORWARDED_FOR)
        {
            tracing::debug!(connecting_ip = %ip, "Ignoring X-Forwarded-For from untrusted peer");
        }
        return connecting_ip;
    }

    if let Some(ip) = client_from_forwarded_for(headers, trusted_proxies) {
        return Some(ip);
    }

    if let Some(value) = headers.get(REAL_IP)
        && let Ok(value) = value.to_str()
        && let Ok(ip) = value.trim().parse::<IpAddr>()
    {
        return Some(ip);
    }

    connecting_ip
}

fn client_from_forwarded_for(
    headers: &HeaderMap,
    trusted_proxies: &TrustedProxiesConfig,
) -> Option<IpAddr> {
    let value = headers.get(FORWARDED_FOR)?.to_str().ok()?;
    let ips: Vec<IpAddr> = value
        .split(',')
        .filter_map(|s| s.trim().parse().ok())
        .collect();

    if trusted_proxies.dangerously_trust_all {
        return ips.into_iter().next();
    }

    ips.into_iter()
        .rev()
        .find(|&ip| !trusted_proxies.trusts(ip))
}
