use std::{
    net::{IpAddr, Ipv4Addr},
    str::FromStr,
    time::Duration,
};

use http::{HeaderName, HeaderValue, Method};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};

use super::ConfigError;

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Request body size limit in bytes.
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,

    /// Trusted proxy configuration for extracting real client IPs.
    /// The rate limiter keys buckets on the resolved client address.
    #[serde(default)]
    pub trusted_proxies: TrustedProxiesConfig,

    /// CORS configuration.
    #[serde(default)]
    pub cors: CorsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            body_limit_bytes: default_body_limit(),
            trusted_proxies: TrustedProxiesConfig::default(),
            cors: CorsConfig::default(),
        }
    }
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    8080
}

fn default_body_limit() -> usize {
    10 * 1024 * 1024 // 10 MB
}

/// Reverse proxies whose forwarding headers decide the rate limit key.
///
/// Headers are honored only when the connecting peer is inside one of the
/// configured ranges. Ranges are parsed at load time, so a typo fails startup
/// instead of silently trusting nobody.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct TrustedProxiesConfig {
    /// Trust forwarding headers from any peer.
    ///
    /// Only safe when the gateway is unreachable except through a load
    /// balancer that overwrites X-Forwarded-For. Otherwise any client can
    /// pick its own rate-limit bucket.
    #[serde(default)]
    pub dangerously_trust_all: bool,

    /// e.g. `["10.0.0.0/8", "172.16.0.0/12"]`
    #[serde(default)]
    pub cidrs: Vec<IpNet>,
}

impl TrustedProxiesConfig {
    pub fn trusts(&self, ip: IpAddr) -> bool {
        self.dangerously_trust_all || self.cidrs.iter().any(|net| net.contains(&ip))
    }

    pub fn is_configured(&self) -> bool {
        self.dangerously_trust_all || !self.cidrs.is_empty()
    }
}

/// Cross-origin access for the browser client. Credentials must be allowed
/// for the auth and CSRF cookies to travel with cross-origin requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CorsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// `["*"]` allows any origin.
    #[serde(default)]
    pub allowed_origins: Vec<String>,

    #[serde(default = "default_cors_methods")]
    pub allowed_methods: Vec<String>,

    /// Must include the CSRF header name for the double-submit check to work
    /// cross-origin.
    #[serde(default = "default_cors_headers")]
    pub allowed_headers: Vec<String>,

    #[serde(default)]
    pub allow_credentials: bool,

    #[serde(default = "default_cors_max_age")]
    pub max_age_secs: u64,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allowed_origins: Vec::new(),
            allowed_methods: default_cors_methods(),
            allowed_headers: default_cors_headers(),
            allow_credentials: false,
            max_age_secs: default_cors_max_age(),
        }
    }
}

impl CorsConfig {
    fn is_wildcard(&self) -> bool {
        self.allowed_origins.iter().any(|o| o == "*")
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.is_wildcard() && self.allowed_origins.len() > 1 {
            return Err(ConfigError::Validation(
                "server.cors.allowed_origins: \"*\" cannot be combined with explicit origins"
                    .into(),
            ));
        }
        if !self.is_wildcard() {
            parse_all::<HeaderValue>("server.cors.allowed_origins", &self.allowed_origins)?;
        }
        parse_all::<Method>("server.cors.allowed_methods", &self.allowed_methods)?;
        parse_all::<HeaderName>("server.cors.allowed_headers", &self.allowed_headers)?;
        Ok(())
    }

    /// `None` when CORS is disabled. Expects a validated config.
    pub fn into_layer(self) -> Option<CorsLayer> {
        if !self.enabled {
            return None;
        }

        let allow_origin = match (self.is_wildcard(), self.allow_credentials) {
            // Browsers reject `*` alongside credentials; echo the caller instead.
            (true, true) => {
                tracing::warn!("CORS: mirroring any origin with credentials enabled");
                AllowOrigin::mirror_request()
            }
            (true, false) => AllowOrigin::any(),
            (false, _) => AllowOrigin::list(
                parse_all::<HeaderValue>("server.cors.allowed_origins", &self.allowed_origins)
                    .unwrap_or_default(),
            ),
        };
        let methods = parse_all::<Method>("server.cors.allowed_methods", &self.allowed_methods)
            .unwrap_or_default();
        let headers =
            parse_all::<HeaderName>("server.cors.allowed_headers", &self.allowed_headers)
                .unwrap_or_default();

        Some(
            CorsLayer::new()
                .allow_origin(allow_origin)
                .allow_methods(AllowMethods::list(methods))
                .allow_headers(AllowHeaders::list(headers))
                .allow_credentials(self.allow_credentials)
                .max_age(Duration::from_secs(self.max_age_secs)),
        )
    }
}

fn parse_all<T: FromStr>(field: &str, values: &[String]) -> Result<Vec<T>, ConfigError> {
    values
        .iter()
        .map(|v| {
            v.parse::<T>()
                .map_err(|_| ConfigError::Validation(format!("{field}: invalid value '{v}'")))
        })
        .collect()
}

fn default_true() -> bool {
    true
}

fn default_cors_methods() -> Vec<String> {
    ["GET", "POST", "PUT", "PATCH", "DELETE", "OPTIONS"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_cors_headers() -> Vec<String> {
    [
        "Content-Type",
        "Authorization",
        "X-CSRF-Token",
        "X-Request-Id",
        "X-Estimated-Tokens",
        "X-Model",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_cors_max_age() -> u64 {
    86400
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trusted_ranges() {
        let config: TrustedProxiesConfig = toml::from_str(r#"cidrs = ["10.0.0.0/8"]"#).unwrap();
        assert!(config.trusts("10.1.2.3".parse().unwrap()));
        assert!(!config.trusts("192.168.1.1".parse().unwrap()));
        assert!(config.is_configured());
    }

    #[test]
    fn test_bad_cidr_fails_to_load() {
        assert!(toml::from_str::<TrustedProxiesConfig>(r#"cidrs = ["not-a-cidr"]"#).is_err());
    }

    #[test]
    fn test_trust_all() {
        let config = TrustedProxiesConfig {
            dangerously_trust_all: true,
            cidrs: vec![],
        };
        assert!(config.trusts("8.8.8.8".parse().unwrap()));
        assert!(!TrustedProxiesConfig::default().is_configured());
    }

    #[test]
    fn test_cors_disabled_yields_no_layer() {
        let config = CorsConfig {
            enabled: false,
            ..Default::default()
        };
        assert!(config.into_layer().is_none());
    }

    #[test]
    fn test_cors_validation() {
        assert!(CorsConfig::default().validate().is_ok());

        let bad_method = CorsConfig {
            allowed_methods: vec!["GET POST".into()],
            ..Default::default()
        };
        assert!(bad_method.validate().is_err());

        let mixed = CorsConfig {
            allowed_origins: vec!["*".into(), "https://chat.example.com".into()],
            ..Default::default()
        };
        assert!(mixed.validate().is_err());
    }

    #[test]
    fn test_default_headers_allow_csrf_header() {
        let config = CorsConfig::default();
        assert!(config.allowed_headers.iter().any(|h| h == "X-CSRF-Token"));
    }

    #[test]
    fn test_default_cors_covers_gateway_surface() {
        let config = CorsConfig::default();
        assert!(config.allowed_methods.iter().any(|m| m == "PATCH"));
        for header in ["X-Estimated-Tokens", "X-Model"] {
            assert!(
                config.allowed_headers.iter().any(|h| h == header),
                "{header} missing from default allowed headers"
            );
        }
    }
}
