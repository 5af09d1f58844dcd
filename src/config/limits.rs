use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::ConfigError;

/// Admission limits: per-client request throttling and per-user quotas.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LimitsConfig {
    /// Token-bucket throttle keyed on client address.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Default per-user token and cost ceilings.
    #[serde(default)]
    pub quota: QuotaConfig,
}

impl LimitsConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.rate_limit.validate()?;
        self.quota.validate()
    }
}

/// Token-bucket rate limiting defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    /// Enable the rate limiting stage.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Sustained refill rate for a newly seen client.
    #[serde(default = "default_rps")]
    pub requests_per_second: f64,

    /// Bucket capacity for a newly seen client.
    #[serde(default = "default_burst")]
    pub burst: u32,

    /// Maximum number of buckets held in memory.
    /// When full, idle buckets are swept and then the least recently seen are evicted.
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,

    /// Buckets unused for this long are dropped by the sweeper.
    #[serde(default = "default_idle_ttl")]
    pub idle_ttl_secs: u64,

    /// Interval of the background idle sweep. 0 disables the background task;
    /// eviction then only happens when the map is full.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Per-client overrides keyed by client address.
    #[serde(default)]
    pub clients: HashMap<String, ClientRateLimit>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_second: default_rps(),
            burst: default_burst(),
            max_clients: default_max_clients(),
            idle_ttl_secs: default_idle_ttl(),
            sweep_interval_secs: default_sweep_interval(),
            clients: HashMap::new(),
        }
    }
}

impl RateLimitConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        check_rate("limits.rate_limit", self.requests_per_second, self.burst)?;
        if self.max_clients == 0 {
            return Err(ConfigError::Validation(
                "limits.rate_limit.max_clients must be greater than zero".into(),
            ));
        }
        for (client, limit) in &self.clients {
            check_rate(
                &format!("limits.rate_limit.clients.{client}"),
                limit.requests_per_second,
                limit.burst,
            )?;
        }
        Ok(())
    }
}

fn check_rate(section: &str, rate: f64, burst: u32) -> Result<(), ConfigError> {
    if !rate.is_finite() || rate <= 0.0 {
        return Err(ConfigError::Validation(format!(
            "{section}.requests_per_second must be a positive number"
        )));
    }
    if burst == 0 {
        return Err(ConfigError::Validation(format!(
            "{section}.burst must be greater than zero"
        )));
    }
    Ok(())
}

/// Explicit limits for a single client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientRateLimit {
    pub requests_per_second: f64,
    pub burst: u32,
}

fn default_rps() -> f64 {
    100.0
}

fn default_burst() -> u32 {
    10
}

fn default_max_clients() -> usize {
    100_000
}

fn default_idle_ttl() -> u64 {
    600 // 10 minutes
}

fn default_sweep_interval() -> u64 {
    60
}

/// Default quota ceilings applied when a user's quota row is first created.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QuotaConfig {
    /// Enable the quota admission stage and usage recording.
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_daily_tokens")]
    pub daily_token_limit: i64,

    #[serde(default = "default_monthly_tokens")]
    pub monthly_token_limit: i64,

    /// Daily cost ceiling in USD.
    #[serde(default = "default_daily_cost")]
    pub daily_cost_limit_usd: f64,

    /// Monthly cost ceiling in USD.
    #[serde(default = "default_monthly_cost")]
    pub monthly_cost_limit_usd: f64,

    /// Tokens reserved for a request that does not send `X-Estimated-Tokens`.
    #[serde(default = "default_estimate")]
    pub default_estimate_tokens: i64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            daily_token_limit: default_daily_tokens(),
            monthly_token_limit: default_monthly_tokens(),
            daily_cost_limit_usd: default_daily_cost(),
            monthly_cost_limit_usd: default_monthly_cost(),
            default_estimate_tokens: default_estimate(),
        }
    }
}

impl QuotaConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.daily_token_limit < 0 || self.monthly_token_limit < 0 {
            return Err(ConfigError::Validation(
                "limits.quota token limits cannot be negative".into(),
            ));
        }
        if !(self.daily_cost_limit_usd >= 0.0 && self.monthly_cost_limit_usd >= 0.0) {
            return Err(ConfigError::Validation(
                "limits.quota cost limits must be non-negative numbers".into(),
            ));
        }
        if self.default_estimate_tokens < 0 {
            return Err(ConfigError::Validation(
                "limits.quota.default_estimate_tokens cannot be negative".into(),
            ));
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_daily_tokens() -> i64 {
    100_000
}

fn default_monthly_tokens() -> i64 {
    3_000_000
}

fn default_daily_cost() -> f64 {
    10.0
}

fn default_monthly_cost() -> f64 {
    300.0
}

fn default_estimate() -> i64 {
    4000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        LimitsConfig::default().validate().unwrap();
    }

    #[test]
    fn test_zero_burst_rejected() {
        let mut config = LimitsConfig::default();
        config.rate_limit.burst = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_client_override_rejected() {
        let mut config = LimitsConfig::default();
        config.rate_limit.clients.insert(
            "10.0.0.1".to_string(),
            ClientRateLimit {
                requests_per_second: f64::NAN,
                burst: 5,
            },
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_negative_quota_rejected() {
        let mut config = LimitsConfig::default();
        config.quota.monthly_cost_limit_usd = -1.0;
        assert!(config.validate().is_err());
    }
}
