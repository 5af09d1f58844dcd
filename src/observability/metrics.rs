//! Prometheus metrics for the gateway.
//!
//! Provides metrics for:
//! - HTTP request latency and counts
//! - Admission decisions (rate limit, forgery guard, token validation, quota)
//! - Recorded token usage and cost
//!
//! Every recording function is a no-op when the `prometheus` feature is off.

#[cfg(feature = "prometheus")]
use std::sync::OnceLock;

#[cfg(feature = "prometheus")]
use metrics::{counter, histogram};
#[cfg(feature = "prometheus")]
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::config::MetricsConfig;

/// Global Prometheus handle for the metrics endpoint.
#[cfg(feature = "prometheus")]
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the metrics system with the given configuration.
#[cfg(feature = "prometheus")]
pub fn init_metrics(config: &MetricsConfig) -> Result<(), MetricsError> {
    if !config.enabled {
        return Ok(());
    }

    let builder = PrometheusBuilder::new()
        .set_buckets_for_metric(
            metrics_exporter_prometheus::Matcher::Full("http_request_duration_seconds".to_string()),
            &config.latency_buckets_secs,
        )
        .map_err(|e| MetricsError::Setup(e.to_string()))?;

    let handle = builder.install_recorder().map_err(MetricsError::Install)?;

    PROMETHEUS_HANDLE
        .set(handle)
        .map_err(|_| MetricsError::Setup("Metrics already initialized".to_string()))?;

    Ok(())
}

/// Initialize the metrics system (no-op without prometheus feature).
#[cfg(not(feature = "prometheus"))]
pub fn init_metrics(config: &MetricsConfig) -> Result<(), MetricsError> {
    if config.enabled {
        tracing::warn!(
            "Metrics are enabled in config but the 'prometheus' feature is not compiled"
        );
    }
    Ok(())
}

/// Get the Prometheus handle for rendering metrics.
#[cfg(feature = "prometheus")]
pub fn get_prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

// ─────────────────────────────────────────────────────────────────────────────
// Metric Recording Functions
// ─────────────────────────────────────────────────────────────────────────────

/// Record an HTTP request.
pub fn record_http_request(method: &str, path: &str, status: u16, duration_secs: f64) {
    #[cfg(feature = "prometheus")]
    {
        let status_class = format!("{}xx", status / 100);

        counter!("http_requests_total", "method" => method.to_string(), "path" => path.to_string(), "status" => status.to_string(), "status_class" => status_class.clone())
            .increment(1);

        histogram!("http_request_duration_seconds", "method" => method.to_string(), "path" => path.to_string(), "status_class" => status_class)
            .record(duration_secs);
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = (method, path, status, duration_secs);
    }
}

/// Record a rate limiter decision.
pub fn record_rate_limit(allowed: bool) {
    #[cfg(feature = "prometheus")]
    {
        let result = if allowed { "allowed" } else { "limited" };
        counter!("rate_limit_decisions_total", "result" => result).increment(1);
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = allowed;
    }
}

/// Record a request rejected by the forgery guard.
pub fn record_csrf_rejection(code: &'static str) {
    #[cfg(feature = "prometheus")]
    {
        counter!("csrf_rejections_total", "code" => code).increment(1);
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = code;
    }
}

/// Record a failed bearer token validation.
pub fn record_auth_failure(code: &'static str) {
    #[cfg(feature = "prometheus")]
    {
        counter!("auth_failures_total", "code" => code).increment(1);
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = code;
    }
}

/// Record a quota admission decision.
pub fn record_quota_check(allowed: bool) {
    #[cfg(feature = "prometheus")]
    {
        let result = if allowed { "allowed" } else { "exceeded" };
        counter!("quota_checks_total", "result" => result).increment(1);
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = allowed;
    }
}

/// Record a usage metric written to the metering log.
pub fn record_usage(
    request_type: &str,
    model: &str,
    tokens: i64,
    cost_microcents: i64,
    success: bool,
) {
    #[cfg(feature = "prometheus")]
    {
        let status = if success { "success" } else { "error" };
        counter!("usage_records_total", "request_type" => request_type.to_string(), "model" => model.to_string(), "status" => status)
            .increment(1);

        if success {
            counter!("usage_tokens_total", "request_type" => request_type.to_string(), "model" => model.to_string())
                .increment(tokens.max(0) as u64);
            counter!("usage_cost_microcents_total", "request_type" => request_type.to_string(), "model" => model.to_string())
                .increment(cost_microcents.max(0) as u64);
        }
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = (request_type, model, tokens, cost_microcents, success);
    }
}

/// Record a usage metric that failed to persist.
pub fn record_usage_write_failure() {
    #[cfg(feature = "prometheus")]
    {
        counter!("usage_write_failures_total").increment(1);
    }
}

/// Record an error response produced by the gateway itself.
pub fn record_gateway_error(error_type: &'static str, code: &'static str) {
    #[cfg(feature = "prometheus")]
    {
        counter!("gateway_errors_total", "type" => error_type, "code" => code).increment(1);
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = (error_type, code);
    }
}

/// Metrics initialization errors.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("Failed to set up metrics: {0}")]
    Setup(String),

    #[cfg(feature = "prometheus")]
    #[error("Failed to install metrics recorder: {0}")]
    Install(#[from] metrics_exporter_prometheus::BuildError),
}
