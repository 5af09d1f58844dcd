//! Tracing subscriber initialization.

use tracing_subscriber::{
    EnvFilter, Layer, Registry, layer::SubscriberExt, util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingConfig, ObservabilityConfig};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Install the global subscriber. `RUST_LOG` takes precedence over the
/// configured level and filter.
pub fn init_tracing(config: &ObservabilityConfig) -> Result<TracingGuard, TracingError> {
    let logging = &config.logging;

    tracing_subscriber::registry()
        .with(fmt_layer(logging))
        .with(build_env_filter(logging))
        .try_init()
        .map_err(|e| TracingError::Init(e.to_string()))?;

    Ok(TracingGuard { _private: () })
}

fn fmt_layer(logging: &LoggingConfig) -> BoxedLayer {
    let base = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_file(logging.file_line)
        .with_line_number(logging.file_line);

    // `without_time` changes the layer type, hence one arm per combination.
    match (logging.format, logging.timestamps) {
        (LogFormat::Pretty, true) => base.pretty().boxed(),
        (LogFormat::Pretty, false) => base.pretty().without_time().boxed(),
        (LogFormat::Compact, true) => base.compact().boxed(),
        (LogFormat::Compact, false) => base.compact().without_time().boxed(),
        // The request span carries request_id; include it on every line.
        (LogFormat::Json, true) => base
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .boxed(),
        (LogFormat::Json, false) => base
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .without_time()
            .boxed(),
    }
}

fn build_env_filter(config: &LoggingConfig) -> EnvFilter {
    let level = config.level.as_str();

    if let Ok(directives) = std::env::var("RUST_LOG") {
        return EnvFilter::try_new(directives).unwrap_or_else(|_| EnvFilter::new(level));
    }
    match &config.filter {
        Some(extra) => EnvFilter::try_new(format!("{level},{extra}"))
            .unwrap_or_else(|_| EnvFilter::new(level)),
        None => EnvFilter::new(format!("{level},hyper=warn,h2=warn,sqlx=warn")),
    }
}

/// Held by `main` for the lifetime of the process.
pub struct TracingGuard {
    _private: (),
}

/// Tracing initialization errors.
#[derive(Debug, thiserror::Error)]
pub enum TracingError {
    #[error("Failed to initialize tracing: {0}")]
    Init(String),
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;
    use crate::config::LogLevel;

    #[test]
    #[serial(rust_log)]
    fn test_env_filter_uses_config_filter() {
        temp_env::with_var_unset("RUST_LOG", || {
            let config = LoggingConfig {
                level: LogLevel::Debug,
                filter: Some("sqlx=info".into()),
                ..Default::default()
            };
            let filter = build_env_filter(&config).to_string();
            assert!(filter.contains("debug"));
            assert!(filter.contains("sqlx=info"));
        });
    }

    #[test]
    #[serial(rust_log)]
    fn test_rust_log_overrides_config() {
        temp_env::with_var("RUST_LOG", Some("warn"), || {
            let config = LoggingConfig {
                level: LogLevel::Trace,
                ..Default::default()
            };
            assert_eq!(build_env_filter(&config).to_string(), "warn");
        });
    }

    #[test]
    #[serial(rust_log)]
    fn test_invalid_config_filter_falls_back_to_level() {
        temp_env::with_var_unset("RUST_LOG", || {
            let config = LoggingConfig {
                level: LogLevel::Warn,
                filter: Some("sqlx=notalevel".into()),
                ..Default::default()
            };
            assert_eq!(build_env_filter(&config).to_string(), "warn");
        });
    }
}
