//! Health and metrics endpoints. These bypass metering and quota admission.

use std::time::Instant;

use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;

use crate::{AppState, db::DbPool};

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub version: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<DatabaseCheck>,
    /// Client buckets currently held by the rate limiter
    pub rate_limit_clients: usize,
}

#[derive(Debug, Serialize)]
pub struct DatabaseCheck {
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<&'static str>,
    pub latency_ms: u64,
}

async fn check_database(db: &DbPool) -> DatabaseCheck {
    let started = Instant::now();
    let outcome = db.health_check().await;
    let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

    match outcome {
        Ok(()) => DatabaseCheck {
            healthy: true,
            error: None,
            latency_ms,
        },
        Err(e) => {
            tracing::warn!(error = %e, latency_ms, "Database health check failed");
            DatabaseCheck {
                healthy: false,
                error: Some("database unreachable"),
                latency_ms,
            }
        }
    }
}

/// Full report. 503 when the database is configured but not answering.
#[tracing::instrument(name = "health.check", skip(state))]
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let database = match state.db.as_deref() {
        Some(db) => Some(check_database(db).await),
        None => None,
    };
    let degraded = database.as_ref().is_some_and(|check| !check.healthy);

    let report = HealthReport {
        status: if degraded { "unhealthy" } else { "healthy" },
        version: env!("CARGO_PKG_VERSION"),
        database,
        rate_limit_clients: state.rate_limiter.len(),
    };
    let code = if degraded {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (code, Json(report))
}

pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

#[tracing::instrument(name = "health.readiness", skip(state))]
pub async fn readiness(State(state): State<AppState>) -> StatusCode {
    match state.db.as_deref() {
        Some(db) if !check_database(db).await.healthy => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    }
}

#[cfg(feature = "prometheus")]
pub async fn metrics() -> impl IntoResponse {
    use crate::observability::metrics::get_prometheus_handle;

    match get_prometheus_handle() {
        Some(handle) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            handle.render(),
        ),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [("content-type", "text/plain")],
            "metrics exporter not installed".to_string(),
        ),
    }
}

#[cfg(not(feature = "prometheus"))]
pub async fn metrics() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "built without the prometheus feature")
}
