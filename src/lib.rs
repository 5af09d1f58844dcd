use std::{sync::Arc, time::Duration};

use axum::{Router, middleware::from_fn, middleware::from_fn_with_state};
use tokio_util::task::TaskTracker;
use tower_http::{
    catch_panic::CatchPanicLayer, limit::RequestBodyLimitLayer, trace::TraceLayer,
};

mod api_types;
pub mod auth;
pub mod config;
pub mod db;
pub mod middleware;
pub mod models;
pub mod observability;
pub mod pipeline;
pub mod pricing;
pub mod rate_limiter;
pub mod routes;
pub mod secrets;
pub mod services;

#[cfg(test)]
mod tests;

use crate::{
    auth::{TokenIssuer, TokenValidator},
    config::GatewayConfig,
    db::DbPool,
    middleware::ForgeryGuard,
    models::QuotaLimits,
    pipeline::{
        ForgeryGuardStage, Pipeline, QuotaAdmissionStage, RateLimitStage, Stage,
        TokenValidationStage,
    },
    pricing::PricingTable,
    rate_limiter::RateLimiter,
    secrets::{CredentialCipher, key_provider_from_config},
    services::Services,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub db: Option<Arc<DbPool>>,
    /// Database-backed services. `None` when no database is configured.
    pub services: Option<Services>,
    /// Shared with the rate limiting stage and the idle sweeper.
    pub rate_limiter: Arc<RateLimiter>,
    pub token_validator: Arc<TokenValidator>,
    pub token_issuer: Arc<TokenIssuer>,
    pub pipeline: Arc<Pipeline>,
    /// Task tracker for background tasks (usage recording).
    /// Ensures all spawned tasks complete during graceful shutdown.
    pub task_tracker: TaskTracker,
}

impl AppState {
    pub async fn new(config: GatewayConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let db = if config.database.is_none() {
            tracing::warn!(
                "No database configured; quota admission, usage recording and provider \
                 credentials are disabled"
            );
            None
        } else {
            let pool = DbPool::from_config(&config.database).await?;
            if config.database.run_migrations() {
                pool.run_migrations().await?;
            }
            tracing::info!("Database initialized");
            Some(Arc::new(pool))
        };

        let services = match &db {
            Some(db) => {
                let provider = key_provider_from_config(&config.credentials.key_provider);
                let cipher = CredentialCipher::from_provider(provider.as_ref())
                    .await
                    .map_err(|e| {
                        format!(
                            "Failed to load credential encryption key from {} provider: {e}",
                            provider.name()
                        )
                    })?;
                Some(Services::new(
                    Arc::clone(db),
                    PricingTable::from_config(&config.pricing),
                    QuotaLimits::from(&config.limits.quota),
                    cipher,
                ))
            }
            None => None,
        };

        let rate_limiter = Arc::new(RateLimiter::from_config(&config.limits.rate_limit));
        let token_validator = Arc::new(TokenValidator::new(&config.auth.jwt));
        let token_issuer = Arc::new(TokenIssuer::new(&config.auth.jwt));

        let pipeline = build_pipeline(
            &config,
            Arc::clone(&rate_limiter),
            Arc::clone(&token_validator),
            services.as_ref(),
        );
        tracing::info!(stages = ?pipeline.stage_names(), "Request pipeline assembled");

        Ok(Self {
            config: Arc::new(config),
            db,
            services,
            rate_limiter,
            token_validator,
            token_issuer,
            pipeline: Arc::new(pipeline),
            task_tracker: TaskTracker::new(),
        })
    }
}

/// Assemble the stage chain from the enabled features.
///
/// Token validation always runs so downstream handlers see the caller's
/// identity. Quota admission needs the database.
pub fn build_pipeline(
    config: &GatewayConfig,
    rate_limiter: Arc<RateLimiter>,
    token_validator: Arc<TokenValidator>,
    services: Option<&Services>,
) -> Pipeline {
    let mut stages: Vec<Box<dyn Stage>> = Vec::new();

    if config.auth.csrf.enabled {
        stages.push(Box::new(ForgeryGuardStage::new(ForgeryGuard::new(
            config.auth.csrf.clone(),
        ))));
    }
    if config.limits.rate_limit.enabled {
        stages.push(Box::new(RateLimitStage::new(rate_limiter)));
    }
    stages.push(Box::new(TokenValidationStage::new(
        token_validator,
        config.auth.jwt.cookie_name.clone(),
    )));
    match services {
        Some(services) if config.limits.quota.enabled => {
            stages.push(Box::new(QuotaAdmissionStage::new(
                Arc::clone(&services.quotas),
                config.limits.quota.default_estimate_tokens,
            )));
        }
        None if config.limits.quota.enabled => {
            tracing::warn!("Quota admission skipped: no database configured");
        }
        _ => {}
    }

    Pipeline::new(stages)
}

pub fn build_app(config: &GatewayConfig, state: AppState) -> Router {
    build_app_with(config, state, Router::new())
}

/// Gateway router with `app_routes` mounted under `/api/v1` behind the
/// admission pipeline. Those handlers report usage through a
/// [`middleware::UsageReport`] response extension or the `X-Tokens-*` headers.
///
/// Layers, outermost first: panic recovery, CORS, request logging and
/// request id, body limit, then the pipeline around the routes. CORS
/// preflights are answered before logging or any stage runs.
pub fn build_app_with(
    config: &GatewayConfig,
    state: AppState,
    app_routes: Router<AppState>,
) -> Router {
    let mut app = Router::new()
        .merge(routes::health_routes())
        .nest("/api/v1", routes::api_routes().merge(app_routes))
        .layer(from_fn_with_state(
            state.clone(),
            middleware::gateway_middleware,
        ))
        .layer(RequestBodyLimitLayer::new(config.server.body_limit_bytes))
        .layer(from_fn(middleware::request_id_middleware))
        .layer(TraceLayer::new_for_http());

    if let Some(cors) = config.server.cors.clone().into_layer() {
        app = app.layer(cors);
    }

    app.layer(CatchPanicLayer::custom(middleware::panic_response))
        .with_state(state)
}

/// Periodically drop rate limiter buckets that have been idle past their TTL.
pub fn spawn_idle_sweeper(
    limiter: Arc<RateLimiter>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let removed = limiter.sweep_idle(std::time::Instant::now());
            if removed > 0 {
                tracing::debug!(
                    removed,
                    remaining = limiter.len(),
                    "Swept idle rate limit buckets"
                );
            }
        }
    })
}
