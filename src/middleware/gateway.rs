//! Runs the admission pipeline around every request and meters the result.

use std::{net::SocketAddr, time::Instant};

use axum::{
    extract::{ConnectInfo, MatchedPath, Request, State},
    http::{HeaderMap, HeaderValue, header::SET_COOKIE},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tower_cookies::Cookie;

use super::{add_rate_limit_headers, extract_client_ip_from_parts};
use crate::{
    AppState,
    models::{NewUsageMetric, RequestType},
    observability::metrics,
    pipeline::RequestContext,
    pricing::DEFAULT_MODEL,
    services::{QuotaReservation, QuotaService},
};

pub const TOKENS_INPUT_HEADER: &str = "X-Tokens-Input";
pub const TOKENS_OUTPUT_HEADER: &str = "X-Tokens-Output";
pub const MODEL_USED_HEADER: &str = "X-Model-Used";
pub const RESOURCE_ID_HEADER: &str = "X-Resource-Id";

/// Paths never metered or quota-checked.
const UNMETERED_PATHS: &[&str] = &["/health", "/"];

/// Usage a handler reports for the request it served.
///
/// Handlers insert this into the response extensions. Handlers that proxy to
/// another service can instead set the `X-Tokens-*`, `X-Model-Used` and
/// `X-Resource-Id` response headers; those are stripped before the response
/// leaves the gateway.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsageReport {
    pub tokens_input: i64,
    pub tokens_output: i64,
    pub model: Option<String>,
    pub resource_id: Option<String>,
    pub error_message: Option<String>,
}

impl UsageReport {
    /// Read a report from response headers, removing them.
    pub fn take_from_headers(headers: &mut HeaderMap) -> Option<Self> {
        let tokens_input = take_header(headers, TOKENS_INPUT_HEADER);
        let tokens_output = take_header(headers, TOKENS_OUTPUT_HEADER);
        let model = take_header(headers, MODEL_USED_HEADER);
        let resource_id = take_header(headers, RESOURCE_ID_HEADER);

        if tokens_input.is_none() && tokens_output.is_none() && model.is_none() {
            return None;
        }

        Some(Self {
            tokens_input: parse_tokens(tokens_input.as_deref()),
            tokens_output: parse_tokens(tokens_output.as_deref()),
            model,
            resource_id,
            error_message: None,
        })
    }
}

fn take_header(headers: &mut HeaderMap, name: &str) -> Option<String> {
    headers
        .remove(name)
        .and_then(|v| v.to_str().ok().map(|s| s.trim().to_string()))
        .filter(|s| !s.is_empty())
}

fn parse_tokens(value: Option<&str>) -> i64 {
    value
        .and_then(|v| v.parse::<i64>().ok())
        .map(|n| n.max(0))
        .unwrap_or(0)
}

/// Everything the metering step needs once the handler has run.
#[derive(Debug)]
pub struct MeteredRequest {
    pub user_id: String,
    pub request_type: RequestType,
    pub endpoint: String,
    pub duration_ms: i64,
}

impl MeteredRequest {
    /// Build the usage record for a finished request.
    pub fn into_metric(
        self,
        response: &mut Response,
        quotas: &QuotaService,
    ) -> NewUsageMetric {
        let report = response
            .extensions_mut()
            .remove::<UsageReport>()
            .or_else(|| UsageReport::take_from_headers(response.headers_mut()))
            .unwrap_or_default();

        let status = response.status();
        let success = status.as_u16() < 400;
        let model = report.model.unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let error_message = if success {
            None
        } else {
            report.error_message.or_else(|| {
                Some(
                    status
                        .canonical_reason()
                        .unwrap_or("Request failed")
                        .to_string(),
                )
            })
        };

        NewUsageMetric {
            cost_microcents: quotas.calculate_cost(
                &model,
                report.tokens_input,
                report.tokens_output,
            ),
            user_id: self.user_id,
            request_type: self.request_type,
            resource_id: report.resource_id,
            tokens_input: report.tokens_input,
            tokens_output: report.tokens_output,
            model_used: model,
            duration_ms: self.duration_ms,
            endpoint: self.endpoint,
            success,
            error_message,
        }
    }
}

pub fn is_metered_path(path: &str) -> bool {
    !UNMETERED_PATHS.contains(&path)
}

/// Admission pipeline, handler, then metering.
///
/// Cookies minted by the pipeline are set on the response whether or not the
/// request was admitted. Usage is written on a tracked background task so the
/// response is not held up by the database.
pub async fn gateway_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Response {
    let start = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| path.clone());

    let connecting_addr = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0);
    let client_ip = extract_client_ip_from_parts(
        req.headers(),
        connecting_addr,
        &state.config.server.trusted_proxies,
    );

    let mut ctx = RequestContext::new(method.clone(), path.clone(), req.headers().clone())
        .with_client_ip(client_ip);
    if !is_metered_path(&path) {
        ctx.request_type = None;
    }

    let mut response = match state.pipeline.evaluate(&mut ctx).await {
        Err((_stage, rejection)) => rejection.into_response(),
        Ok(()) => {
            if let Some(identity) = ctx.identity.clone() {
                req.extensions_mut().insert(identity);
            }
            let mut response = next.run(req).await;

            let reservation = ctx.reservation.take();
            if let (Some(identity), Some(request_type)) = (&ctx.identity, ctx.request_type) {
                let metered = MeteredRequest {
                    user_id: identity.user_id.clone(),
                    request_type,
                    endpoint: path.clone(),
                    duration_ms: start.elapsed().as_millis() as i64,
                };
                dispatch_usage(&state, metered, &mut response, reservation);
            }
            response
        }
    };

    append_cookies(response.headers_mut(), &ctx.set_cookies);
    if let Some(decision) = &ctx.rate_limit {
        response = add_rate_limit_headers(response, decision);
    }

    metrics::record_http_request(
        method.as_str(),
        &route,
        response.status().as_u16(),
        start.elapsed().as_secs_f64(),
    );
    response
}

fn dispatch_usage(
    state: &AppState,
    metered: MeteredRequest,
    response: &mut Response,
    reservation: Option<QuotaReservation>,
) {
    let Some(services) = &state.services else {
        return;
    };
    let quotas = services.quotas.clone();
    let metric = metered.into_metric(response, &quotas);

    state.task_tracker.spawn(async move {
        let user_id = metric.user_id.clone();
        if let Err(e) = quotas.record(metric, reservation).await {
            metrics::record_usage_write_failure();
            tracing::error!(user_id = %user_id, error = %e, "Failed to record usage");
        }
    });
}

fn append_cookies(headers: &mut HeaderMap, cookies: &[Cookie<'static>]) {
    for cookie in cookies {
        match HeaderValue::from_str(&cookie.to_string()) {
            Ok(value) => {
                headers.append(SET_COOKIE, value);
            }
            Err(e) => tracing::warn!(cookie = cookie.name(), error = %e, "Unencodable cookie"),
        }
    }
}
