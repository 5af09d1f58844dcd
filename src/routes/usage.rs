use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use axum_valid::Valid;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use validator::Validate;

use super::{acting_user, error::ApiError, get_services};
use crate::{
    AppState,
    middleware::RequireAuth,
    models::{
        NewUsageMetric, QuotaStatus, RequestType, UpdateQuota, UsageDashboard, UsagePeriod,
        UsageSummary,
    },
    pricing::DEFAULT_MODEL,
};

#[derive(Debug, Default, Deserialize)]
pub struct UserQuery {
    /// Target user. Admins only.
    pub user_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SummaryQuery {
    pub user_id: Option<String>,
    #[serde(default)]
    pub period: UsagePeriod,
}

/// Manual usage record, for backends that meter outside the gateway.
#[derive(Debug, Deserialize, Validate)]
pub struct TrackUsageRequest {
    pub user_id: Option<String>,
    pub request_type: RequestType,
    #[validate(length(max = 256))]
    pub resource_id: Option<String>,
    #[serde(default)]
    #[validate(range(min = 0))]
    pub tokens_input: i64,
    #[serde(default)]
    #[validate(range(min = 0))]
    pub tokens_output: i64,
    #[validate(length(min = 1, max = 128))]
    pub model_used: Option<String>,
    #[serde(default)]
    #[validate(length(max = 512))]
    pub endpoint: String,
    #[serde(default)]
    #[validate(range(min = 0))]
    pub duration_ms: i64,
    #[serde(default = "default_success")]
    pub success: bool,
    #[validate(length(max = 2048))]
    pub error_message: Option<String>,
}

fn default_success() -> bool {
    true
}

#[derive(Debug, Serialize)]
pub struct TrackUsageResponse {
    pub id: i64,
    pub cost_usd: f64,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CheckQuotaRequest {
    pub user_id: Option<String>,
    #[validate(range(min = 1))]
    pub tokens_needed: i64,
    pub model_name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CheckQuotaResponse {
    pub has_quota: bool,
    pub user_id: String,
    pub tokens_needed: i64,
}

/// Current quota status for the caller (or `?user_id=` for admins).
#[tracing::instrument(name = "usage.quota", skip_all)]
pub async fn quota(
    State(state): State<AppState>,
    RequireAuth(identity): RequireAuth,
    Query(query): Query<UserQuery>,
) -> Result<Json<QuotaStatus>, ApiError> {
    let services = get_services(&state)?;
    let user_id = acting_user(&identity, query.user_id.as_deref())?;
    Ok(Json(services.quotas.quota_status(&user_id).await?))
}

#[tracing::instrument(name = "usage.summary", skip_all)]
pub async fn summary(
    State(state): State<AppState>,
    RequireAuth(identity): RequireAuth,
    Query(query): Query<SummaryQuery>,
) -> Result<Json<UsageSummary>, ApiError> {
    let services = get_services(&state)?;
    let user_id = acting_user(&identity, query.user_id.as_deref())?;
    Ok(Json(
        services
            .quotas
            .usage_summary(&user_id, query.period)
            .await?,
    ))
}

#[tracing::instrument(name = "usage.track", skip_all)]
pub async fn track(
    State(state): State<AppState>,
    RequireAuth(identity): RequireAuth,
    Valid(Json(input)): Valid<Json<TrackUsageRequest>>,
) -> Result<(StatusCode, Json<TrackUsageResponse>), ApiError> {
    let services = get_services(&state)?;
    let user_id = acting_user(&identity, input.user_id.as_deref())?;
    let model = input
        .model_used
        .unwrap_or_else(|| DEFAULT_MODEL.to_string());
    let cost_microcents =
        services
            .quotas
            .calculate_cost(&model, input.tokens_input, input.tokens_output);

    let recorded = services
        .quotas
        .track_usage(NewUsageMetric {
            user_id,
            request_type: input.request_type,
            resource_id: input.resource_id,
            tokens_input: input.tokens_input,
            tokens_output: input.tokens_output,
            model_used: model,
            cost_microcents,
            duration_ms: input.duration_ms,
            endpoint: input.endpoint,
            success: input.success,
            error_message: input.error_message,
        })
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(TrackUsageResponse {
            id: recorded.metric_id,
            cost_usd: crate::pricing::microcents_to_dollars(cost_microcents),
        }),
    ))
}

/// Read-only quota check. Reserves nothing.
#[tracing::instrument(name = "usage.check_quota", skip_all)]
pub async fn check_quota(
    State(state): State<AppState>,
    RequireAuth(identity): RequireAuth,
    Valid(Json(input)): Valid<Json<CheckQuotaRequest>>,
) -> Result<Json<CheckQuotaResponse>, ApiError> {
    let services = get_services(&state)?;
    let user_id = acting_user(&identity, input.user_id.as_deref())?;
    let model = input.model_name.as_deref().unwrap_or(DEFAULT_MODEL);

    let has_quota = services
        .quotas
        .check_quota(&user_id, input.tokens_needed, model)
        .await?;

    Ok(Json(CheckQuotaResponse {
        has_quota,
        user_id,
        tokens_needed: input.tokens_needed,
    }))
}

/// Admin: change a user's ceilings. Omitted fields keep their value.
#[tracing::instrument(name = "usage.update_quota", skip_all, fields(user_id = %user_id))]
pub async fn update_quota(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Valid(Json(input)): Valid<Json<UpdateQuota>>,
) -> Result<Json<QuotaStatus>, ApiError> {
    let services = get_services(&state)?;
    let quota = services.quotas.update_quota(&user_id, &input).await?;
    Ok(Json(quota.status(Utc::now())))
}

#[tracing::instrument(name = "usage.dashboard", skip_all)]
pub async fn dashboard(
    State(state): State<AppState>,
    RequireAuth(identity): RequireAuth,
    Query(query): Query<UserQuery>,
) -> Result<Json<UsageDashboard>, ApiError> {
    let services = get_services(&state)?;
    let user_id = acting_user(&identity, query.user_id.as_deref())?;
    Ok(Json(services.quotas.dashboard(&user_id).await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_request_defaults() {
        let input: TrackUsageRequest =
            serde_json::from_str(r#"{"request_type": "chat", "tokens_input": 10}"#).unwrap();
        assert!(input.success);
        assert_eq!(input.tokens_output, 0);
        assert!(input.validate().is_ok());

        let bad: TrackUsageRequest =
            serde_json::from_str(r#"{"request_type": "chat", "tokens_input": -1}"#).unwrap();
        assert!(bad.validate().is_err());

        assert!(serde_json::from_str::<TrackUsageRequest>(r#"{"request_type": "video"}"#).is_err());
    }

    #[test]
    fn test_summary_period_query() {
        let q: SummaryQuery = serde_json::from_str(r#"{"period": "all_time"}"#).unwrap();
        assert_eq!(q.period, UsagePeriod::AllTime);
        let q: SummaryQuery = serde_json::from_str("{}").unwrap();
        assert_eq!(q.period, UsagePeriod::Monthly);
    }
}
