use std::sync::Arc;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::{
    api_types::ErrorResponse,
    db::{DbError, DbPool, RecordedUsage},
    models::{
        Consumption, NewUsageMetric, QuotaLimits, QuotaStatus, UpdateQuota, UsageDashboard,
        UsagePeriod, UsageQuota, UsageSummary,
    },
    observability::metrics,
    pricing::{PricingTable, microcents_to_dollars},
};

pub const QUOTA_EXCEEDED_MESSAGE: &str = "You have exceeded your daily or monthly token/cost limit. Please try again later or contact support to increase your quota.";

#[derive(Debug, Error)]
pub enum QuotaError {
    #[error("{}", QUOTA_EXCEEDED_MESSAGE)]
    Exceeded,

    #[error("Database error: {0}")]
    Database(#[from] DbError),
}

impl IntoResponse for QuotaError {
    fn into_response(self) -> Response {
        let (status, error_type, code, message) = match &self {
            QuotaError::Exceeded => (
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limit_error",
                "QUOTA_EXCEEDED",
                QUOTA_EXCEEDED_MESSAGE.to_string(),
            ),
            QuotaError::Database(e) => {
                tracing::error!(error = %e, "Quota lookup failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "server_error",
                    "internal_error",
                    "Internal server error".to_string(),
                )
            }
        };

        metrics::record_gateway_error(error_type, code);

        let body = ErrorResponse::with_type(error_type, code, message);
        (status, Json(body)).into_response()
    }
}

/// Tokens and cost provisionally deducted from a user's quota.
///
/// Outstanding reservations count against the ceilings in later admission
/// checks. The amount is released when the usage is recorded, or when the
/// reservation is dropped unsettled.
#[derive(Debug)]
pub struct QuotaReservation {
    user_id: String,
    amount: Consumption,
    pending: Arc<DashMap<String, Consumption>>,
    released: bool,
}

impl QuotaReservation {
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn amount(&self) -> Consumption {
        self.amount
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        if let Some(mut entry) = self.pending.get_mut(&self.user_id) {
            *entry = entry.saturating_sub(self.amount);
        }
        self.pending
            .remove_if(&self.user_id, |_, left| *left == Consumption::default());
    }
}

impl Drop for QuotaReservation {
    fn drop(&mut self) {
        self.release();
    }
}

/// Holds a user's quota lock. The map entry is pruned on drop once no one
/// else is waiting on it.
struct UserLockGuard<'a> {
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    user_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for UserLockGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.locks
            .remove_if(&self.user_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Quota admission and usage metering.
///
/// Every read-modify-write of a user's quota (rollover, check, reserve,
/// increment) runs under that user's async lock, and the database side of it
/// inside one transaction.
pub struct QuotaService {
    db: Arc<DbPool>,
    pricing: PricingTable,
    defaults: QuotaLimits,
    locks: DashMap<String, Arc<Mutex<()>>>,
    pending: Arc<DashMap<String, Consumption>>,
}

impl QuotaService {
    pub fn new(db: Arc<DbPool>, pricing: PricingTable, defaults: QuotaLimits) -> Self {
        Self {
            db,
            pricing,
            defaults,
            locks: DashMap::new(),
            pending: Arc::new(DashMap::new()),
        }
    }

    pub fn pricing(&self) -> &PricingTable {
        &self.pricing
    }

    /// Cost in microcents of `input_tokens` and `output_tokens` at `model`'s price.
    pub fn calculate_cost(&self, model: &str, input_tokens: i64, output_tokens: i64) -> i64 {
        self.pricing.calculate_cost(model, input_tokens, output_tokens)
    }

    async fn lock_user(&self, user_id: &str) -> UserLockGuard<'_> {
        let lock = self.locks.entry(user_id.to_string()).or_default().clone();
        let guard = lock.lock_owned().await;
        UserLockGuard {
            locks: &self.locks,
            user_id: user_id.to_string(),
            guard: Some(guard),
        }
    }

    fn pending_for(&self, user_id: &str) -> Consumption {
        self.pending
            .get(user_id)
            .map(|entry| *entry)
            .unwrap_or_default()
    }

    fn estimate(&self, tokens_needed: i64, model: &str) -> Consumption {
        let tokens = tokens_needed.max(0);
        Consumption::new(tokens, self.pricing.estimate_cost(model, tokens))
    }

    /// Whether `tokens_needed` more tokens of `model` fit in the user's quota right now.
    pub async fn check_quota(
        &self,
        user_id: &str,
        tokens_needed: i64,
        model: &str,
    ) -> Result<bool, QuotaError> {
        self.check_quota_at(user_id, tokens_needed, model, Utc::now())
            .await
    }

    pub async fn check_quota_at(
        &self,
        user_id: &str,
        tokens_needed: i64,
        model: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, QuotaError> {
        let _lock = self.lock_user(user_id).await;
        let quota = self
            .db
            .quotas()
            .load_current(user_id, &self.defaults, now)
            .await?;
        let allowed = !quota.would_exceed(
            self.pending_for(user_id),
            self.estimate(tokens_needed, model),
        );
        metrics::record_quota_check(allowed);
        Ok(allowed)
    }

    /// Check the quota and provisionally deduct the estimate in one step.
    pub async fn reserve(
        &self,
        user_id: &str,
        tokens_needed: i64,
        model: &str,
    ) -> Result<QuotaReservation, QuotaError> {
        self.reserve_at(user_id, tokens_needed, model, Utc::now())
            .await
    }

    pub async fn reserve_at(
        &self,
        user_id: &str,
        tokens_needed: i64,
        model: &str,
        now: DateTime<Utc>,
    ) -> Result<QuotaReservation, QuotaError> {
        let _lock = self.lock_user(user_id).await;
        let quota = self
            .db
            .quotas()
            .load_current(user_id, &self.defaults, now)
            .await?;

        let estimate = self.estimate(tokens_needed, model);
        if quota.would_exceed(self.pending_for(user_id), estimate) {
            metrics::record_quota_check(false);
            tracing::info!(
                user_id,
                tokens_needed,
                model,
                daily_tokens_used = quota.daily_tokens_used,
                monthly_tokens_used = quota.monthly_tokens_used,
                "Quota exceeded"
            );
            return Err(QuotaError::Exceeded);
        }

        self.pending
            .entry(user_id.to_string())
            .and_modify(|p| *p = p.saturating_add(estimate))
            .or_insert(estimate);
        metrics::record_quota_check(true);

        Ok(QuotaReservation {
            user_id: user_id.to_string(),
            amount: estimate,
            pending: Arc::clone(&self.pending),
            released: false,
        })
    }

    /// Append a usage record and charge it to the quota, settling `reservation` if given.
    pub async fn record(
        &self,
        metric: NewUsageMetric,
        reservation: Option<QuotaReservation>,
    ) -> Result<RecordedUsage, QuotaError> {
        self.record_at(metric, reservation, Utc::now()).await
    }

    pub async fn record_at(
        &self,
        metric: NewUsageMetric,
        reservation: Option<QuotaReservation>,
        now: DateTime<Utc>,
    ) -> Result<RecordedUsage, QuotaError> {
        let _lock = self.lock_user(&metric.user_id).await;
        if let Some(mut reservation) = reservation {
            reservation.release();
        }

        let recorded = self
            .db
            .quotas()
            .record_usage(&metric, &self.defaults, now)
            .await?;

        metrics::record_usage(
            metric.request_type.as_str(),
            &metric.model_used,
            metric.tokens_total(),
            metric.cost_microcents,
            metric.success,
        );
        tracing::debug!(
            user_id = %metric.user_id,
            request_type = %metric.request_type,
            model = %metric.model_used,
            tokens = metric.tokens_total(),
            cost_microcents = metric.cost_microcents,
            success = metric.success,
            "Usage recorded"
        );
        Ok(recorded)
    }

    /// Record usage with no prior reservation.
    pub async fn track_usage(&self, metric: NewUsageMetric) -> Result<RecordedUsage, QuotaError> {
        self.record(metric, None).await
    }

    pub async fn quota_status(&self, user_id: &str) -> Result<QuotaStatus, QuotaError> {
        self.quota_status_at(user_id, Utc::now()).await
    }

    pub async fn quota_status_at(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<QuotaStatus, QuotaError> {
        let _lock = self.lock_user(user_id).await;
        let quota = self
            .db
            .quotas()
            .load_current(user_id, &self.defaults, now)
            .await?;
        Ok(quota.status(now))
    }

    pub async fn update_quota(
        &self,
        user_id: &str,
        update: &UpdateQuota,
    ) -> Result<UsageQuota, QuotaError> {
        let _lock = self.lock_user(user_id).await;
        let quota = self
            .db
            .quotas()
            .update_limits(user_id, update, &self.defaults, Utc::now())
            .await?;
        tracing::info!(user_id, "Quota limits updated");
        Ok(quota)
    }

    pub async fn usage_summary(
        &self,
        user_id: &str,
        period: UsagePeriod,
    ) -> Result<UsageSummary, QuotaError> {
        self.usage_summary_at(user_id, period, Utc::now()).await
    }

    pub async fn usage_summary_at(
        &self,
        user_id: &str,
        period: UsagePeriod,
        now: DateTime<Utc>,
    ) -> Result<UsageSummary, QuotaError> {
        let since = period.start(now);
        let repo = self.db.usage();
        let totals = repo.totals(user_id, since).await?;
        let by_model = repo.by_model(user_id, since).await?;
        let by_endpoint = repo.by_endpoint(user_id, since).await?;

        Ok(UsageSummary {
            user_id: user_id.to_string(),
            period,
            total_requests: totals.total_requests,
            successful_requests: totals.successful_requests,
            failed_requests: totals.total_requests - totals.successful_requests,
            tokens_input: totals.tokens_input,
            tokens_output: totals.tokens_output,
            total_tokens: totals.tokens_total,
            total_cost_usd: microcents_to_dollars(totals.cost_microcents),
            average_duration_ms: totals.average_duration_ms,
            by_model,
            by_endpoint,
        })
    }

    pub async fn dashboard(&self, user_id: &str) -> Result<UsageDashboard, QuotaError> {
        let now = Utc::now();
        Ok(UsageDashboard {
            quota: self.quota_status_at(user_id, now).await?,
            daily: self
                .usage_summary_at(user_id, UsagePeriod::Daily, now)
                .await?,
            monthly: self
                .usage_summary_at(user_id, UsagePeriod::Monthly, now)
                .await?,
        })
    }
}

#[cfg(all(test, feature = "database-sqlite"))]
mod tests {
    use super::*;
    use crate::{db::tests::harness::create_sqlite_db, models::RequestType};

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn limits() -> QuotaLimits {
        QuotaLimits {
            daily_token_limit: 10_000_000,
            monthly_token_limit: 1_000_000,
            daily_cost_limit_microcents: 10_000_000,
            monthly_cost_limit_microcents: 300_000_000,
        }
    }

    async fn service(limits: QuotaLimits) -> QuotaService {
        let db = Arc::new(create_sqlite_db().await);
        QuotaService::new(db, PricingTable::default(), limits)
    }

    fn metric(user_id: &str, tokens: i64, success: bool) -> NewUsageMetric {
        NewUsageMetric {
            user_id: user_id.to_string(),
            request_type: RequestType::Chat,
            resource_id: None,
            tokens_input: tokens,
            tokens_output: 0,
            model_used: "default".to_string(),
            cost_microcents: 0,
            duration_ms: 10,
            endpoint: "/api/v1/chat".to_string(),
            success,
            error_message: None,
        }
    }

    #[tokio::test]
    async fn test_monthly_ceiling_near_limit() {
        let svc = service(limits()).await;
        let now = at("2025-03-10T12:00:00Z");
        svc.record_at(metric("u", 999_500, true), None, now)
            .await
            .unwrap();

        assert!(
            !svc.check_quota_at("u", 1_000, "default", now)
                .await
                .unwrap()
        );
        assert!(svc.check_quota_at("u", 400, "default", now).await.unwrap());

        let err = svc.reserve_at("u", 1_000, "default", now).await.unwrap_err();
        assert!(matches!(err, QuotaError::Exceeded));
        assert!(svc.reserve_at("u", 400, "default", now).await.is_ok());
    }

    #[tokio::test]
    async fn test_rollover_after_idle_boundary() {
        let svc = service(limits()).await;
        svc.record_at(metric("u", 999_500, true), None, at("2025-01-31T10:00:00Z"))
            .await
            .unwrap();

        let later = at("2025-03-15T08:00:00Z");
        let reservation = svc.reserve_at("u", 1_000, "default", later).await;
        assert!(reservation.is_ok());

        let status = svc.quota_status_at("u", later).await.unwrap();
        assert_eq!(status.monthly.tokens_used, 0);
        assert_eq!(status.monthly.resets_at, at("2025-04-01T00:00:00Z"));
    }

    #[tokio::test]
    async fn test_reservations_count_until_recorded() {
        let svc = service(limits()).await;
        let now = at("2025-03-10T12:00:00Z");

        let first = svc.reserve_at("u", 600_000, "default", now).await.unwrap();
        assert_eq!(first.amount().tokens, 600_000);
        assert!(matches!(
            svc.reserve_at("u", 600_000, "default", now).await,
            Err(QuotaError::Exceeded)
        ));

        // Actual usage was smaller than the estimate
        svc.record_at(metric("u", 100_000, true), Some(first), now)
            .await
            .unwrap();
        assert!(svc.reserve_at("u", 600_000, "default", now).await.is_ok());
    }

    #[tokio::test]
    async fn test_dropped_reservation_is_released() {
        let svc = service(limits()).await;
        let now = at("2025-03-10T12:00:00Z");

        let reservation = svc.reserve_at("u", 900_000, "default", now).await.unwrap();
        assert!(!svc.check_quota_at("u", 200_000, "default", now).await.unwrap());
        drop(reservation);
        assert!(svc.check_quota_at("u", 200_000, "default", now).await.unwrap());
        assert!(svc.pending.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_reservations_respect_ceiling() {
        let svc = Arc::new(
            service(QuotaLimits {
                daily_token_limit: 10_000,
                ..limits()
            })
            .await,
        );

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let svc = Arc::clone(&svc);
                tokio::spawn(async move { svc.reserve("u", 4_000, "default").await })
            })
            .collect();

        let mut granted = Vec::new();
        for handle in handles {
            if let Ok(reservation) = handle.await.unwrap() {
                granted.push(reservation);
            }
        }
        assert_eq!(granted.len(), 2);
        assert_eq!(svc.pending_for("u").tokens, 8_000);
        assert!(svc.locks.is_empty());
    }

    #[tokio::test]
    async fn test_cost_ceiling_denies() {
        let svc = service(QuotaLimits {
            daily_cost_limit_microcents: 1_000,
            ..limits()
        })
        .await;
        let now = at("2025-03-10T12:00:00Z");

        // gpt-4 is $30/$60 per 1M tokens: 100 tokens cost 4_500 microcents
        assert!(!svc.check_quota_at("u", 100, "gpt-4", now).await.unwrap());
        assert!(svc.check_quota_at("u", 100, "codellama-34b", now).await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_usage_not_charged() {
        let svc = service(limits()).await;
        let now = at("2025-03-10T12:00:00Z");
        svc.record_at(metric("u", 5_000, false), None, now)
            .await
            .unwrap();

        let status = svc.quota_status_at("u", now).await.unwrap();
        assert_eq!(status.daily.tokens_used, 0);

        let summary = svc
            .usage_summary_at("u", UsagePeriod::Daily, now)
            .await
            .unwrap();
        assert_eq!(summary.total_requests, 1);
        assert_eq!(summary.failed_requests, 1);
    }

    #[tokio::test]
    async fn test_summary_windows() {
        let svc = service(limits()).await;
        svc.record_at(metric("u", 100, true), None, at("2025-03-01T09:00:00Z"))
            .await
            .unwrap();
        svc.record_at(metric("u", 50, true), None, at("2025-03-10T09:00:00Z"))
            .await
            .unwrap();

        let now = at("2025-03-10T12:00:00Z");
        let daily = svc
            .usage_summary_at("u", UsagePeriod::Daily, now)
            .await
            .unwrap();
        assert_eq!(daily.total_tokens, 50);

        let monthly = svc
            .usage_summary_at("u", UsagePeriod::Monthly, now)
            .await
            .unwrap();
        assert_eq!(monthly.total_tokens, 150);
        assert_eq!(monthly.by_model[0].model, "default");
        assert_eq!(monthly.by_endpoint[0].success_rate, 100.0);
    }

    #[tokio::test]
    async fn test_update_quota() {
        let svc = service(limits()).await;
        let quota = svc
            .update_quota(
                "u",
                &UpdateQuota {
                    daily_token_limit: Some(5),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(quota.daily_token_limit, 5);
        assert!(!svc.check_quota("u", 6, "default").await.unwrap());
    }

    #[test]
    fn test_exceeded_response() {
        let response = QuotaError::Exceeded.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }
}
