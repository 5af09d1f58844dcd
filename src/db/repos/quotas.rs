use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    db::error::DbResult,
    models::{NewUsageMetric, QuotaLimits, UpdateQuota, UsageQuota},
};

/// Result of appending a usage record.
#[derive(Debug, Clone)]
pub struct RecordedUsage {
    /// Id of the appended metering row
    pub metric_id: i64,
    /// Quota after the increment. `None` for failed requests, which are logged but not charged.
    pub quota: Option<UsageQuota>,
}

/// Per-user quota rows.
///
/// Every method that reads a row first rolls over elapsed periods and
/// persists the reset, inside the same transaction as any other change.
#[async_trait]
pub trait QuotaRepo: Send + Sync {
    /// Fetch the user's row, creating it with `defaults` if absent and
    /// resetting any period that ended before `now`.
    async fn load_current(
        &self,
        user_id: &str,
        defaults: &QuotaLimits,
        now: DateTime<Utc>,
    ) -> DbResult<UsageQuota>;

    /// Append `metric` to the metering log and, if the request succeeded,
    /// roll over and increment the user's counters. One transaction.
    async fn record_usage(
        &self,
        metric: &NewUsageMetric,
        defaults: &QuotaLimits,
        now: DateTime<Utc>,
    ) -> DbResult<RecordedUsage>;

    /// Change the user's ceilings. Counters are untouched.
    async fn update_limits(
        &self,
        user_id: &str,
        update: &UpdateQuota,
        defaults: &QuotaLimits,
        now: DateTime<Utc>,
    ) -> DbResult<UsageQuota>;
}
