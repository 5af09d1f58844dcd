use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    db::error::DbResult,
    models::{EndpointUsage, ModelUsage, UsageTotals},
};

/// Read side of the append-only metering log.
///
/// Writes go through [`QuotaRepo::record_usage`](super::QuotaRepo::record_usage)
/// so the record and the counter increment share a transaction.
/// `since = None` covers all time.
#[async_trait]
pub trait UsageMetricRepo: Send + Sync {
    async fn totals(&self, user_id: &str, since: Option<DateTime<Utc>>) -> DbResult<UsageTotals>;

    /// Requests and tokens per model, most used first.
    async fn by_model(
        &self,
        user_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> DbResult<Vec<ModelUsage>>;

    /// Requests, tokens, cost and success rate per endpoint, most used first.
    async fn by_endpoint(
        &self,
        user_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> DbResult<Vec<EndpointUsage>>;
}
