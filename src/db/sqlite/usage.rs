use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use crate::{
    db::{error::DbResult, repos::UsageMetricRepo},
    models::{EndpointUsage, ModelUsage, UsageTotals},
    pricing::microcents_to_dollars,
};

pub struct SqliteUsageMetricRepo {
    pool: SqlitePool,
}

impl SqliteUsageMetricRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

/// `created_at >= ?` filter. All-time windows bind the epoch.
fn window_start(since: Option<DateTime<Utc>>) -> DateTime<Utc> {
    since.unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

#[async_trait]
impl UsageMetricRepo for SqliteUsageMetricRepo {
    async fn totals(&self, user_id: &str, since: Option<DateTime<Utc>>) -> DbResult<UsageTotals> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total_requests,
                COALESCE(SUM(CASE WHEN success != 0 THEN 1 ELSE 0 END), 0) AS successful_requests,
                COALESCE(SUM(tokens_input), 0) AS tokens_input,
                COALESCE(SUM(tokens_output), 0) AS tokens_output,
                COALESCE(SUM(tokens_total), 0) AS tokens_total,
                COALESCE(SUM(cost_microcents), 0) AS cost_microcents,
                COALESCE(AVG(CAST(duration_ms AS REAL)), 0.0) AS average_duration_ms
            FROM usage_metrics
            WHERE user_id = ? AND created_at >= ?
            "#,
        )
        .bind(user_id)
        .bind(window_start(since))
        .fetch_one(&self.pool)
        .await?;

        Ok(UsageTotals {
            total_requests: row.get("total_requests"),
            successful_requests: row.get("successful_requests"),
            tokens_input: row.get("tokens_input"),
            tokens_output: row.get("tokens_output"),
            tokens_total: row.get("tokens_total"),
            cost_microcents: row.get("cost_microcents"),
            average_duration_ms: row.get("average_duration_ms"),
        })
    }

    async fn by_model(
        &self,
        user_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> DbResult<Vec<ModelUsage>> {
        let rows = sqlx::query(
            r#"
            SELECT model_used, COUNT(*) AS requests, COALESCE(SUM(tokens_total), 0) AS tokens
            FROM usage_metrics
            WHERE user_id = ? AND created_at >= ?
            GROUP BY model_used
            ORDER BY requests DESC, model_used ASC
            "#,
        )
        .bind(user_id)
        .bind(window_start(since))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| ModelUsage {
                model: row.get("model_used"),
                requests: row.get("requests"),
                tokens: row.get("tokens"),
            })
            .collect())
    }

    async fn by_endpoint(
        &self,
        user_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> DbResult<Vec<EndpointUsage>> {
        let rows = sqlx::query(
            r#"
            SELECT
                endpoint,
                COUNT(*) AS requests,
                COALESCE(SUM(tokens_total), 0) AS tokens,
                COALESCE(SUM(cost_microcents), 0) AS cost_microcents,
                COALESCE(SUM(CASE WHEN success != 0 THEN 1 ELSE 0 END), 0) AS successes
            FROM usage_metrics
            WHERE user_id = ? AND created_at >= ?
            GROUP BY endpoint
            ORDER BY requests DESC, endpoint ASC
            "#,
        )
        .bind(user_id)
        .bind(window_start(since))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let requests: i64 = row.get("requests");
                let successes: i64 = row.get("successes");
                EndpointUsage {
                    endpoint: row.get("endpoint"),
                    requests,
                    tokens: row.get("tokens"),
                    cost_usd: microcents_to_dollars(row.get("cost_microcents")),
                    success_rate: if requests > 0 {
                        successes as f64 / requests as f64 * 100.0
                    } else {
                        0.0
                    },
                }
            })
            .collect())
    }
}
