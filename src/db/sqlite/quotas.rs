use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqliteConnection, SqlitePool, sqlite::SqliteRow};

use crate::{
    db::{
        error::{DbError, DbResult},
        repos::{QuotaRepo, RecordedUsage},
    },
    models::{NewUsageMetric, QuotaLimits, UpdateQuota, UsageQuota},
};

const QUOTA_COLUMNS: &str = r#"
    user_id, daily_token_limit, monthly_token_limit,
    daily_cost_limit_microcents, monthly_cost_limit_microcents,
    daily_tokens_used, monthly_tokens_used,
    daily_cost_used_microcents, monthly_cost_used_microcents,
    last_reset_daily, last_reset_monthly, created_at, updated_at
"#;

pub struct SqliteQuotaRepo {
    pool: SqlitePool,
}

impl SqliteQuotaRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_quota(row: &SqliteRow) -> UsageQuota {
        UsageQuota {
            user_id: row.get("user_id"),
            daily_token_limit: row.get("daily_token_limit"),
            monthly_token_limit: row.get("monthly_token_limit"),
            daily_cost_limit_microcents: row.get("daily_cost_limit_microcents"),
            monthly_cost_limit_microcents: row.get("monthly_cost_limit_microcents"),
            daily_tokens_used: row.get("daily_tokens_used"),
            monthly_tokens_used: row.get("monthly_tokens_used"),
            daily_cost_used_microcents: row.get("daily_cost_used_microcents"),
            monthly_cost_used_microcents: row.get("monthly_cost_used_microcents"),
            last_reset_daily: row.get("last_reset_daily"),
            last_reset_monthly: row.get("last_reset_monthly"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        }
    }

    /// Insert a default row if none exists, then read it back with periods rolled over.
    ///
    /// The insert comes first so the transaction holds SQLite's write lock
    /// before the read.
    async fn load_in_tx(
        conn: &mut SqliteConnection,
        user_id: &str,
        defaults: &QuotaLimits,
        now: DateTime<Utc>,
    ) -> DbResult<UsageQuota> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO usage_quotas (
                user_id, daily_token_limit, monthly_token_limit,
                daily_cost_limit_microcents, monthly_cost_limit_microcents,
                last_reset_daily, last_reset_monthly, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(user_id)
        .bind(defaults.daily_token_limit)
        .bind(defaults.monthly_token_limit)
        .bind(defaults.daily_cost_limit_microcents)
        .bind(defaults.monthly_cost_limit_microcents)
        .bind(now)
        .bind(now)
        .bind(now)
        .bind(now)
        .execute(&mut *conn)
        .await?;

        let row = sqlx::query(&format!(
            "SELECT {QUOTA_COLUMNS} FROM usage_quotas WHERE user_id = ?"
        ))
        .bind(user_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or(DbError::NotFound)?;

        let mut quota = Self::row_to_quota(&row);
        if quota.roll_over(now) {
            tracing::debug!(user_id, "Quota period rolled over");
            Self::write_in_tx(conn, &quota).await?;
        }
        Ok(quota)
    }

    async fn write_in_tx(conn: &mut SqliteConnection, quota: &UsageQuota) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE usage_quotas SET
                daily_token_limit = ?, monthly_token_limit = ?,
                daily_cost_limit_microcents = ?, monthly_cost_limit_microcents = ?,
                daily_tokens_used = ?, monthly_tokens_used = ?,
                daily_cost_used_microcents = ?, monthly_cost_used_microcents = ?,
                last_reset_daily = ?, last_reset_monthly = ?, updated_at = ?
            WHERE user_id = ?
            "#,
        )
        .bind(quota.daily_token_limit)
        .bind(quota.monthly_token_limit)
        .bind(quota.daily_cost_limit_microcents)
        .bind(quota.monthly_cost_limit_microcents)
        .bind(quota.daily_tokens_used)
        .bind(quota.monthly_tokens_used)
        .bind(quota.daily_cost_used_microcents)
        .bind(quota.monthly_cost_used_microcents)
        .bind(quota.last_reset_daily)
        .bind(quota.last_reset_monthly)
        .bind(quota.updated_at)
        .bind(&quota.user_id)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl QuotaRepo for SqliteQuotaRepo {
    async fn load_current(
        &self,
        user_id: &str,
        defaults: &QuotaLimits,
        now: DateTime<Utc>,
    ) -> DbResult<UsageQuota> {
        let mut tx = self.pool.begin().await?;
        let quota = Self::load_in_tx(&mut tx, user_id, defaults, now).await?;
        tx.commit().await?;
        Ok(quota)
    }

    async fn record_usage(
        &self,
        metric: &NewUsageMetric,
        defaults: &QuotaLimits,
        now: DateTime<Utc>,
    ) -> DbResult<RecordedUsage> {
        let mut tx = self.pool.begin().await?;

        let metric_id = sqlx::query(
            r#"
            INSERT INTO usage_metrics (
                user_id, request_type, resource_id,
                tokens_input, tokens_output, tokens_total,
                model_used, cost_microcents, duration_ms,
                endpoint, success, error_message, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&metric.user_id)
        .bind(metric.request_type.as_str())
        .bind(&metric.resource_id)
        .bind(metric.tokens_input)
        .bind(metric.tokens_output)
        .bind(metric.tokens_total())
        .bind(&metric.model_used)
        .bind(metric.cost_microcents)
        .bind(metric.duration_ms)
        .bind(&metric.endpoint)
        .bind(metric.success as i64)
        .bind(&metric.error_message)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        let quota = if metric.success {
            let mut quota = Self::load_in_tx(&mut tx, &metric.user_id, defaults, now).await?;
            quota.add(metric.charge(), now);
            Self::write_in_tx(&mut tx, &quota).await?;
            Some(quota)
        } else {
            None
        };

        tx.commit().await?;
        Ok(RecordedUsage { metric_id, quota })
    }

    async fn update_limits(
        &self,
        user_id: &str,
        update: &UpdateQuota,
        defaults: &QuotaLimits,
        now: DateTime<Utc>,
    ) -> DbResult<UsageQuota> {
        let mut tx = self.pool.begin().await?;
        let mut quota = Self::load_in_tx(&mut tx, user_id, defaults, now).await?;
        update.apply(&mut quota);
        quota.updated_at = now;
        Self::write_in_tx(&mut tx, &quota).await?;
        tx.commit().await?;
        Ok(quota)
    }
}
