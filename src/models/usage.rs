use chrono::{DateTime, Datelike, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::{
    config::QuotaConfig,
    pricing::{dollars_to_microcents, microcents_to_dollars},
};

/// Kind of metered request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    Chat,
    CodeGeneration,
    Document,
}

impl RequestType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestType::Chat => "chat",
            RequestType::CodeGeneration => "code_generation",
            RequestType::Document => "document",
        }
    }

    /// Classify a request path. Paths outside these families are not metered.
    pub fn from_path(path: &str) -> Option<Self> {
        if path.contains("/chat") {
            Some(RequestType::Chat)
        } else if path.contains("/code") {
            Some(RequestType::CodeGeneration)
        } else if path.contains("/document") {
            Some(RequestType::Document)
        } else {
            None
        }
    }
}

impl std::fmt::Display for RequestType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Token and cost ceilings. Costs in microcents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaLimits {
    pub daily_token_limit: i64,
    pub monthly_token_limit: i64,
    pub daily_cost_limit_microcents: i64,
    pub monthly_cost_limit_microcents: i64,
}

impl From<&QuotaConfig> for QuotaLimits {
    fn from(config: &QuotaConfig) -> Self {
        Self {
            daily_token_limit: config.daily_token_limit,
            monthly_token_limit: config.monthly_token_limit,
            daily_cost_limit_microcents: dollars_to_microcents(config.daily_cost_limit_usd),
            monthly_cost_limit_microcents: dollars_to_microcents(config.monthly_cost_limit_usd),
        }
    }
}

impl Default for QuotaLimits {
    fn default() -> Self {
        Self::from(&QuotaConfig::default())
    }
}

/// Tokens and cost (microcents) consumed or reserved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Consumption {
    pub tokens: i64,
    pub cost_microcents: i64,
}

impl Consumption {
    pub fn new(tokens: i64, cost_microcents: i64) -> Self {
        Self {
            tokens,
            cost_microcents,
        }
    }

    pub fn saturating_add(self, other: Consumption) -> Self {
        Self {
            tokens: self.tokens.saturating_add(other.tokens),
            cost_microcents: self.cost_microcents.saturating_add(other.cost_microcents),
        }
    }

    pub fn saturating_sub(self, other: Consumption) -> Self {
        Self {
            tokens: self.tokens.saturating_sub(other.tokens).max(0),
            cost_microcents: self
                .cost_microcents
                .saturating_sub(other.cost_microcents)
                .max(0),
        }
    }
}

/// One user's quota row.
///
/// Counters only grow within a period and return to zero once when a new
/// UTC calendar day (daily) or month (monthly) begins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageQuota {
    pub user_id: String,
    pub daily_token_limit: i64,
    pub monthly_token_limit: i64,
    pub daily_cost_limit_microcents: i64,
    pub monthly_cost_limit_microcents: i64,
    pub daily_tokens_used: i64,
    pub monthly_tokens_used: i64,
    pub daily_cost_used_microcents: i64,
    pub monthly_cost_used_microcents: i64,
    pub last_reset_daily: DateTime<Utc>,
    pub last_reset_monthly: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UsageQuota {
    pub fn new(user_id: impl Into<String>, limits: &QuotaLimits, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.into(),
            daily_token_limit: limits.daily_token_limit,
            monthly_token_limit: limits.monthly_token_limit,
            daily_cost_limit_microcents: limits.daily_cost_limit_microcents,
            monthly_cost_limit_microcents: limits.monthly_cost_limit_microcents,
            daily_tokens_used: 0,
            monthly_tokens_used: 0,
            daily_cost_used_microcents: 0,
            monthly_cost_used_microcents: 0,
            last_reset_daily: now,
            last_reset_monthly: now,
            created_at: now,
            updated_at: now,
        }
    }

    /// Reset counters for every period that has ended since its last reset.
    ///
    /// Returns true if anything was reset. Calling it again with the same
    /// `now` is a no-op.
    pub fn roll_over(&mut self, now: DateTime<Utc>) -> bool {
        let mut changed = false;

        if now.date_naive() > self.last_reset_daily.date_naive() {
            self.daily_tokens_used = 0;
            self.daily_cost_used_microcents = 0;
            self.last_reset_daily = now;
            changed = true;
        }

        let last_month = (
            self.last_reset_monthly.year(),
            self.last_reset_monthly.month(),
        );
        if (now.year(), now.month()) > last_month {
            self.monthly_tokens_used = 0;
            self.monthly_cost_used_microcents = 0;
            self.last_reset_monthly = now;
            changed = true;
        }

        if changed {
            self.updated_at = now;
        }
        changed
    }

    /// Whether `pending` plus `request` would push any of the four counters past its ceiling.
    ///
    /// Token and cost ceilings are checked independently; exceeding either denies.
    pub fn would_exceed(&self, pending: Consumption, request: Consumption) -> bool {
        let extra = pending.saturating_add(request);
        self.daily_tokens_used.saturating_add(extra.tokens) > self.daily_token_limit
            || self.monthly_tokens_used.saturating_add(extra.tokens) > self.monthly_token_limit
            || self
                .daily_cost_used_microcents
                .saturating_add(extra.cost_microcents)
                > self.daily_cost_limit_microcents
            || self
                .monthly_cost_used_microcents
                .saturating_add(extra.cost_microcents)
                > self.monthly_cost_limit_microcents
    }

    pub fn add(&mut self, usage: Consumption, now: DateTime<Utc>) {
        self.daily_tokens_used = self.daily_tokens_used.saturating_add(usage.tokens);
        self.monthly_tokens_used = self.monthly_tokens_used.saturating_add(usage.tokens);
        self.daily_cost_used_microcents = self
            .daily_cost_used_microcents
            .saturating_add(usage.cost_microcents);
        self.monthly_cost_used_microcents = self
            .monthly_cost_used_microcents
            .saturating_add(usage.cost_microcents);
        self.updated_at = now;
    }

    pub fn status(&self, now: DateTime<Utc>) -> QuotaStatus {
        QuotaStatus {
            user_id: self.user_id.clone(),
            daily: PeriodStatus::new(
                self.daily_tokens_used,
                self.daily_token_limit,
                self.daily_cost_used_microcents,
                self.daily_cost_limit_microcents,
                next_day(now),
            ),
            monthly: PeriodStatus::new(
                self.monthly_tokens_used,
                self.monthly_token_limit,
                self.monthly_cost_used_microcents,
                self.monthly_cost_limit_microcents,
                next_month(now),
            ),
        }
    }
}

/// Midnight UTC at the start of the day after `now`.
pub fn next_day(now: DateTime<Utc>) -> DateTime<Utc> {
    let tomorrow = now.date_naive().succ_opt().unwrap_or(now.date_naive());
    Utc.from_utc_datetime(&tomorrow.and_time(NaiveTime::MIN))
}

/// Midnight UTC on the first day of the month after `now`.
pub fn next_month(now: DateTime<Utc>) -> DateTime<Utc> {
    let (year, month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .unwrap_or(now)
}

/// Quota usage for one period, as returned by the usage endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodStatus {
    pub tokens_used: i64,
    pub token_limit: i64,
    pub tokens_remaining: i64,
    pub token_percent_used: f64,
    pub cost_used_usd: f64,
    pub cost_limit_usd: f64,
    pub cost_remaining_usd: f64,
    pub cost_percent_used: f64,
    pub resets_at: DateTime<Utc>,
}

impl PeriodStatus {
    fn new(
        tokens_used: i64,
        token_limit: i64,
        cost_used: i64,
        cost_limit: i64,
        resets_at: DateTime<Utc>,
    ) -> Self {
        Self {
            tokens_used,
            token_limit,
            tokens_remaining: (token_limit - tokens_used).max(0),
            token_percent_used: percent(tokens_used, token_limit),
            cost_used_usd: microcents_to_dollars(cost_used),
            cost_limit_usd: microcents_to_dollars(cost_limit),
            cost_remaining_usd: microcents_to_dollars((cost_limit - cost_used).max(0)),
            cost_percent_used: percent(cost_used, cost_limit),
            resets_at,
        }
    }
}

fn percent(used: i64, limit: i64) -> f64 {
    if limit <= 0 {
        return if used > 0 { 100.0 } else { 0.0 };
    }
    used as f64 / limit as f64 * 100.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaStatus {
    pub user_id: String,
    pub daily: PeriodStatus,
    pub monthly: PeriodStatus,
}

/// A usage record to append to the metering log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewUsageMetric {
    pub user_id: String,
    pub request_type: RequestType,
    pub resource_id: Option<String>,
    pub tokens_input: i64,
    pub tokens_output: i64,
    pub model_used: String,
    /// Cost in microcents
    pub cost_microcents: i64,
    pub duration_ms: i64,
    pub endpoint: String,
    pub success: bool,
    pub error_message: Option<String>,
}

impl NewUsageMetric {
    pub fn tokens_total(&self) -> i64 {
        self.tokens_input.saturating_add(self.tokens_output)
    }

    /// Tokens and cost charged against the quota. Failed requests charge nothing.
    pub fn charge(&self) -> Consumption {
        if self.success {
            Consumption::new(self.tokens_total(), self.cost_microcents)
        } else {
            Consumption::default()
        }
    }
}

/// Reporting window for usage summaries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsagePeriod {
    Daily,
    #[default]
    Monthly,
    AllTime,
}

impl UsagePeriod {
    /// Inclusive lower bound of the window, or None for all time.
    pub fn start(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            UsagePeriod::Daily => Some(
                Utc.from_utc_datetime(&now.date_naive().and_time(NaiveTime::MIN)),
            ),
            UsagePeriod::Monthly => Utc
                .with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
                .single(),
            UsagePeriod::AllTime => None,
        }
    }
}

/// Aggregate totals over a window, computed by the repository.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UsageTotals {
    pub total_requests: i64,
    pub successful_requests: i64,
    pub tokens_input: i64,
    pub tokens_output: i64,
    pub tokens_total: i64,
    pub cost_microcents: i64,
    pub average_duration_ms: f64,
}

/// Per-model request counts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelUsage {
    pub model: String,
    pub requests: i64,
    pub tokens: i64,
}

/// Per-endpoint breakdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointUsage {
    pub endpoint: String,
    pub requests: i64,
    pub tokens: i64,
    pub cost_usd: f64,
    /// Percentage of requests that succeeded
    pub success_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageSummary {
    pub user_id: String,
    pub period: UsagePeriod,
    pub total_requests: i64,
    pub successful_requests: i64,
    pub failed_requests: i64,
    pub tokens_input: i64,
    pub tokens_output: i64,
    pub total_tokens: i64,
    pub total_cost_usd: f64,
    pub average_duration_ms: f64,
    pub by_model: Vec<ModelUsage>,
    pub by_endpoint: Vec<EndpointUsage>,
}

/// Quota status plus daily and monthly summaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageDashboard {
    pub quota: QuotaStatus,
    pub daily: UsageSummary,
    pub monthly: UsageSummary,
}

/// Admin update of a user's ceilings. Omitted fields are left unchanged.
#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct UpdateQuota {
    #[validate(range(min = 0))]
    pub daily_token_limit: Option<i64>,
    #[validate(range(min = 0))]
    pub monthly_token_limit: Option<i64>,
    #[validate(range(min = 0.0))]
    pub daily_cost_limit_usd: Option<f64>,
    #[validate(range(min = 0.0))]
    pub monthly_cost_limit_usd: Option<f64>,
}

impl UpdateQuota {
    pub fn apply(&self, quota: &mut UsageQuota) {
        if let Some(v) = self.daily_token_limit {
            quota.daily_token_limit = v;
        }
        if let Some(v) = self.monthly_token_limit {
            quota.monthly_token_limit = v;
        }
        if let Some(v) = self.daily_cost_limit_usd {
            quota.daily_cost_limit_microcents = dollars_to_microcents(v);
        }
        if let Some(v) = self.monthly_cost_limit_usd {
            quota.monthly_cost_limit_microcents = dollars_to_microcents(v);
        }
    }
}
