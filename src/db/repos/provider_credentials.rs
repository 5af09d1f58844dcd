use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{db::error::DbResult, models::ProviderCredential};

/// Encrypted provider API keys, at most one row per (user, provider).
#[async_trait]
pub trait ProviderCredentialRepo: Send + Sync {
    /// Insert, or replace the key and model list of the existing row and reactivate it.
    async fn upsert(
        &self,
        user_id: &str,
        provider: &str,
        encrypted_key: &str,
        models_enabled: &[String],
        now: DateTime<Utc>,
    ) -> DbResult<ProviderCredential>;

    /// Active row for (user, provider).
    async fn get_active(&self, user_id: &str, provider: &str)
    -> DbResult<Option<ProviderCredential>>;

    async fn list_by_user(
        &self,
        user_id: &str,
        include_inactive: bool,
    ) -> DbResult<Vec<ProviderCredential>>;

    /// Mark the active row inactive. `NotFound` if there is no active row.
    async fn soft_delete(&self, user_id: &str, provider: &str, now: DateTime<Utc>) -> DbResult<()>;

    /// Erase the row, active or not. `NotFound` if there is none.
    async fn hard_delete(&self, user_id: &str, provider: &str) -> DbResult<()>;

    /// Reactivate a soft-deleted row. `NotFound` if there is no row at all.
    async fn restore(
        &self,
        user_id: &str,
        provider: &str,
        now: DateTime<Utc>,
    ) -> DbResult<ProviderCredential>;

    async fn touch_last_used(&self, id: Uuid, now: DateTime<Utc>) -> DbResult<()>;
}
