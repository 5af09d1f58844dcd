use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};
use uuid::Uuid;

use super::common::{get_bool, parse_uuid};
use crate::{
    db::{
        error::{DbError, DbResult},
        repos::ProviderCredentialRepo,
    },
    models::ProviderCredential,
};

const CREDENTIAL_COLUMNS: &str = r#"
    id, user_id, provider, encrypted_key, models_enabled, is_active,
    last_used_at, created_at, updated_at
"#;

pub struct SqliteProviderCredentialRepo {
    pool: SqlitePool,
}

impl SqliteProviderCredentialRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_credential(row: &SqliteRow) -> DbResult<ProviderCredential> {
        let models_json: String = row.get("models_enabled");
        Ok(ProviderCredential {
            id: parse_uuid(row.get("id"))?,
            user_id: row.get("user_id"),
            provider: row.get("provider"),
            encrypted_key: row.get("encrypted_key"),
            models_enabled: serde_json::from_str(&models_json)?,
            is_active: get_bool(row, "is_active"),
            last_used_at: row.get("last_used_at"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    async fn find(
        &self,
        user_id: &str,
        provider: &str,
        active_only: bool,
    ) -> DbResult<Option<ProviderCredential>> {
        let query = format!(
            "SELECT {CREDENTIAL_COLUMNS} FROM provider_credentials WHERE user_id = ? AND provider = ?{}",
            if active_only { " AND is_active = 1" } else { "" }
        );
        let row = sqlx::query(&query)
            .bind(user_id)
            .bind(provider)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_credential).transpose()
    }
}

#[async_trait]
impl ProviderCredentialRepo for SqliteProviderCredentialRepo {
    async fn upsert(
        &self,
        user_id: &str,
        provider: &str,
        encrypted_key: &str,
        models_enabled: &[String],
        now: DateTime<Utc>,
    ) -> DbResult<ProviderCredential> {
        let models_json = serde_json::to_string(models_enabled)?;

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO provider_credentials (
                id, user_id, provider, encrypted_key, models_enabled, is_active,
                created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, 1, ?, ?)
            ON CONFLICT (user_id, provider) DO UPDATE SET
                encrypted_key = excluded.encrypted_key,
                models_enabled = excluded.models_enabled,
                is_active = 1,
                updated_at = excluded.updated_at
            RETURNING {CREDENTIAL_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4().to_string())
        .bind(user_id)
        .bind(provider)
        .bind(encrypted_key)
        .bind(&models_json)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Self::row_to_credential(&row)
    }

    async fn get_active(
        &self,
        user_id: &str,
        provider: &str,
    ) -> DbResult<Option<ProviderCredential>> {
        self.find(user_id, provider, true).await
    }

    async fn list_by_user(
        &self,
        user_id: &str,
        include_inactive: bool,
    ) -> DbResult<Vec<ProviderCredential>> {
        let query = format!(
            "SELECT {CREDENTIAL_COLUMNS} FROM provider_credentials WHERE user_id = ?{} ORDER BY provider ASC",
            if include_inactive { "" } else { " AND is_active = 1" }
        );
        let rows = sqlx::query(&query)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::row_to_credential).collect()
    }

    async fn soft_delete(&self, user_id: &str, provider: &str, now: DateTime<Utc>) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE provider_credentials
            SET is_active = 0, updated_at = ?
            WHERE user_id = ? AND provider = ? AND is_active = 1
            "#,
        )
        .bind(now)
        .bind(user_id)
        .bind(provider)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    async fn hard_delete(&self, user_id: &str, provider: &str) -> DbResult<()> {
        let result =
            sqlx::query("DELETE FROM provider_credentials WHERE user_id = ? AND provider = ?")
                .bind(user_id)
                .bind(provider)
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    async fn restore(
        &self,
        user_id: &str,
        provider: &str,
        now: DateTime<Utc>,
    ) -> DbResult<ProviderCredential> {
        let result = sqlx::query(
            r#"
            UPDATE provider_credentials
            SET is_active = 1, updated_at = ?
            WHERE user_id = ? AND provider = ?
            "#,
        )
        .bind(now)
        .bind(user_id)
        .bind(provider)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound);
        }

        self.find(user_id, provider, true)
            .await?
            .ok_or(DbError::NotFound)
    }

    async fn touch_last_used(&self, id: Uuid, now: DateTime<Utc>) -> DbResult<()> {
        sqlx::query("UPDATE provider_credentials SET last_used_at = ? WHERE id = ?")
            .bind(now)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
