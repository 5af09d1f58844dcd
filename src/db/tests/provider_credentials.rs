//! Shared tests for ProviderCredentialRepo implementations

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::db::{error::DbError, repos::ProviderCredentialRepo};

fn now() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2025-03-10T12:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

fn models(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

pub async fn test_upsert_creates(repo: &dyn ProviderCredentialRepo) {
    let cred = repo
        .upsert("user-1", "openai", "blob-1", &models(&["gpt-4"]), now())
        .await
        .expect("upsert failed");
    assert_eq!(cred.user_id, "user-1");
    assert_eq!(cred.provider, "openai");
    assert_eq!(cred.encrypted_key, "blob-1");
    assert_eq!(cred.models_enabled, vec!["gpt-4"]);
    assert!(cred.is_active);
    assert!(cred.last_used_at.is_none());
}

pub async fn test_upsert_replaces_existing(repo: &dyn ProviderCredentialRepo) {
    let first = repo
        .upsert("user-1", "openai", "blob-1", &[], now())
        .await
        .unwrap();
    let second = repo
        .upsert(
            "user-1",
            "openai",
            "blob-2",
            &models(&["gpt-4", "gpt-3.5-turbo"]),
            now() + Duration::hours(1),
        )
        .await
        .unwrap();

    assert_eq!(second.id, first.id);
    assert_eq!(second.encrypted_key, "blob-2");
    assert_eq!(second.models_enabled.len(), 2);
    assert_eq!(second.created_at, first.created_at);
    assert_eq!(second.updated_at, now() + Duration::hours(1));

    let all = repo.list_by_user("user-1", true).await.unwrap();
    assert_eq!(all.len(), 1);
}

pub async fn test_upsert_reactivates(repo: &dyn ProviderCredentialRepo) {
    repo.upsert("user-1", "openai", "blob-1", &[], now()).await.unwrap();
    repo.soft_delete("user-1", "openai", now()).await.unwrap();

    let cred = repo
        .upsert("user-1", "openai", "blob-2", &[], now())
        .await
        .unwrap();
    assert!(cred.is_active);
    assert!(repo.get_active("user-1", "openai").await.unwrap().is_some());
}

pub async fn test_users_isolated(repo: &dyn ProviderCredentialRepo) {
    repo.upsert("user-1", "openai", "a", &[], now()).await.unwrap();
    repo.upsert("user-2", "openai", "b", &[], now()).await.unwrap();

    let cred = repo.get_active("user-2", "openai").await.unwrap().unwrap();
    assert_eq!(cred.encrypted_key, "b");
    assert!(repo.get_active("user-3", "openai").await.unwrap().is_none());
}

pub async fn test_soft_delete_and_restore(repo: &dyn ProviderCredentialRepo) {
    repo.upsert("user-1", "anthropic", "a", &[], now()).await.unwrap();
    repo.upsert("user-1", "openai", "b", &[], now()).await.unwrap();

    repo.soft_delete("user-1", "openai", now()).await.unwrap();
    assert!(repo.get_active("user-1", "openai").await.unwrap().is_none());

    let active = repo.list_by_user("user-1", false).await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].provider, "anthropic");

    let all = repo.list_by_user("user-1", true).await.unwrap();
    assert_eq!(all.len(), 2);
    assert!(all.iter().any(|c| c.provider == "openai" && !c.is_active));

    // Already inactive
    let err = repo.soft_delete("user-1", "openai", now()).await.unwrap_err();
    assert!(matches!(err, DbError::NotFound));

    let restored = repo.restore("user-1", "openai", now()).await.unwrap();
    assert!(restored.is_active);
    assert_eq!(restored.encrypted_key, "b");
}

pub async fn test_restore_missing(repo: &dyn ProviderCredentialRepo) {
    let err = repo.restore("user-1", "openai", now()).await.unwrap_err();
    assert!(matches!(err, DbError::NotFound));
}

pub async fn test_hard_delete(repo: &dyn ProviderCredentialRepo) {
    repo.upsert("user-1", "openai", "a", &[], now()).await.unwrap();
    repo.soft_delete("user-1", "openai", now()).await.unwrap();

    // Inactive rows can still be erased
    repo.hard_delete("user-1", "openai").await.unwrap();
    assert!(repo.list_by_user("user-1", true).await.unwrap().is_empty());

    let err = repo.hard_delete("user-1", "openai").await.unwrap_err();
    assert!(matches!(err, DbError::NotFound));
}

pub async fn test_touch_last_used(repo: &dyn ProviderCredentialRepo) {
    let cred = repo.upsert("user-1", "openai", "a", &[], now()).await.unwrap();
    let used = now() + Duration::minutes(5);
    repo.touch_last_used(cred.id, used).await.unwrap();

    let cred = repo.get_active("user-1", "openai").await.unwrap().unwrap();
    assert_eq!(cred.last_used_at, Some(used));

    // Unknown ids are ignored
    repo.touch_last_used(Uuid::new_v4(), used).await.unwrap();
}

// ============================================================================
// SQLite Tests
// ============================================================================

#[cfg(all(test, feature = "database-sqlite"))]
mod sqlite_tests {
    use crate::db::{
        sqlite::SqliteProviderCredentialRepo,
        tests::harness::create_sqlite_pool,
    };

    async fn create_repo() -> SqliteProviderCredentialRepo {
        SqliteProviderCredentialRepo::new(create_sqlite_pool().await)
    }

    macro_rules! sqlite_test {
        ($name:ident) => {
            #[tokio::test]
            async fn $name() {
                let repo = create_repo().await;
                super::$name(&repo).await;
            }
        };
    }

    sqlite_test!(test_upsert_creates);
    sqlite_test!(test_upsert_replaces_existing);
    sqlite_test!(test_upsert_reactivates);
    sqlite_test!(test_users_isolated);
    sqlite_test!(test_soft_delete_and_restore);
    sqlite_test!(test_restore_missing);
    sqlite_test!(test_hard_delete);
    sqlite_test!(test_touch_last_used);
}
