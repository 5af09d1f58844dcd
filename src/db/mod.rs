mod error;
pub mod repos;
#[cfg(feature = "database-sqlite")]
pub mod sqlite;

#[cfg(all(test, feature = "database-sqlite"))]
pub mod tests;

use std::sync::Arc;

pub use error::{DbError, DbResult};
pub use repos::*;

use crate::config::DatabaseConfig;

struct Repos {
    quotas: Arc<dyn QuotaRepo>,
    usage: Arc<dyn UsageMetricRepo>,
    provider_credentials: Arc<dyn ProviderCredentialRepo>,
}

enum Backend {
    #[cfg(feature = "database-sqlite")]
    Sqlite(sqlx::SqlitePool),
    #[cfg(not(feature = "database-sqlite"))]
    _None(std::convert::Infallible),
}

/// Connection pool plus the quota, usage and credential repositories built
/// on it. Repositories are constructed once and handed out as shared trait
/// objects.
pub struct DbPool {
    backend: Backend,
    repos: Repos,
}

impl DbPool {
    /// Wrap an already-open SQLite pool. Tests use this with an in-memory
    /// database.
    #[cfg(feature = "database-sqlite")]
    pub fn from_sqlite(pool: sqlx::SqlitePool) -> Self {
        let repos = Repos {
            quotas: Arc::new(sqlite::SqliteQuotaRepo::new(pool.clone())),
            usage: Arc::new(sqlite::SqliteUsageMetricRepo::new(pool.clone())),
            provider_credentials: Arc::new(sqlite::SqliteProviderCredentialRepo::new(
                pool.clone(),
            )),
        };
        Self {
            backend: Backend::Sqlite(pool),
            repos,
        }
    }

    /// Open the configured database.
    pub async fn from_config(config: &DatabaseConfig) -> DbResult<Self> {
        match config {
            DatabaseConfig::None => Err(DbError::NotConfigured),
            #[cfg(feature = "database-sqlite")]
            DatabaseConfig::Sqlite(cfg) => {
                let pool = sqlx::sqlite::SqlitePoolOptions::new()
                    .max_connections(cfg.max_connections)
                    .connect_with(cfg.connect_options())
                    .await?;
                tracing::debug!(
                    path = %cfg.path,
                    max_connections = cfg.max_connections,
                    "SQLite pool opened"
                );
                Ok(Self::from_sqlite(pool))
            }
        }
    }

    /// Apply pending schema migrations from `migrations_sqlx/`.
    pub async fn run_migrations(&self) -> DbResult<()> {
        match &self.backend {
            #[cfg(feature = "database-sqlite")]
            Backend::Sqlite(pool) => {
                sqlx::migrate!("./migrations_sqlx/sqlite").run(pool).await?;
                tracing::info!("SQLite schema up to date");
                Ok(())
            }
            #[cfg(not(feature = "database-sqlite"))]
            Backend::_None(infallible) => match *infallible {},
        }
    }

    pub fn quotas(&self) -> Arc<dyn QuotaRepo> {
        Arc::clone(&self.repos.quotas)
    }

    pub fn usage(&self) -> Arc<dyn UsageMetricRepo> {
        Arc::clone(&self.repos.usage)
    }

    pub fn provider_credentials(&self) -> Arc<dyn ProviderCredentialRepo> {
        Arc::clone(&self.repos.provider_credentials)
    }

    /// Round-trip a trivial query; used by `/health` and `/health/ready`.
    pub async fn health_check(&self) -> DbResult<()> {
        match &self.backend {
            #[cfg(feature = "database-sqlite")]
            Backend::Sqlite(pool) => {
                sqlx::query("SELECT 1").execute(pool).await?;
                Ok(())
            }
            #[cfg(not(feature = "database-sqlite"))]
            Backend::_None(infallible) => match *infallible {},
        }
    }
}
