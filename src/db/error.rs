use thiserror::Error;

/// Failures from the quota, usage and credential stores.
#[derive(Debug, Error)]
pub enum DbError {
    /// No `[database]` section; nothing is persisted.
    #[error("No database configured")]
    NotConfigured,

    #[error("Row not found")]
    NotFound,

    #[cfg(feature = "database-sqlite")]
    #[error("SQLite error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[cfg(feature = "database-sqlite")]
    #[error("Schema migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// `models_enabled` is stored as a JSON array.
    #[error("Malformed model list: {0}")]
    ModelList(#[from] serde_json::Error),

    /// A stored value no longer parses into its domain type.
    #[error("Corrupt {column} value in database: {value}")]
    Corrupt { column: &'static str, value: String },
}

pub type DbResult<T> = Result<T, DbError>;
