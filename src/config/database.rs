use serde::{Deserialize, Serialize};

use super::ConfigError;

/// Where quota rows, the usage log and encrypted provider credentials live.
///
/// Without a database the gateway still throttles, validates tokens and
/// guards against forgery, but quota admission, usage recording and the
/// credential endpoints are disabled.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum DatabaseConfig {
    #[default]
    None,

    #[cfg(feature = "database-sqlite")]
    Sqlite(SqliteConfig),
}

impl DatabaseConfig {
    pub fn is_none(&self) -> bool {
        matches!(self, DatabaseConfig::None)
    }

    /// Whether migrations should run at startup.
    pub fn run_migrations(&self) -> bool {
        match self {
            DatabaseConfig::None => false,
            #[cfg(feature = "database-sqlite")]
            DatabaseConfig::Sqlite(c) => c.run_migrations,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            DatabaseConfig::None => Ok(()),
            #[cfg(feature = "database-sqlite")]
            DatabaseConfig::Sqlite(c) => c.validate(),
        }
    }
}

#[cfg(feature = "database-sqlite")]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SqliteConfig {
    /// Database file. `:memory:` keeps everything in process and is lost on
    /// restart; shared-cache URIs (`file:name?mode=memory&cache=shared`) let
    /// several pooled connections see the same in-memory database.
    #[serde(default = "default_sqlite_path")]
    pub path: String,

    #[serde(default = "default_true")]
    pub create_if_missing: bool,

    #[serde(default = "default_true")]
    pub run_migrations: bool,

    /// WAL lets usage writes proceed while dashboards read.
    #[serde(default = "default_true")]
    pub wal_mode: bool,

    /// How long a writer waits on a locked quota row before failing.
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u64,

    #[serde(default = "default_sqlite_max_connections")]
    pub max_connections: u32,
}

#[cfg(feature = "database-sqlite")]
impl SqliteConfig {
    /// Connection options for the pool.
    pub fn connect_options(&self) -> sqlx::sqlite::SqliteConnectOptions {
        use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode};

        let journal_mode = if self.wal_mode {
            SqliteJournalMode::Wal
        } else {
            SqliteJournalMode::Delete
        };
        SqliteConnectOptions::new()
            .filename(&self.path)
            .create_if_missing(self.create_if_missing)
            .journal_mode(journal_mode)
            .busy_timeout(std::time::Duration::from_millis(self.busy_timeout_ms))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.path.trim().is_empty() {
            return Err(ConfigError::Validation(
                "database.path cannot be empty".into(),
            ));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Validation(
                "database.max_connections must be greater than zero".into(),
            ));
        }
        // Every connection to a plain `:memory:` database gets its own copy,
        // so quota rows would diverge between pooled connections.
        if self.path == ":memory:" && self.max_connections > 1 {
            return Err(ConfigError::Validation(
                "database.path = \":memory:\" requires max_connections = 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(feature = "database-sqlite")]
fn default_sqlite_path() -> String {
    "chatgate.db".to_string()
}

#[cfg(feature = "database-sqlite")]
fn default_true() -> bool {
    true
}

#[cfg(feature = "database-sqlite")]
fn default_busy_timeout() -> u64 {
    5000
}

#[cfg(feature = "database-sqlite")]
fn default_sqlite_max_connections() -> u32 {
    5
}
