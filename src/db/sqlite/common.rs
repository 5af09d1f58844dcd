use sqlx::{Row, sqlite::SqliteRow};
use uuid::Uuid;

use crate::db::error::{DbError, DbResult};

pub fn parse_uuid(s: &str) -> DbResult<Uuid> {
    Uuid::parse_str(s).map_err(|_| DbError::Corrupt {
        column: "id",
        value: s.to_string(),
    })
}

/// SQLite stores booleans as 0/1 integers.
pub fn get_bool(row: &SqliteRow, column: &str) -> bool {
    row.get::<i64, _>(column) != 0
}
