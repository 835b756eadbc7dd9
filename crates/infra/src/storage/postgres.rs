//! Postgres-backed [`RecordStore`].
//!
//! Rows are fetched as `to_jsonb(t)` so any table can be read without a
//! per-table row type. Table and column names are validated with
//! [`validate_identifier`] before being interpolated into SQL; values are
//! always bound.
//!
//! ## Error Mapping
//!
//! | SQLx Error | StorageError |
//! |------------|--------------|
//! | Io / Tls / PoolTimedOut / PoolClosed / WorkerCrashed | `Unavailable` (retried) |
//! | Database, class `08` / `40001` / `40P01` / `57P0x` | `Unavailable` (retried) |
//! | Database (other) | `Rejected` (terminal) |
//! | Decode / ColumnDecode | `Decode` |

use serde_json::Value as JsonValue;
use sqlx::Row;
use tracing::instrument;

use bgmigrate_core::RecordId;
use bgmigrate_migrations::storage::validate_identifier;
use bgmigrate_migrations::{FieldValue, Record, RecordStore, StorageError};

use crate::db::Database;

#[derive(Debug, Clone)]
pub struct PostgresRecordStore {
    db: Database,
}

impl PostgresRecordStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

impl RecordStore for PostgresRecordStore {
    #[instrument(skip(self), fields(record_id = %id), err)]
    fn fetch(&self, table: &str, id: RecordId) -> Result<Option<Record>, StorageError> {
        let table = validate_identifier(table)?;
        let sql = format!("SELECT to_jsonb(t) AS data FROM {table} t WHERE t.id = $1");

        let row = self.db.block_on(async {
            sqlx::query(&sql)
                .bind(id.get())
                .fetch_optional(self.db.pool())
                .await
                .map_err(map_sqlx_error)
        })?;

        let Some(row) = row else {
            return Ok(None);
        };
        let json: JsonValue = row.try_get("data").map_err(map_sqlx_error)?;
        record_from_json(json).map(Some)
    }

    #[instrument(skip(self, value), fields(record_id = %id), err)]
    fn update_field(
        &self,
        table: &str,
        id: RecordId,
        column: &str,
        value: FieldValue,
    ) -> Result<bool, StorageError> {
        let table = validate_identifier(table)?;
        let column = validate_identifier(column)?;

        let result = self.db.block_on(async {
            let pool = self.db.pool();
            let result = match value {
                FieldValue::Null => {
                    sqlx::query(&format!("UPDATE {table} SET {column} = NULL WHERE id = $1"))
                        .bind(id.get())
                        .execute(pool)
                        .await
                }
                FieldValue::Bool(b) => {
                    sqlx::query(&format!("UPDATE {table} SET {column} = $2 WHERE id = $1"))
                        .bind(id.get())
                        .bind(b)
                        .execute(pool)
                        .await
                }
                FieldValue::Int(i) => {
                    sqlx::query(&format!("UPDATE {table} SET {column} = $2 WHERE id = $1"))
                        .bind(id.get())
                        .bind(i)
                        .execute(pool)
                        .await
                }
                FieldValue::Text(s) => {
                    sqlx::query(&format!("UPDATE {table} SET {column} = $2 WHERE id = $1"))
                        .bind(id.get())
                        .bind(s)
                        .execute(pool)
                        .await
                }
            };
            result.map_err(map_sqlx_error)
        })?;

        Ok(result.rows_affected() > 0)
    }
}

fn record_from_json(json: JsonValue) -> Result<Record, StorageError> {
    match json {
        JsonValue::Object(columns) => Ok(columns
            .into_iter()
            .map(|(column, value)| (column, FieldValue::from_json(value)))
            .collect()),
        other => Err(StorageError::Decode(format!("expected a JSON object row, got {other}"))),
    }
}

fn is_retryable_code(code: &str) -> bool {
    // connection exceptions, serialization failure, deadlock, operator intervention
    code.starts_with("08") || code == "40001" || code == "40P01" || code.starts_with("57P0")
}

fn map_sqlx_error(err: sqlx::Error) -> StorageError {
    match err {
        sqlx::Error::Database(db_err) => {
            let retryable = db_err.code().as_deref().is_some_and(is_retryable_code);
            let msg = format!("database error: {}", db_err.message());
            if retryable {
                StorageError::Unavailable(msg)
            } else {
                StorageError::Rejected(msg)
            }
        }
        sqlx::Error::Decode(e) | sqlx::Error::ColumnDecode { source: e, .. } => {
            StorageError::Decode(e.to_string())
        }
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => StorageError::Unavailable(err.to_string()),
        other => StorageError::Rejected(other.to_string()),
    }
}
