//! Postgres-backed job queue.
//!
//! ## Claims
//!
//! `claim_next` is a single `UPDATE ... WHERE id = (SELECT ... FOR UPDATE SKIP
//! LOCKED LIMIT 1) RETURNING ...`. Concurrent claimers (workers or drainers in
//! any process) skip rows another transaction has locked, so a row is handed
//! out at most once per lease.
//!
//! A row with `lease_expires_at IS NULL` is pending; otherwise it is running
//! and becomes claimable again once the lease has passed.
//!
//! A claimed row that does not decode (bad `name`, non-primitive `args`) is
//! moved to `migration_dead_letters` as is and reported as
//! `QueueError::Undecodable`, so it never blocks the queue.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | QueueError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `AlreadyExists` (single enqueue) / `Storage` |
//! | Database (other) | Any other | `Storage` |
//! | Decode / ColumnDecode | N/A | `Serialization` |
//! | Other | N/A | `Storage` |

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{Postgres, QueryBuilder, Row};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use bgmigrate_core::{ArgumentList, JobId, JobPayload, MigrationName};

use crate::db::Database;

use super::store::{JobQueue, QueueError};
use super::types::{ClaimFilter, DeadLetterEntry, JobState, ScheduledJob};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS migration_jobs (
        id                UUID PRIMARY KEY,
        name              TEXT NOT NULL,
        args              JSONB NOT NULL,
        attempt           INTEGER NOT NULL DEFAULT 0,
        not_before        TIMESTAMPTZ NULL,
        lease_expires_at  TIMESTAMPTZ NULL,
        last_error        TEXT NULL,
        created_at        TIMESTAMPTZ NOT NULL,
        updated_at        TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS migration_jobs_name_created_idx ON migration_jobs (name, created_at, id)",
    "CREATE INDEX IF NOT EXISTS migration_jobs_created_idx ON migration_jobs (created_at, id)",
    r#"
    CREATE TABLE IF NOT EXISTS migration_dead_letters (
        id                UUID PRIMARY KEY,
        name              TEXT NOT NULL,
        args              JSONB NOT NULL,
        attempt           INTEGER NOT NULL,
        last_error        TEXT NULL,
        created_at        TIMESTAMPTZ NOT NULL,
        reason            TEXT NOT NULL,
        dead_lettered_at  TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS migration_dead_letters_name_idx ON migration_dead_letters (name, dead_lettered_at)",
];

const JOB_COLUMNS: &str =
    "id, name, args, attempt, not_before, lease_expires_at, last_error, created_at, updated_at";

// Nine binds per row; stays well under the 65535 bind parameter limit.
const INSERT_CHUNK: usize = 1000;

#[derive(Debug, Clone)]
pub struct PostgresJobQueue {
    db: Database,
}

impl PostgresJobQueue {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create the queue tables if they do not exist yet.
    pub fn ensure_schema(&self) -> Result<(), QueueError> {
        self.db.block_on(async {
            for statement in SCHEMA {
                sqlx::query(statement)
                    .execute(self.db.pool())
                    .await
                    .map_err(|e| map_sqlx_error("ensure_schema", e))?;
            }
            Ok::<(), QueueError>(())
        })
    }
}

impl JobQueue for PostgresJobQueue {
    #[instrument(skip(self, job), fields(job_id = %job.id, migration = %job.name()), err)]
    fn enqueue(&self, job: ScheduledJob) -> Result<JobId, QueueError> {
        let row = JobRow::from_job(&job)?;
        self.db.block_on(async {
            sqlx::query(&format!(
                "INSERT INTO migration_jobs ({JOB_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"
            ))
            .bind(row.id)
            .bind(&row.name)
            .bind(&row.args)
            .bind(row.attempt)
            .bind(row.not_before)
            .bind(row.lease_expires_at)
            .bind(&row.last_error)
            .bind(row.created_at)
            .bind(row.updated_at)
            .execute(self.db.pool())
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    QueueError::AlreadyExists(job.id)
                } else {
                    map_sqlx_error("enqueue", e)
                }
            })
        })?;
        Ok(job.id)
    }

    #[instrument(skip(self, jobs), fields(count = jobs.len()), err)]
    fn enqueue_batch(&self, jobs: Vec<ScheduledJob>) -> Result<Vec<JobId>, QueueError> {
        if jobs.is_empty() {
            return Ok(Vec::new());
        }
        let rows = jobs.iter().map(JobRow::from_job).collect::<Result<Vec<_>, _>>()?;

        self.db.block_on(async {
            let mut tx = self
                .db
                .pool()
                .begin()
                .await
                .map_err(|e| map_sqlx_error("enqueue_batch", e))?;

            for chunk in rows.chunks(INSERT_CHUNK) {
                let mut builder: QueryBuilder<Postgres> =
                    QueryBuilder::new(format!("INSERT INTO migration_jobs ({JOB_COLUMNS}) "));
                builder.push_values(chunk, |mut b, row| {
                    b.push_bind(row.id)
                        .push_bind(row.name.clone())
                        .push_bind(row.args.clone())
                        .push_bind(row.attempt)
                        .push_bind(row.not_before)
                        .push_bind(row.lease_expires_at)
                        .push_bind(row.last_error.clone())
                        .push_bind(row.created_at)
                        .push_bind(row.updated_at);
                });
                builder
                    .build()
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| map_sqlx_error("enqueue_batch", e))?;
            }

            tx.commit()
                .await
                .map_err(|e| map_sqlx_error("enqueue_batch", e))
        })?;

        Ok(jobs.iter().map(|j| j.id).collect())
    }

    fn claim_next(
        &self,
        filter: &ClaimFilter,
        lease: Duration,
    ) -> Result<Option<ScheduledJob>, QueueError> {
        let name = filter.name.as_ref().map(|n| n.as_str().to_string());
        let row = self.db.block_on(async {
            sqlx::query(&format!(
                r#"
                UPDATE migration_jobs
                SET attempt = attempt + 1,
                    lease_expires_at = now() + make_interval(secs => $3),
                    updated_at = now()
                WHERE id = (
                    SELECT id FROM migration_jobs
                    WHERE ($1::text IS NULL OR name = $1)
                      AND (
                        (lease_expires_at IS NULL
                            AND ($2 OR not_before IS NULL OR not_before <= now()))
                        OR lease_expires_at < now()
                      )
                    ORDER BY created_at, id
                    FOR UPDATE SKIP LOCKED
                    LIMIT 1
                )
                RETURNING {JOB_COLUMNS}
                "#
            ))
            .bind(name)
            .bind(filter.ignore_delay)
            .bind(lease.as_secs_f64())
            .fetch_optional(self.db.pool())
            .await
            .map_err(|e| map_sqlx_error("claim_next", e))
        })?;

        let Some(row) = row else {
            return Ok(None);
        };
        match JobRow::from_pg_row(&row).and_then(JobRow::into_job) {
            Ok(job) => {
                debug!(job_id = %job.id, migration = %job.name(), attempt = job.attempt, "claimed job");
                Ok(Some(job))
            }
            Err(QueueError::Serialization(reason)) => {
                let id: Uuid = row.try_get("id").map_err(|e| map_sqlx_error("claim_next", e))?;
                let attempt: i32 = row.try_get("attempt").map_err(|e| map_sqlx_error("claim_next", e))?;
                self.bury_undecodable(id, attempt, &reason)?;
                warn!(job_id = %id, error = %reason, "claimed job could not be decoded; dead-lettered");
                Err(QueueError::Undecodable {
                    id: JobId::from_uuid(id),
                    reason,
                })
            }
            Err(other) => Err(other),
        }
    }

    fn ack(&self, job: &ScheduledJob) -> Result<bool, QueueError> {
        let attempt = attempt_to_db(job.attempt)?;
        let result = self.db.block_on(async {
            sqlx::query("DELETE FROM migration_jobs WHERE id = $1 AND attempt = $2")
                .bind(*job.id.as_uuid())
                .bind(attempt)
                .execute(self.db.pool())
                .await
                .map_err(|e| map_sqlx_error("ack", e))
        })?;
        Ok(result.rows_affected() > 0)
    }

    fn requeue(
        &self,
        job: &ScheduledJob,
        not_before: DateTime<Utc>,
        error: &str,
    ) -> Result<bool, QueueError> {
        let attempt = attempt_to_db(job.attempt)?;
        let result = self.db.block_on(async {
            sqlx::query(
                r#"
                UPDATE migration_jobs
                SET lease_expires_at = NULL, not_before = $3, last_error = $4, updated_at = now()
                WHERE id = $1 AND attempt = $2
                "#,
            )
            .bind(*job.id.as_uuid())
            .bind(attempt)
            .bind(not_before)
            .bind(error)
            .execute(self.db.pool())
            .await
            .map_err(|e| map_sqlx_error("requeue", e))
        })?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, job, reason), fields(job_id = %job.id, migration = %job.name()), err)]
    fn dead_letter(
        &self,
        mut job: ScheduledJob,
        reason: String,
    ) -> Result<Option<DeadLetterEntry>, QueueError> {
        let claimed_attempt = attempt_to_db(job.attempt)?;
        job.state = JobState::Pending;
        job.last_error = Some(reason.clone());
        job.updated_at = Utc::now();
        let entry = DeadLetterEntry::new(job, reason);
        let row = JobRow::from_job(&entry.job)?;

        let moved = self.db.block_on(async {
            let mut tx = self
                .db
                .pool()
                .begin()
                .await
                .map_err(|e| map_sqlx_error("dead_letter", e))?;

            let deleted = sqlx::query("DELETE FROM migration_jobs WHERE id = $1 AND attempt = $2")
                .bind(row.id)
                .bind(claimed_attempt)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("dead_letter", e))?;
            if deleted.rows_affected() == 0 {
                tx.rollback().await.map_err(|e| map_sqlx_error("dead_letter", e))?;
                return Ok(false);
            }

            sqlx::query(
                r#"
                INSERT INTO migration_dead_letters
                    (id, name, args, attempt, last_error, created_at, reason, dead_lettered_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (id) DO UPDATE
                SET attempt = EXCLUDED.attempt,
                    last_error = EXCLUDED.last_error,
                    reason = EXCLUDED.reason,
                    dead_lettered_at = EXCLUDED.dead_lettered_at
                "#,
            )
            .bind(row.id)
            .bind(&row.name)
            .bind(&row.args)
            .bind(row.attempt)
            .bind(&row.last_error)
            .bind(row.created_at)
            .bind(&entry.reason)
            .bind(entry.dead_lettered_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("dead_letter", e))?;

            tx.commit().await.map_err(|e| map_sqlx_error("dead_letter", e))?;
            Ok::<_, QueueError>(true)
        })?;

        Ok(moved.then_some(entry))
    }

    fn count_pending(&self, name: &MigrationName) -> Result<usize, QueueError> {
        self.count("SELECT COUNT(*) FROM migration_jobs WHERE name = $1", name)
    }

    fn count_dead(&self, name: &MigrationName) -> Result<usize, QueueError> {
        self.count("SELECT COUNT(*) FROM migration_dead_letters WHERE name = $1", name)
    }

    fn list_dead_letters(
        &self,
        name: Option<&MigrationName>,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, QueueError> {
        let name = name.map(|n| n.as_str().to_string());
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = self.db.block_on(async {
            sqlx::query(
                r#"
                SELECT id, name, args, attempt, last_error, created_at, reason, dead_lettered_at
                FROM migration_dead_letters
                WHERE ($1::text IS NULL OR name = $1)
                ORDER BY dead_lettered_at, id
                LIMIT $2
                "#,
            )
            .bind(name)
            .bind(limit)
            .fetch_all(self.db.pool())
            .await
            .map_err(|e| map_sqlx_error("list_dead_letters", e))
        })?;

        Ok(rows
            .iter()
            .filter_map(|row| match dead_letter_from_row(row) {
                Ok(entry) => Some(entry),
                Err(err) => {
                    warn!(error = %err, "skipping dead letter that cannot be decoded");
                    None
                }
            })
            .collect())
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    fn retry_dead_letter(&self, id: JobId) -> Result<ScheduledJob, QueueError> {
        let row = self.db.block_on(async {
            let mut tx = self
                .db
                .pool()
                .begin()
                .await
                .map_err(|e| map_sqlx_error("retry_dead_letter", e))?;

            let row = sqlx::query(&format!(
                r#"
                WITH revived AS (
                    DELETE FROM migration_dead_letters WHERE id = $1
                    RETURNING id, name, args, last_error, created_at
                )
                INSERT INTO migration_jobs ({JOB_COLUMNS})
                SELECT id, name, args, 0, NULL::timestamptz, NULL::timestamptz, last_error, created_at, now()
                FROM revived
                RETURNING {JOB_COLUMNS}
                "#
            ))
            .bind(*id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("retry_dead_letter", e))?;

            tx.commit()
                .await
                .map_err(|e| map_sqlx_error("retry_dead_letter", e))?;
            Ok::<_, QueueError>(row)
        })?;

        let row = row.ok_or(QueueError::NotFound(id))?;
        JobRow::from_pg_row(&row)?.into_job()
    }

    fn delete_dead_letter(&self, id: JobId) -> Result<(), QueueError> {
        let result = self.db.block_on(async {
            sqlx::query("DELETE FROM migration_dead_letters WHERE id = $1")
                .bind(*id.as_uuid())
                .execute(self.db.pool())
                .await
                .map_err(|e| map_sqlx_error("delete_dead_letter", e))
        })?;

        if result.rows_affected() == 0 {
            return Err(QueueError::NotFound(id));
        }
        Ok(())
    }
}

impl PostgresJobQueue {
    /// Move a claimed row to the dead-letter queue without decoding it; the
    /// raw `name` and `args` are kept for inspection.
    fn bury_undecodable(&self, id: Uuid, attempt: i32, reason: &str) -> Result<(), QueueError> {
        self.db.block_on(async {
            sqlx::query(
                r#"
                WITH moved AS (
                    DELETE FROM migration_jobs WHERE id = $1 AND attempt = $2
                    RETURNING id, name, args, attempt, created_at
                )
                INSERT INTO migration_dead_letters
                    (id, name, args, attempt, last_error, created_at, reason, dead_lettered_at)
                SELECT id, name, args, attempt, $3, created_at, $3, now()
                FROM moved
                ON CONFLICT (id) DO UPDATE
                SET attempt = EXCLUDED.attempt,
                    last_error = EXCLUDED.last_error,
                    reason = EXCLUDED.reason,
                    dead_lettered_at = EXCLUDED.dead_lettered_at
                "#,
            )
            .bind(id)
            .bind(attempt)
            .bind(reason)
            .execute(self.db.pool())
            .await
            .map_err(|e| map_sqlx_error("bury_undecodable", e))
        })?;
        Ok(())
    }

    fn count(&self, sql: &'static str, name: &MigrationName) -> Result<usize, QueueError> {
        let count: i64 = self.db.block_on(async {
            sqlx::query_scalar::<_, i64>(sql)
                .bind(name.as_str())
                .fetch_one(self.db.pool())
                .await
                .map_err(|e| map_sqlx_error("count", e))
        })?;
        Ok(usize::try_from(count).unwrap_or(0))
    }
}

/// Column-level representation of a `migration_jobs` row.
struct JobRow {
    id: Uuid,
    name: String,
    args: serde_json::Value,
    attempt: i32,
    not_before: Option<DateTime<Utc>>,
    lease_expires_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl JobRow {
    fn from_job(job: &ScheduledJob) -> Result<Self, QueueError> {
        let lease_expires_at = match job.state {
            JobState::Pending => None,
            JobState::Running { lease_expires_at } => Some(lease_expires_at),
        };
        Ok(Self {
            id: *job.id.as_uuid(),
            name: job.name().as_str().to_string(),
            args: serde_json::to_value(&job.payload.args)
                .map_err(|e| QueueError::Serialization(e.to_string()))?,
            attempt: attempt_to_db(job.attempt)?,
            not_before: job.not_before,
            lease_expires_at,
            last_error: job.last_error.clone(),
            created_at: job.created_at,
            updated_at: job.updated_at,
        })
    }

    fn from_pg_row(row: &PgRow) -> Result<Self, QueueError> {
        let decode = |e: sqlx::Error| QueueError::Serialization(e.to_string());
        Ok(Self {
            id: row.try_get("id").map_err(decode)?,
            name: row.try_get("name").map_err(decode)?,
            args: row.try_get("args").map_err(decode)?,
            attempt: row.try_get("attempt").map_err(decode)?,
            not_before: row.try_get("not_before").map_err(decode)?,
            lease_expires_at: row.try_get("lease_expires_at").map_err(decode)?,
            last_error: row.try_get("last_error").map_err(decode)?,
            created_at: row.try_get("created_at").map_err(decode)?,
            updated_at: row.try_get("updated_at").map_err(decode)?,
        })
    }

    fn into_job(self) -> Result<ScheduledJob, QueueError> {
        let name = MigrationName::new(self.name).map_err(|e| QueueError::Serialization(e.to_string()))?;
        let args: ArgumentList =
            serde_json::from_value(self.args).map_err(|e| QueueError::Serialization(e.to_string()))?;
        let state = match self.lease_expires_at {
            None => JobState::Pending,
            Some(lease_expires_at) => JobState::Running { lease_expires_at },
        };

        Ok(ScheduledJob {
            id: JobId::from_uuid(self.id),
            payload: JobPayload::new(name, args),
            state,
            attempt: u32::try_from(self.attempt).unwrap_or(0),
            not_before: self.not_before,
            last_error: self.last_error,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn dead_letter_from_row(row: &PgRow) -> Result<DeadLetterEntry, QueueError> {
    let decode = |e: sqlx::Error| QueueError::Serialization(e.to_string());
    let created_at: DateTime<Utc> = row.try_get("created_at").map_err(decode)?;
    let dead_lettered_at: DateTime<Utc> = row.try_get("dead_lettered_at").map_err(decode)?;

    let job = JobRow {
        id: row.try_get("id").map_err(decode)?,
        name: row.try_get("name").map_err(decode)?,
        args: row.try_get("args").map_err(decode)?,
        attempt: row.try_get("attempt").map_err(decode)?,
        not_before: None,
        lease_expires_at: None,
        last_error: row.try_get("last_error").map_err(decode)?,
        created_at,
        updated_at: dead_lettered_at,
    }
    .into_job()?;

    Ok(DeadLetterEntry {
        job,
        reason: row.try_get("reason").map_err(decode)?,
        dead_lettered_at,
    })
}

fn attempt_to_db(attempt: u32) -> Result<i32, QueueError> {
    i32::try_from(attempt).map_err(|_| QueueError::Serialization(format!("attempt out of range: {attempt}")))
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some("23505"),
        _ => false,
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> QueueError {
    match err {
        sqlx::Error::Database(db_err) => {
            QueueError::Storage(format!("database error in {}: {}", operation, db_err.message()))
        }
        sqlx::Error::Decode(e) | sqlx::Error::ColumnDecode { source: e, .. } => {
            QueueError::Serialization(format!("decode error in {}: {}", operation, e))
        }
        sqlx::Error::PoolClosed => QueueError::Storage(format!("connection pool closed in {}", operation)),
        _ => QueueError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}
