//! Postgres-backed job store.
//!
//! Every transition is a single conditional `UPDATE ... WHERE status = ...`
//! executed in a transaction together with its attempt row and event, so a
//! transition either lands completely or not at all. Running the same worker
//! code from several processes is safe: the `WHERE` clause picks exactly one
//! winner and every loser sees zero rows.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError |
//! |------------|----------------------|---------------|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (check constraint violation) | `23514` | `Validation` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed / Io / Other | N/A | `Storage` |

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::{Span, instrument};
use uuid::Uuid;

use jobqueue_core::{
    ErrorCode, Event, EventKind, Job, JobAttempt, JobFilter, JobId, JobStats, JobStatus, NewJob,
    TraceId, Usage, WorkerHeartbeat, WorkerId, WorkerState,
};

use super::details;
use super::store::{JobStore, JobStoreError, not_in_state, validate_limit};

const JOB_COLUMNS: &str = "id, tenant_id, status, priority, model, payload, idempotency_key, \
     attempt, max_attempts, created_at, started_at, finished_at, error_code, error_message, trace_id";

const ATTEMPT_COLUMNS: &str = "job_id, attempt, started_at, finished_at, success, error_code, \
     error_message, tokens, cost_usd, provider_meta";

/// Postgres-backed job store.
///
/// Uses the SQLx connection pool, which is `Send + Sync`; clones share it.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub async fn connect(database_url: &str) -> Result<Self, JobStoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Apply the bundled schema. Idempotent.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), JobStoreError> {
        sqlx::raw_sql(include_str!("../../migrations/0001_init.sql"))
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>, JobStoreError> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))
    }

    async fn find_by_idempotency_key(
        &self,
        tenant_id: &str,
        key: &str,
    ) -> Result<Job, JobStoreError> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE tenant_id = $1 AND idempotency_key = $2"
        ))
        .bind(tenant_id)
        .bind(key)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_by_idempotency_key", e))?
        .ok_or_else(|| {
            JobStoreError::NotFound(format!("job for tenant {tenant_id} and key {key} not found"))
        })?;
        job_from_row(&row)
    }
}

/// Zero rows: the job left `running`, or moved on to another attempt.
fn expect_one_row(rows: u64, job_id: JobId, attempt: i32) -> Result<(), JobStoreError> {
    if rows == 0 {
        return Err(not_in_state(job_id, &format!("running attempt {attempt}")));
    }
    Ok(())
}

async fn commit(tx: Transaction<'_, Postgres>) -> Result<(), JobStoreError> {
    tx.commit()
        .await
        .map_err(|e| map_sqlx_error("commit_transaction", e))
}

async fn append_event(
    tx: &mut Transaction<'_, Postgres>,
    kind: EventKind,
    job_id: JobId,
    worker_id: Option<&WorkerId>,
    details: &str,
) -> Result<(), JobStoreError> {
    sqlx::query(
        r#"
        INSERT INTO events (event_type, job_id, worker_id, details, created_at)
        VALUES ($1, $2, $3, $4, now())
        "#,
    )
    .bind(kind.as_str())
    .bind(job_id.as_uuid())
    .bind(worker_id.map(WorkerId::as_str))
    .bind(details)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("insert_event", e))?;
    Ok(())
}

enum AttemptOutcome<'a> {
    Succeeded(&'a Usage),
    Failed(ErrorCode, &'a str),
}

/// Finalize the open attempt row, inserting it if the start was never recorded.
///
/// Rows that are already finalized are left untouched.
async fn finalize_attempt(
    tx: &mut Transaction<'_, Postgres>,
    job_id: JobId,
    attempt: i32,
    outcome: AttemptOutcome<'_>,
) -> Result<(), JobStoreError> {
    let (success, error_code, error_message, tokens, cost_usd, provider_meta) = match outcome {
        AttemptOutcome::Succeeded(usage) => (
            true,
            None,
            None,
            usage.tokens,
            usage.cost_usd,
            usage.provider_meta.clone(),
        ),
        AttemptOutcome::Failed(code, message) => (
            false,
            Some(code.as_str()),
            Some(message),
            0,
            0.0,
            JsonValue::Object(Default::default()),
        ),
    };

    let updated = sqlx::query(
        r#"
        UPDATE job_attempts
        SET finished_at = now(), success = $3, error_code = $4, error_message = $5,
            tokens = $6, cost_usd = $7, provider_meta = $8
        WHERE job_id = $1 AND attempt = $2 AND finished_at IS NULL
        "#,
    )
    .bind(job_id.as_uuid())
    .bind(attempt)
    .bind(success)
    .bind(error_code)
    .bind(error_message)
    .bind(tokens)
    .bind(cost_usd)
    .bind(&provider_meta)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("finalize_attempt", e))?;

    if updated.rows_affected() == 0 {
        sqlx::query(
            r#"
            INSERT INTO job_attempts (
                job_id, attempt, started_at, finished_at, success,
                error_code, error_message, tokens, cost_usd, provider_meta
            )
            VALUES ($1, $2, now(), now(), $3, $4, $5, $6, $7, $8)
            ON CONFLICT (job_id, attempt) DO NOTHING
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(attempt)
        .bind(success)
        .bind(error_code)
        .bind(error_message)
        .bind(tokens)
        .bind(cost_usd)
        .bind(&provider_meta)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("insert_missing_attempt", e))?;
    }
    Ok(())
}

#[async_trait::async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(
        skip(self, input),
        fields(tenant_id = %input.tenant_id, idempotent_replay = tracing::field::Empty),
        err
    )]
    async fn create_job(&self, input: NewJob) -> Result<(Job, bool), JobStoreError> {
        input.validate()?;
        let input = input.normalized();
        let job_id = JobId::new();
        let trace_id = TraceId::new();

        let mut tx = self.begin().await?;
        let inserted = sqlx::query(&format!(
            r#"
            INSERT INTO jobs (
                id, tenant_id, status, priority, model, payload, idempotency_key,
                attempt, max_attempts, created_at, trace_id
            )
            VALUES ($1, $2, 'queued', $3, $4, $5, $6, 0, $7, now(), $8)
            ON CONFLICT (tenant_id, idempotency_key) DO NOTHING
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job_id.as_uuid())
        .bind(&input.tenant_id)
        .bind(input.priority)
        .bind(&input.model)
        .bind(&input.payload)
        .bind(input.idempotency_key.as_deref())
        .bind(input.max_attempts)
        .bind(trace_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_job", e))?;

        if let Some(row) = inserted {
            let job = job_from_row(&row)?;
            append_event(&mut tx, EventKind::Created, job.id, None, details::CREATED).await?;
            commit(tx).await?;
            return Ok((job, false));
        }
        drop(tx);

        let Some(key) = input.idempotency_key.as_deref() else {
            return Err(JobStoreError::Conflict(format!(
                "job {job_id} conflicted without an idempotency key"
            )));
        };
        Span::current().record("idempotent_replay", true);
        let existing = self.find_by_idempotency_key(&input.tenant_id, key).await?;
        Ok((existing, true))
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn get_job(&self, job_id: JobId) -> Result<(Job, Option<JobAttempt>), JobStoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?
            .ok_or_else(|| JobStoreError::NotFound(format!("job {job_id} not found")))?;
        let job = job_from_row(&row)?;

        let latest = sqlx::query(&format!(
            "SELECT {ATTEMPT_COLUMNS} FROM job_attempts WHERE job_id = $1 ORDER BY attempt DESC LIMIT 1"
        ))
        .bind(job_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_latest_attempt", e))?
        .map(|row| attempt_from_row(&row))
        .transpose()?;

        Ok((job, latest))
    }

    #[instrument(skip(self), err)]
    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError> {
        validate_limit(filter.limit)?;
        let filter = filter.clone().normalized();

        let (past, direction) = if filter.oldest_first { (">", "ASC") } else { ("<", "DESC") };
        let (after_at, after_id) = filter.after.map(|(at, id)| (at, *id.as_uuid())).unzip();

        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE ($1::text IS NULL OR status = $1)
                AND ($2::text IS NULL OR tenant_id = $2)
                AND ($3::text IS NULL OR model = $3)
                AND ($4::timestamptz IS NULL OR created_at < $4)
                AND ($5::timestamptz IS NULL OR (created_at, id) {past} ($5, $6::uuid))
            ORDER BY created_at {direction}, id {direction}
            LIMIT $7
            "#
        ))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.tenant_id.as_deref())
        .bind(filter.model.as_deref())
        .bind(filter.created_before)
        .bind(after_at)
        .bind(after_id)
        .bind(i64::try_from(filter.limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_jobs", e))?;

        rows.iter().map(job_from_row).collect()
    }

    #[instrument(skip(self), fields(job_id = %job_id, worker_id = %worker_id), err)]
    async fn mark_running(
        &self,
        job_id: JobId,
        worker_id: &WorkerId,
    ) -> Result<Option<Job>, JobStoreError> {
        let mut tx = self.begin().await?;
        let row = sqlx::query(&format!(
            r#"
            UPDATE jobs
            SET status = 'running', started_at = now(), finished_at = NULL,
                attempt = attempt + 1, error_code = NULL, error_message = NULL
            WHERE id = $1 AND status = 'queued'
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("mark_running", e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let job = job_from_row(&row)?;

        sqlx::query(
            r#"
            INSERT INTO job_attempts (job_id, attempt, started_at)
            VALUES ($1, $2, now())
            ON CONFLICT (job_id, attempt) DO UPDATE
            SET started_at = excluded.started_at, finished_at = NULL, success = NULL,
                error_code = NULL, error_message = NULL, tokens = 0, cost_usd = 0,
                provider_meta = '{}'::jsonb
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(job.attempt)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("open_attempt", e))?;

        append_event(&mut tx, EventKind::Started, job_id, Some(worker_id), details::STARTED)
            .await?;
        commit(tx).await?;
        Ok(Some(job))
    }

    #[instrument(skip(self, usage), fields(job_id = %job_id, worker_id = %worker_id), err)]
    async fn mark_succeeded(
        &self,
        job_id: JobId,
        attempt: i32,
        worker_id: &WorkerId,
        usage: &Usage,
    ) -> Result<(), JobStoreError> {
        let mut tx = self.begin().await?;
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'succeeded', finished_at = now(), error_code = NULL, error_message = NULL
            WHERE id = $1 AND status = 'running' AND attempt = $2
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(attempt)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("mark_succeeded", e))
        .and_then(|done| expect_one_row(done.rows_affected(), job_id, attempt))?;

        finalize_attempt(&mut tx, job_id, attempt, AttemptOutcome::Succeeded(usage)).await?;
        append_event(&mut tx, EventKind::Succeeded, job_id, Some(worker_id), details::SUCCEEDED)
            .await?;
        commit(tx).await
    }

    #[instrument(skip(self, message), fields(job_id = %job_id, worker_id = %worker_id, code = %code), err)]
    async fn mark_failed(
        &self,
        job_id: JobId,
        attempt: i32,
        worker_id: &WorkerId,
        code: ErrorCode,
        message: &str,
    ) -> Result<(), JobStoreError> {
        let mut tx = self.begin().await?;
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'failed', finished_at = now(), error_code = $3, error_message = $4
            WHERE id = $1 AND status = 'running' AND attempt = $2
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(attempt)
        .bind(code.as_str())
        .bind(message)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("mark_failed", e))
        .and_then(|done| expect_one_row(done.rows_affected(), job_id, attempt))?;

        finalize_attempt(&mut tx, job_id, attempt, AttemptOutcome::Failed(code, message)).await?;
        append_event(
            &mut tx,
            EventKind::Failed,
            job_id,
            Some(worker_id),
            &details::failed(code),
        )
        .await?;
        commit(tx).await
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn cancel_job(&self, job_id: JobId, reason: &str) -> Result<Job, JobStoreError> {
        let mut tx = self.begin().await?;
        let row = sqlx::query(&format!(
            r#"
            UPDATE jobs
            SET status = 'cancelled', finished_at = now(), error_code = $2, error_message = $3
            WHERE id = $1 AND status IN ('queued', 'running', 'retry_scheduled')
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job_id.as_uuid())
        .bind(ErrorCode::Cancelled.as_str())
        .bind(reason)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("cancel_job", e))?
        .ok_or_else(|| not_in_state(job_id, "cancellable"))?;
        let job = job_from_row(&row)?;

        // Only a running job has an open attempt.
        sqlx::query(
            r#"
            UPDATE job_attempts
            SET finished_at = now(), success = false, error_code = $3, error_message = $4
            WHERE job_id = $1 AND attempt = $2 AND finished_at IS NULL
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(job.attempt)
        .bind(ErrorCode::Cancelled.as_str())
        .bind(reason)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("cancel_attempt", e))?;

        append_event(&mut tx, EventKind::Cancelled, job_id, None, reason).await?;
        commit(tx).await?;
        Ok(job)
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn retry_job(&self, job_id: JobId) -> Result<Job, JobStoreError> {
        let mut tx = self.begin().await?;
        let row = sqlx::query(&format!(
            r#"
            UPDATE jobs
            SET status = 'queued', finished_at = NULL, error_code = NULL, error_message = NULL
            WHERE id = $1 AND status IN ('failed', 'retry_scheduled', 'dlq', 'cancelled')
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("retry_job", e))?
        .ok_or_else(|| not_in_state(job_id, "retryable"))?;
        let job = job_from_row(&row)?;

        append_event(&mut tx, EventKind::RetryScheduled, job_id, None, details::RETRIED).await?;
        commit(tx).await?;
        Ok(job)
    }

    #[instrument(skip(self), fields(worker_id = %worker_id), err)]
    async fn upsert_worker_heartbeat(
        &self,
        worker_id: &WorkerId,
        state: WorkerState,
        running_job_id: Option<JobId>,
        concurrency: i32,
    ) -> Result<(), JobStoreError> {
        sqlx::query(
            r#"
            INSERT INTO workers (worker_id, last_heartbeat_at, state, running_job_id, concurrency)
            VALUES ($1, now(), $2, $3, $4)
            ON CONFLICT (worker_id) DO UPDATE
            SET last_heartbeat_at = excluded.last_heartbeat_at,
                state = excluded.state,
                running_job_id = excluded.running_job_id,
                concurrency = excluded.concurrency
            "#,
        )
        .bind(worker_id.as_str())
        .bind(state.as_str())
        .bind(running_job_id.map(Uuid::from))
        .bind(concurrency)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("upsert_worker_heartbeat", e))?;
        Ok(())
    }

    async fn list_workers(&self) -> Result<Vec<WorkerHeartbeat>, JobStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT worker_id, last_heartbeat_at, state, running_job_id, concurrency
            FROM workers
            ORDER BY worker_id ASC
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_workers", e))?;

        rows.iter().map(worker_from_row).collect()
    }

    async fn list_events(&self, job_id: JobId, limit: usize) -> Result<Vec<Event>, JobStoreError> {
        validate_limit(limit)?;
        let rows = sqlx::query(
            r#"
            SELECT id, event_type, job_id, worker_id, details, created_at
            FROM events
            WHERE job_id = $1
            ORDER BY id ASC
            LIMIT $2
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_events", e))?;

        rows.iter()
            .map(|row| {
                EventRow::from_row(row)
                    .map(Event::from)
                    .map_err(|e| decode_error("event", e))
            })
            .collect()
    }

    async fn job_stats(&self) -> Result<JobStats, JobStoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS count FROM jobs GROUP BY status")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("job_stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(|e| decode_error("stats", e))?;
            let count: i64 = row.try_get("count").map_err(|e| decode_error("stats", e))?;
            stats.record(parse_status(&status)?, count.max(0) as u64);
        }
        Ok(stats)
    }

    #[instrument(skip(self), fields(requeued = tracing::field::Empty), err)]
    async fn requeue_orphaned(&self, stale_after: Duration) -> Result<Vec<Job>, JobStoreError> {
        let mut tx = self.begin().await?;
        // SKIP LOCKED: rows being transitioned elsewhere are picked up next pass.
        let rows = sqlx::query(&format!(
            r#"
            WITH orphaned AS (
                SELECT j.id AS orphan_id
                FROM jobs j
                WHERE j.status = 'running'
                    AND j.started_at <= now() - make_interval(secs => $1)
                    AND NOT EXISTS (
                        SELECT 1 FROM workers w
                        WHERE w.running_job_id = j.id
                            AND w.last_heartbeat_at > now() - make_interval(secs => $1)
                    )
                ORDER BY j.id
                FOR UPDATE OF j SKIP LOCKED
            )
            UPDATE jobs
            SET status = 'queued', finished_at = NULL, error_code = $2, error_message = $3
            FROM orphaned
            WHERE jobs.id = orphaned.orphan_id AND jobs.status = 'running'
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(stale_after.as_secs_f64())
        .bind(ErrorCode::WorkerLost.as_str())
        .bind(details::WORKER_LOST)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("requeue_orphaned", e))?;

        let mut requeued = Vec::with_capacity(rows.len());
        for row in &rows {
            let job = job_from_row(row)?;
            finalize_attempt(
                &mut tx,
                job.id,
                job.attempt,
                AttemptOutcome::Failed(ErrorCode::WorkerLost, details::WORKER_LOST),
            )
            .await?;
            append_event(&mut tx, EventKind::Requeued, job.id, None, details::WORKER_LOST).await?;
            requeued.push(job);
        }
        commit(tx).await?;

        Span::current().record("requeued", requeued.len());
        Ok(requeued)
    }

    async fn ping(&self) -> Result<(), JobStoreError> {
        sqlx::query("SELECT 1")
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ping", e))?;
        Ok(())
    }
}

#[derive(Debug)]
struct JobRow {
    id: Uuid,
    tenant_id: String,
    status: String,
    priority: i32,
    model: String,
    payload: JsonValue,
    idempotency_key: Option<String>,
    attempt: i32,
    max_attempts: i32,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    error_code: Option<String>,
    error_message: Option<String>,
    trace_id: Uuid,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for JobRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            status: row.try_get("status")?,
            priority: row.try_get("priority")?,
            model: row.try_get("model")?,
            payload: row.try_get("payload")?,
            idempotency_key: row.try_get("idempotency_key")?,
            attempt: row.try_get("attempt")?,
            max_attempts: row.try_get("max_attempts")?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
            error_code: row.try_get("error_code")?,
            error_message: row.try_get("error_message")?,
            trace_id: row.try_get("trace_id")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Job {
            id: JobId::from_uuid(row.id),
            tenant_id: row.tenant_id,
            status: parse_status(&row.status)?,
            priority: row.priority,
            model: row.model,
            payload: row.payload,
            idempotency_key: row.idempotency_key,
            attempt: row.attempt,
            max_attempts: row.max_attempts,
            created_at: row.created_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
            error_code: row.error_code.as_deref().map(parse_error_code).transpose()?,
            error_message: row.error_message,
            trace_id: TraceId::from_uuid(row.trace_id),
        })
    }
}

#[derive(Debug)]
struct AttemptRow {
    job_id: Uuid,
    attempt: i32,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    success: Option<bool>,
    error_code: Option<String>,
    error_message: Option<String>,
    tokens: i64,
    cost_usd: f64,
    provider_meta: JsonValue,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for AttemptRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(AttemptRow {
            job_id: row.try_get("job_id")?,
            attempt: row.try_get("attempt")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
            success: row.try_get("success")?,
            error_code: row.try_get("error_code")?,
            error_message: row.try_get("error_message")?,
            tokens: row.try_get("tokens")?,
            cost_usd: row.try_get("cost_usd")?,
            provider_meta: row.try_get("provider_meta")?,
        })
    }
}

impl TryFrom<AttemptRow> for JobAttempt {
    type Error = JobStoreError;

    fn try_from(row: AttemptRow) -> Result<Self, Self::Error> {
        Ok(JobAttempt {
            job_id: JobId::from_uuid(row.job_id),
            attempt: row.attempt,
            started_at: row.started_at,
            finished_at: row.finished_at,
            success: row.success,
            error_code: row.error_code.as_deref().map(parse_error_code).transpose()?,
            error_message: row.error_message,
            tokens: row.tokens,
            cost_usd: row.cost_usd,
            provider_meta: row.provider_meta,
        })
    }
}

#[derive(Debug)]
struct EventRow {
    id: i64,
    event_type: String,
    job_id: Option<Uuid>,
    worker_id: Option<String>,
    details: String,
    created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for EventRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(EventRow {
            id: row.try_get("id")?,
            event_type: row.try_get("event_type")?,
            job_id: row.try_get("job_id")?,
            worker_id: row.try_get("worker_id")?,
            details: row.try_get("details")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl From<EventRow> for Event {
    fn from(row: EventRow) -> Self {
        Event {
            id: row.id,
            event_type: row.event_type,
            job_id: row.job_id.map(JobId::from_uuid),
            worker_id: row.worker_id.map(WorkerId::from),
            details: row.details,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug)]
struct WorkerRow {
    worker_id: String,
    last_heartbeat_at: DateTime<Utc>,
    state: String,
    running_job_id: Option<Uuid>,
    concurrency: i32,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for WorkerRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(WorkerRow {
            worker_id: row.try_get("worker_id")?,
            last_heartbeat_at: row.try_get("last_heartbeat_at")?,
            state: row.try_get("state")?,
            running_job_id: row.try_get("running_job_id")?,
            concurrency: row.try_get("concurrency")?,
        })
    }
}

impl TryFrom<WorkerRow> for WorkerHeartbeat {
    type Error = JobStoreError;

    fn try_from(row: WorkerRow) -> Result<Self, Self::Error> {
        Ok(WorkerHeartbeat {
            worker_id: WorkerId::from(row.worker_id),
            last_heartbeat_at: row.last_heartbeat_at,
            state: row
                .state
                .parse()
                .map_err(|_| JobStoreError::Storage(format!("unknown worker state {:?}", row.state)))?,
            running_job_id: row.running_job_id.map(JobId::from_uuid),
            concurrency: row.concurrency,
        })
    }
}

fn job_from_row(row: &sqlx::postgres::PgRow) -> Result<Job, JobStoreError> {
    JobRow::from_row(row)
        .map_err(|e| decode_error("job", e))?
        .try_into()
}

fn attempt_from_row(row: &sqlx::postgres::PgRow) -> Result<JobAttempt, JobStoreError> {
    AttemptRow::from_row(row)
        .map_err(|e| decode_error("job attempt", e))?
        .try_into()
}

fn worker_from_row(row: &sqlx::postgres::PgRow) -> Result<WorkerHeartbeat, JobStoreError> {
    WorkerRow::from_row(row)
        .map_err(|e| decode_error("worker", e))?
        .try_into()
}

fn parse_status(raw: &str) -> Result<JobStatus, JobStoreError> {
    raw.parse()
        .map_err(|_| JobStoreError::Storage(format!("unknown job status {raw:?} in storage")))
}

fn parse_error_code(raw: &str) -> Result<ErrorCode, JobStoreError> {
    raw.parse()
        .map_err(|_| JobStoreError::Storage(format!("unknown error code {raw:?} in storage")))
}

fn decode_error(what: &str, err: sqlx::Error) -> JobStoreError {
    JobStoreError::Storage(format!("failed to deserialize {what} row: {err}"))
}

/// Map SQLx errors to JobStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => JobStoreError::Conflict(msg),
                Some("23514") => JobStoreError::Validation(msg),
                _ => JobStoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}
