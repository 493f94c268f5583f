//! Postgres-backed job store.
//!
//! ## Claiming
//!
//! `claim_next` is a single `UPDATE … WHERE id = (SELECT … FOR UPDATE SKIP
//! LOCKED LIMIT 1) RETURNING *`. Rows locked by a concurrent claimer are
//! skipped rather than waited on, so N workers polling at once each get a
//! distinct job (or nothing).
//!
//! ## Transitions
//!
//! Every other transition loads the row with `SELECT … FOR UPDATE` inside a
//! transaction, applies the same `Job::mark_*` method the in-memory store
//! uses, and writes the mutable columns back. The row lock serializes a
//! completing worker against the reaper; whoever commits second sees the new
//! status and fails its guard.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError | Scenario |
//! |------------|----------------------|---------------|----------|
//! | Database (unique violation) | `23505` | `Conflict` | Duplicate id, or reinstating onto a taken dedupe key |
//! | Database (check constraint violation) | `23514` | `Validation` | Row violates a schema CHECK |
//! | Database (other) | Any other | `Storage` | Other database errors |
//! | PoolClosed / Other | N/A | `Storage` | Network errors, closed pool, etc. |

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, instrument};
use uuid::Uuid;

use kitqueue_core::{JobId, RunId};

use super::{EnqueueOutcome, FailOutcome, JobStore, JobStoreError, ReapReport};
use crate::jobs::backoff::deadline_after;
use crate::jobs::monitor::{QueueDepth, WorkerLeases};
use crate::jobs::types::{ArtifactRef, Failure, Job, JobStatus, ReclaimAction};

const SCHEMA: &str = include_str!("../../../migrations/0001_create_jobs.sql");

/// Attempts at resolving a dedupe race before giving up.
const ENQUEUE_RACE_RETRIES: usize = 3;

const JOB_COLUMNS: &str = r#"
    id, job_type, name, dedupe_key, payload, priority, status, scheduled_at,
    claimed_by, claim_expires_at, attempt, max_attempts, retry_backoff_seconds,
    next_retry_at, result, metrics, error_message, error_detail, execution_id,
    tags, metadata, created_at, updated_at, started_at, completed_at
"#;

/// Postgres-backed job store.
///
/// `Send + Sync`; all access goes through the SQLx pool.
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

    /// Open a pool against `database_url`.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, JobStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the job tables and indexes if they do not exist.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), JobStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>, JobStoreError> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))
    }

    /// Attach artifacts to a batch of rows with one extra query.
    async fn hydrate(&self, rows: Vec<PgRow>) -> Result<Vec<Job>, JobStoreError> {
        let mut jobs = rows
            .iter()
            .map(|row| JobRow::from_pg(row).and_then(Job::try_from))
            .collect::<Result<Vec<_>, _>>()?;
        if jobs.is_empty() {
            return Ok(jobs);
        }

        let ids: Vec<Uuid> = jobs.iter().map(|j| *j.id.as_uuid()).collect();
        let artifact_rows = sqlx::query(
            r#"
            SELECT job_id, locator, content_type, size_bytes, checksum, created_at
            FROM job_artifacts
            WHERE job_id = ANY($1)
            ORDER BY created_at ASC, locator ASC
            "#,
        )
        .bind(&ids)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_artifacts", e))?;

        let mut by_job: HashMap<JobId, Vec<ArtifactRef>> = HashMap::new();
        for row in &artifact_rows {
            let artifact = ArtifactRow::from_pg(row)?.into_ref()?;
            by_job.entry(artifact.job_id).or_default().push(artifact);
        }
        for job in &mut jobs {
            if let Some(artifacts) = by_job.remove(&job.id) {
                job.artifacts = artifacts;
            }
        }
        Ok(jobs)
    }

    async fn hydrate_one(&self, row: PgRow) -> Result<Job, JobStoreError> {
        let mut jobs = self.hydrate(vec![row]).await?;
        jobs.pop()
            .ok_or_else(|| JobStoreError::Storage("row vanished during hydration".to_string()))
    }

    /// Run `f` against the locked row and persist the result.
    async fn transition<T, F>(
        &self,
        operation: &'static str,
        job_id: JobId,
        f: F,
    ) -> Result<(Job, T), JobStoreError>
    where
        F: FnOnce(&mut Job) -> Result<T, JobStoreError> + Send,
        T: Send,
    {
        let mut tx = self.begin().await?;
        let mut job = lock_job(&mut tx, operation, job_id).await?;
        let out = f(&mut job)?;
        write_back(&mut tx, operation, &job).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        let artifacts = self.get(job_id).await?.map(|j| j.artifacts).unwrap_or_default();
        job.artifacts = artifacts;
        Ok((job, out))
    }

    /// Same as [`Self::transition`], but only for the current lease owner.
    async fn owned_transition<T, F>(
        &self,
        operation: &'static str,
        job_id: JobId,
        worker_id: &str,
        f: F,
    ) -> Result<(Job, T), JobStoreError>
    where
        F: FnOnce(&mut Job) -> Result<T, JobStoreError> + Send,
        T: Send,
    {
        self.transition(operation, job_id, |job| {
            if !job.is_leased_by(worker_id) {
                return Err(JobStoreError::StaleLease(format!(
                    "job {} is not leased by {worker_id} (status {}, owner {:?})",
                    job.id, job.status, job.claimed_by
                )));
            }
            f(job)
        })
        .await
    }

    async fn active_holder(&self, dedupe_key: &str) -> Result<Option<JobId>, JobStoreError> {
        let row = sqlx::query(
            r#"
            SELECT id FROM jobs
            WHERE dedupe_key = $1
              AND status NOT IN ('completed', 'failed', 'cancelled', 'dead_letter')
            "#,
        )
        .bind(dedupe_key)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_dedupe_holder", e))?;

        row.map(|r| r.try_get::<Uuid, _>("id").map(JobId::from_uuid))
            .transpose()
            .map_err(|e| map_sqlx_error("find_dedupe_holder", e))
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id, job_type = %job.job_type), err)]
    async fn enqueue(&self, job: Job) -> Result<EnqueueOutcome, JobStoreError> {
        let row = JobRow::from(&job);

        for _ in 0..ENQUEUE_RACE_RETRIES {
            let inserted = sqlx::query(
                r#"
                INSERT INTO jobs (
                    id, job_type, name, dedupe_key, payload, priority, status, scheduled_at,
                    claimed_by, claim_expires_at, attempt, max_attempts, retry_backoff_seconds,
                    next_retry_at, result, metrics, error_message, error_detail, execution_id,
                    tags, metadata, created_at, updated_at, started_at, completed_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
                        $16, $17, $18, $19, $20, $21, $22, $23, $24, $25)
                ON CONFLICT (dedupe_key)
                    WHERE dedupe_key IS NOT NULL
                      AND status NOT IN ('completed', 'failed', 'cancelled', 'dead_letter')
                DO NOTHING
                RETURNING id
                "#,
            )
            .bind(row.id)
            .bind(&row.job_type)
            .bind(&row.name)
            .bind(&row.dedupe_key)
            .bind(&row.payload)
            .bind(row.priority)
            .bind(&row.status)
            .bind(row.scheduled_at)
            .bind(&row.claimed_by)
            .bind(row.claim_expires_at)
            .bind(row.attempt)
            .bind(row.max_attempts)
            .bind(row.retry_backoff_seconds)
            .bind(row.next_retry_at)
            .bind(&row.result)
            .bind(&row.metrics)
            .bind(&row.error_message)
            .bind(&row.error_detail)
            .bind(row.execution_id)
            .bind(&row.tags)
            .bind(&row.metadata)
            .bind(row.created_at)
            .bind(row.updated_at)
            .bind(row.started_at)
            .bind(row.completed_at)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("insert_job", e))?;

            if inserted.is_some() {
                return Ok(EnqueueOutcome {
                    job_id: job.id,
                    created: true,
                });
            }

            // Only the dedupe index can swallow the insert.
            let Some(key) = job.dedupe_key.as_deref() else {
                return Err(JobStoreError::Storage(
                    "insert returned no row without a dedupe key".to_string(),
                ));
            };
            if let Some(existing) = self.active_holder(key).await? {
                debug!(dedupe_key = key, existing = %existing, "dedupe hit");
                return Ok(EnqueueOutcome {
                    job_id: existing,
                    created: false,
                });
            }
            // The holder went terminal between our insert and lookup; try again.
        }

        Err(JobStoreError::Conflict(format!(
            "dedupe key {:?} kept changing hands during enqueue",
            job.dedupe_key
        )))
    }

    #[instrument(skip(self), err)]
    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?;

        match row {
            Some(row) => Ok(Some(self.hydrate_one(row).await?)),
            None => Ok(None),
        }
    }

    #[instrument(skip(self, job_types), err)]
    async fn claim_next(
        &self,
        worker_id: &str,
        job_types: Option<&[String]>,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        let expires_at = deadline_after(now, lease);
        let types: Option<Vec<String>> = job_types.map(<[String]>::to_vec);

        let row = sqlx::query(&format!(
            r#"
            UPDATE jobs
            SET status = 'claimed',
                claimed_by = $1,
                claim_expires_at = $2,
                attempt = attempt + 1,
                updated_at = $3
            WHERE id = (
                SELECT id FROM jobs
                WHERE status = 'pending'
                  AND scheduled_at <= $3
                  AND attempt < max_attempts
                  AND ($4::text[] IS NULL OR job_type = ANY($4))
                ORDER BY priority DESC, scheduled_at ASC, created_at ASC, id ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(worker_id)
        .bind(expires_at)
        .bind(now)
        .bind(types)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_next", e))?;

        match row {
            Some(row) => Ok(Some(self.hydrate_one(row).await?)),
            None => Ok(None),
        }
    }

    #[instrument(skip(self), err)]
    async fn start(
        &self,
        job_id: JobId,
        worker_id: &str,
        execution_id: Option<RunId>,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError> {
        let (job, ()) = self
            .owned_transition("start", job_id, worker_id, |job| {
                Ok(job.mark_running(worker_id, execution_id, now)?)
            })
            .await?;
        Ok(job)
    }

    #[instrument(skip(self), err)]
    async fn extend_lease(
        &self,
        job_id: JobId,
        worker_id: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, JobStoreError> {
        let (_, expires_at) = self
            .owned_transition("extend_lease", job_id, worker_id, |job| {
                Ok(job.extend_lease(worker_id, lease, now)?)
            })
            .await?;
        Ok(expires_at)
    }

    #[instrument(skip(self, result, metrics), err)]
    async fn complete(
        &self,
        job_id: JobId,
        worker_id: &str,
        result: JsonValue,
        metrics: JsonValue,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError> {
        let (job, ()) = self
            .owned_transition("complete", job_id, worker_id, |job| {
                Ok(job.mark_completed(worker_id, result, metrics, now)?)
            })
            .await?;
        Ok(job)
    }

    #[instrument(skip(self, failure), fields(error = %failure.error), err)]
    async fn fail(
        &self,
        job_id: JobId,
        worker_id: &str,
        failure: &Failure,
        now: DateTime<Utc>,
    ) -> Result<FailOutcome, JobStoreError> {
        let (job, decision) = self
            .owned_transition("fail", job_id, worker_id, |job| {
                Ok(job.mark_failed(worker_id, failure, now)?)
            })
            .await?;
        Ok(FailOutcome { job, decision })
    }

    #[instrument(skip(self), err)]
    async fn cancel(&self, job_id: JobId, now: DateTime<Utc>) -> Result<Job, JobStoreError> {
        let (job, ()) = self
            .transition("cancel", job_id, |job| Ok(job.mark_cancelled(now)?))
            .await?;
        Ok(job)
    }

    #[instrument(skip(self), err)]
    async fn reinstate(&self, job_id: JobId, now: DateTime<Utc>) -> Result<Job, JobStoreError> {
        // A taken dedupe key surfaces as a unique violation from the partial index.
        let (job, ()) = self
            .transition("reinstate", job_id, |job| Ok(job.mark_reinstated(now)?))
            .await?;
        Ok(job)
    }

    #[instrument(skip(self), err)]
    async fn reap_expired(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<ReapReport, JobStoreError> {
        let mut tx = self.begin().await?;
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE status IN ('claimed', 'running')
              AND claim_expires_at < $1
            ORDER BY claim_expires_at ASC
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            "#
        ))
        .bind(now)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("select_expired", e))?;

        let mut report = ReapReport::default();
        for row in &rows {
            let mut job = Job::try_from(JobRow::from_pg(row)?)?;
            match job.mark_reclaimed(now)? {
                ReclaimAction::Requeued => report.requeued.push(job.id),
                ReclaimAction::DeadLettered => report.dead_lettered.push(job.id),
            }
            write_back(&mut tx, "reap_expired", &job).await?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(report)
    }

    #[instrument(skip(self, artifact), fields(job_id = %artifact.job_id, locator = %artifact.locator), err)]
    async fn attach_artifact(&self, artifact: ArtifactRef) -> Result<(), JobStoreError> {
        let size = i64::try_from(artifact.size_bytes)
            .map_err(|_| JobStoreError::Validation("artifact too large".to_string()))?;
        let result = sqlx::query(
            r#"
            INSERT INTO job_artifacts (job_id, locator, content_type, size_bytes, checksum, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(artifact.job_id.as_uuid())
        .bind(&artifact.locator)
        .bind(&artifact.content_type)
        .bind(size)
        .bind(&artifact.checksum)
        .bind(artifact.created_at)
        .execute(&*self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_foreign_key_violation(&e) => Err(JobStoreError::NotFound(artifact.job_id)),
            Err(e) => Err(map_sqlx_error("insert_artifact", e)),
        }
    }

    async fn queue_depth(&self) -> Result<Vec<QueueDepth>, JobStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT job_type, status, COUNT(*) AS count
            FROM jobs
            GROUP BY job_type, status
            ORDER BY job_type, status
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("queue_depth", e))?;

        rows.iter()
            .map(|row| -> Result<QueueDepth, JobStoreError> {
                let status: String = row.try_get("status").map_err(|e| map_sqlx_error("queue_depth", e))?;
                let count: i64 = row.try_get("count").map_err(|e| map_sqlx_error("queue_depth", e))?;
                Ok(QueueDepth {
                    job_type: row
                        .try_get("job_type")
                        .map_err(|e| map_sqlx_error("queue_depth", e))?,
                    status: status.parse()?,
                    count: u64::try_from(count).unwrap_or(0),
                })
            })
            .collect()
    }

    async fn ready_jobs(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE status = 'pending'
              AND scheduled_at <= $1
              AND attempt < max_attempts
            ORDER BY priority DESC, scheduled_at ASC, created_at ASC, id ASC
            LIMIT $2
            "#
        ))
        .bind(now)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("ready_jobs", e))?;

        self.hydrate(rows).await
    }

    async fn active_leases(&self, now: DateTime<Utc>) -> Result<Vec<WorkerLeases>, JobStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT
                claimed_by,
                COUNT(*) FILTER (WHERE status = 'claimed') AS claimed,
                COUNT(*) FILTER (WHERE status = 'running') AS running,
                MIN(claim_expires_at) AS next_expiry,
                COUNT(*) FILTER (WHERE claim_expires_at < $1) AS expired
            FROM jobs
            WHERE status IN ('claimed', 'running')
            GROUP BY claimed_by
            ORDER BY claimed_by
            "#,
        )
        .bind(now)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("active_leases", e))?;

        rows.iter()
            .map(|row| -> Result<WorkerLeases, JobStoreError> {
                let get_count = |col: &str| -> Result<u64, JobStoreError> {
                    let n: i64 = row.try_get(col).map_err(|e| map_sqlx_error("active_leases", e))?;
                    Ok(u64::try_from(n).unwrap_or(0))
                };
                Ok(WorkerLeases {
                    worker_id: row
                        .try_get("claimed_by")
                        .map_err(|e| map_sqlx_error("active_leases", e))?,
                    claimed: get_count("claimed")?,
                    running: get_count("running")?,
                    next_expiry: row
                        .try_get("next_expiry")
                        .map_err(|e| map_sqlx_error("active_leases", e))?,
                    expired: get_count("expired")?,
                })
            })
            .collect()
    }

    async fn recent_failures(&self, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE status IN ('dead_letter', 'failed')
            ORDER BY updated_at DESC, id DESC
            LIMIT $1
            "#
        ))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("recent_failures", e))?;

        self.hydrate(rows).await
    }

    #[instrument(skip(self), err)]
    async fn purge_terminal(&self, before: DateTime<Utc>) -> Result<u64, JobStoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE status IN ('completed', 'failed', 'cancelled', 'dead_letter')
              AND updated_at < $1
            "#,
        )
        .bind(before)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("purge_terminal", e))?;
        Ok(result.rows_affected())
    }
}

async fn lock_job(
    tx: &mut Transaction<'static, Postgres>,
    operation: &str,
    job_id: JobId,
) -> Result<Job, JobStoreError> {
    let row = sqlx::query(&format!(
        "SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1 FOR UPDATE"
    ))
    .bind(job_id.as_uuid())
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error(operation, e))?
    .ok_or(JobStoreError::NotFound(job_id))?;

    Job::try_from(JobRow::from_pg(&row)?)
}

/// Persist every column a transition may touch.
async fn write_back(
    tx: &mut Transaction<'static, Postgres>,
    operation: &str,
    job: &Job,
) -> Result<(), JobStoreError> {
    let row = JobRow::from(job);
    sqlx::query(
        r#"
        UPDATE jobs
        SET status = $2,
            scheduled_at = $3,
            claimed_by = $4,
            claim_expires_at = $5,
            attempt = $6,
            next_retry_at = $7,
            result = $8,
            metrics = $9,
            error_message = $10,
            error_detail = $11,
            execution_id = $12,
            updated_at = $13,
            started_at = $14,
            completed_at = $15
        WHERE id = $1
        "#,
    )
    .bind(row.id)
    .bind(&row.status)
    .bind(row.scheduled_at)
    .bind(&row.claimed_by)
    .bind(row.claim_expires_at)
    .bind(row.attempt)
    .bind(row.next_retry_at)
    .bind(&row.result)
    .bind(&row.metrics)
    .bind(&row.error_message)
    .bind(&row.error_detail)
    .bind(row.execution_id)
    .bind(row.updated_at)
    .bind(row.started_at)
    .bind(row.completed_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error(operation, e))?;
    Ok(())
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                // Unique violation
                Some("23505") => JobStoreError::Conflict(msg),
                // Check constraint violation
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

fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23503"))
}

/// Column-for-column image of a `jobs` row.
#[derive(Debug)]
struct JobRow {
    id: Uuid,
    job_type: String,
    name: Option<String>,
    dedupe_key: Option<String>,
    payload: JsonValue,
    priority: i32,
    status: String,
    scheduled_at: DateTime<Utc>,
    claimed_by: Option<String>,
    claim_expires_at: Option<DateTime<Utc>>,
    attempt: i32,
    max_attempts: i32,
    retry_backoff_seconds: i32,
    next_retry_at: Option<DateTime<Utc>>,
    result: Option<JsonValue>,
    metrics: Option<JsonValue>,
    error_message: Option<String>,
    error_detail: Option<JsonValue>,
    execution_id: Option<Uuid>,
    tags: Vec<String>,
    metadata: JsonValue,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl JobRow {
    fn from_pg(row: &PgRow) -> Result<Self, JobStoreError> {
        sqlx::FromRow::from_row(row)
            .map_err(|e| JobStoreError::Storage(format!("failed to decode job row: {}", e)))
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            job_type: row.try_get("job_type")?,
            name: row.try_get("name")?,
            dedupe_key: row.try_get("dedupe_key")?,
            payload: row.try_get("payload")?,
            priority: row.try_get("priority")?,
            status: row.try_get("status")?,
            scheduled_at: row.try_get("scheduled_at")?,
            claimed_by: row.try_get("claimed_by")?,
            claim_expires_at: row.try_get("claim_expires_at")?,
            attempt: row.try_get("attempt")?,
            max_attempts: row.try_get("max_attempts")?,
            retry_backoff_seconds: row.try_get("retry_backoff_seconds")?,
            next_retry_at: row.try_get("next_retry_at")?,
            result: row.try_get("result")?,
            metrics: row.try_get("metrics")?,
            error_message: row.try_get("error_message")?,
            error_detail: row.try_get("error_detail")?,
            execution_id: row.try_get("execution_id")?,
            tags: row.try_get("tags")?,
            metadata: row.try_get("metadata")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }
}

fn to_db_int(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn from_db_int(column: &str, value: i32) -> Result<u32, JobStoreError> {
    u32::try_from(value)
        .map_err(|_| JobStoreError::Storage(format!("negative {column} in jobs row: {value}")))
}

impl From<&Job> for JobRow {
    fn from(job: &Job) -> Self {
        JobRow {
            id: *job.id.as_uuid(),
            job_type: job.job_type.clone(),
            name: job.name.clone(),
            dedupe_key: job.dedupe_key.clone(),
            payload: job.payload.clone(),
            priority: job.priority,
            status: job.status.as_str().to_string(),
            scheduled_at: job.scheduled_at,
            claimed_by: job.claimed_by.clone(),
            claim_expires_at: job.claim_expires_at,
            attempt: to_db_int(job.attempt),
            max_attempts: to_db_int(job.max_attempts),
            retry_backoff_seconds: to_db_int(job.retry_backoff_seconds),
            next_retry_at: job.next_retry_at,
            result: job.result.clone(),
            metrics: job.metrics.clone(),
            error_message: job.error_message.clone(),
            error_detail: job.error_detail.clone(),
            execution_id: job.execution_id.map(Uuid::from),
            tags: job.tags.clone(),
            metadata: job.metadata.clone(),
            created_at: job.created_at,
            updated_at: job.updated_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
        }
    }
}

impl TryFrom<JobRow> for Job {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status: JobStatus = row.status.parse()?;
        Ok(Job {
            id: JobId::from_uuid(row.id),
            job_type: row.job_type,
            name: row.name,
            dedupe_key: row.dedupe_key,
            payload: row.payload,
            priority: row.priority,
            status,
            scheduled_at: row.scheduled_at,
            claimed_by: row.claimed_by,
            claim_expires_at: row.claim_expires_at,
            attempt: from_db_int("attempt", row.attempt)?,
            max_attempts: from_db_int("max_attempts", row.max_attempts)?,
            retry_backoff_seconds: from_db_int("retry_backoff_seconds", row.retry_backoff_seconds)?,
            next_retry_at: row.next_retry_at,
            result: row.result,
            metrics: row.metrics,
            error_message: row.error_message,
            error_detail: row.error_detail,
            execution_id: row.execution_id.map(RunId::from_uuid),
            artifacts: Vec::new(),
            tags: row.tags,
            metadata: row.metadata,
            created_at: row.created_at,
            updated_at: row.updated_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}

#[derive(Debug)]
struct ArtifactRow {
    job_id: Uuid,
    locator: String,
    content_type: String,
    size_bytes: i64,
    checksum: String,
    created_at: DateTime<Utc>,
}

impl ArtifactRow {
    fn from_pg(row: &PgRow) -> Result<Self, JobStoreError> {
        sqlx::FromRow::from_row(row)
            .map_err(|e| JobStoreError::Storage(format!("failed to decode artifact row: {}", e)))
    }

    fn into_ref(self) -> Result<ArtifactRef, JobStoreError> {
        Ok(ArtifactRef {
            job_id: JobId::from_uuid(self.job_id),
            locator: self.locator,
            content_type: self.content_type,
            size_bytes: u64::try_from(self.size_bytes).map_err(|_| {
                JobStoreError::Storage(format!("negative artifact size: {}", self.size_bytes))
            })?,
            checksum: self.checksum,
            created_at: self.created_at,
        })
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for ArtifactRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(ArtifactRow {
            job_id: row.try_get("job_id")?,
            locator: row.try_get("locator")?,
            content_type: row.try_get("content_type")?,
            size_bytes: row.try_get("size_bytes")?,
            checksum: row.try_get("checksum")?,
            created_at: row.try_get("created_at")?,
        })
    }
}
