//! Postgres-backed job store.
//!
//! Every mutation locks the job row (`FOR UPDATE`), decodes it, applies the
//! shared lifecycle rules and writes the row back in the same transaction.
//! Claims use `FOR UPDATE SKIP LOCKED` so concurrent workers never block on,
//! or double-claim, the same row.
//!
//! ## Error Mapping
//!
//! | SQLx Error | JobStoreError |
//! |------------|---------------|
//! | Database (any code) | `Storage` |
//! | PoolClosed / Io / Tls | `Storage` |
//! | Row decode failure | `Storage` |
//!
//! Lifecycle violations surface as `InvalidTransition`/`InvalidState` after
//! the transaction has been rolled back.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::{debug, instrument};

use caseflow_core::{OrgId, UserId};

use super::lifecycle::{ControlAction, StatusUpdate};
use super::payload::JobData;
use super::query::{JobFilter, JobPage, Pagination, SortField, SortOrder};
use super::store::{ClaimRequest, JobStats, JobStore, JobStoreError, Lease, UpdateOutcome};
use super::types::{Job, JobId, JobPriority, JobProgress, JobStatus, NewJob};

/// Migration creating the `jobs` table and its indexes.
pub const MIGRATION: &str = include_str!("../../migrations/0001_jobs.sql");

const JOB_COLUMNS: &str = r#"
    id, org_id, user_id, job_type, data, status, priority, timeout_ms,
    max_retries, retry_count, scheduled_for, created_at, updated_at,
    started_at, completed_at, failed_at, last_error, lock_owner, lock_token,
    progress, metadata, case_id, history
"#;

/// Org-scoped filter predicate shared by the count and page queries.
/// `$1` is the org; `$2..$9` are the optional filters.
const FILTER_PREDICATE: &str = r#"
    org_id = $1
        AND ($2::text[] IS NULL OR status = ANY($2))
        AND ($3::text[] IS NULL OR job_type = ANY($3))
        AND ($4::smallint[] IS NULL OR priority = ANY($4))
        AND ($5::uuid IS NULL OR user_id = $5)
        AND ($6::text IS NULL OR case_id = $6)
        AND ($7::timestamptz IS NULL OR created_at >= $7)
        AND ($8::timestamptz IS NULL OR created_at <= $8)
        AND ($9::text IS NULL
             OR id::text ILIKE '%' || $9 || '%' ESCAPE '\'
             OR metadata::text ILIKE '%' || $9 || '%' ESCAPE '\')
"#;

/// Postgres-backed job store.
///
/// `PostgresJobStore` is `Send + Sync`; the SQLx pool handles connection
/// sharing. Tenant isolation is enforced by an `org_id` predicate on every
/// caller-facing query.
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

    /// Connect and apply the schema.
    pub async fn connect(database_url: &str) -> Result<Self, JobStoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        let store = Self::new(pool);
        store.migrate().await?;
        Ok(store)
    }

    /// Apply [`MIGRATION`]. Idempotent.
    pub async fn migrate(&self) -> Result<(), JobStoreError> {
        sqlx::raw_sql(MIGRATION)
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
}

async fn lock_job(
    tx: &mut Transaction<'static, Postgres>,
    id: JobId,
    org_id: Option<OrgId>,
) -> Result<Option<Job>, JobStoreError> {
    let sql = format!(
        r#"
        SELECT {JOB_COLUMNS} FROM jobs
        WHERE id = $1 AND ($2::uuid IS NULL OR org_id = $2)
        FOR UPDATE
        "#
    );
    let row = sqlx::query(&sql)
        .bind(id.as_uuid())
        .bind(org_id.map(|o| *o.as_uuid()))
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("lock_job", e))?;
    row.map(|r| decode_job(&r)).transpose()
}

/// Write back every mutable column of a locked row.
async fn write_job(
    tx: &mut Transaction<'static, Postgres>,
    job: &Job,
) -> Result<(), JobStoreError> {
    sqlx::query(
        r#"
        UPDATE jobs SET
            status = $2,
            retry_count = $3,
            scheduled_for = $4,
            updated_at = $5,
            started_at = $6,
            completed_at = $7,
            failed_at = $8,
            last_error = $9,
            lock_owner = $10,
            lock_token = $11,
            progress = $12,
            history = $13
        WHERE id = $1
        "#,
    )
    .bind(job.id.as_uuid())
    .bind(job.status.as_str())
    .bind(job.retry_count as i32)
    .bind(job.scheduled_for)
    .bind(job.updated_at)
    .bind(job.started_at)
    .bind(job.completed_at)
    .bind(job.failed_at)
    .bind(job.last_error.as_deref())
    .bind(job.lock_owner.as_deref())
    .bind(job.lock_token as i64)
    .bind(job.progress.as_ref().map(encode_json).transpose()?)
    .bind(encode_json(&job.history)?)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("write_job", e))?;
    Ok(())
}

async fn commit(tx: Transaction<'static, Postgres>) -> Result<(), JobStoreError> {
    tx.commit()
        .await
        .map_err(|e| map_sqlx_error("commit_transaction", e))
}

async fn rollback(tx: Transaction<'static, Postgres>) -> Result<(), JobStoreError> {
    tx.rollback()
        .await
        .map_err(|e| map_sqlx_error("rollback", e))
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(
        skip(self, new_job),
        fields(org_id = %new_job.org_id, job_type = %new_job.data.job_type()),
        err
    )]
    async fn create(&self, new_job: NewJob) -> Result<Job, JobStoreError> {
        new_job.validate()?;
        let job = new_job.into_job(Utc::now());

        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, org_id, user_id, job_type, data, status, priority, timeout_ms,
                max_retries, retry_count, scheduled_for, created_at, updated_at,
                lock_token, metadata, case_id, history
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.org_id.as_uuid())
        .bind(job.user_id.as_uuid())
        .bind(job.job_type().as_str())
        .bind(job.data.to_json())
        .bind(job.status.as_str())
        .bind(job.priority.rank())
        .bind(job.timeout_ms as i64)
        .bind(job.max_retries as i32)
        .bind(job.retry_count as i32)
        .bind(job.scheduled_for)
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.lock_token as i64)
        .bind(encode_json(&job.metadata)?)
        .bind(job.case_id.as_deref())
        .bind(encode_json(&job.history)?)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_job", e))?;

        Ok(job)
    }

    #[instrument(skip(self, request), fields(owner = %request.owner), err)]
    async fn try_claim(&self, request: &ClaimRequest) -> Result<Option<Job>, JobStoreError> {
        let statuses: Vec<String> = request
            .statuses
            .iter()
            .filter(|s| s.is_claimable())
            .map(|s| s.as_str().to_string())
            .collect();
        if statuses.is_empty() {
            return Ok(None);
        }

        let mut tx = self.begin().await?;
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE status = ANY($1)
                AND scheduled_for <= $2
                AND ($3::uuid IS NULL OR org_id = $3)
            ORDER BY priority DESC, scheduled_for ASC, created_at ASC, id ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#
        );
        let row = sqlx::query(&sql)
            .bind(statuses)
            .bind(request.now)
            .bind(request.org_id.map(|o| *o.as_uuid()))
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("claim_job", e))?;

        let Some(row) = row else {
            rollback(tx).await?;
            return Ok(None);
        };
        let mut job = decode_job(&row)?;
        job.claim(&request.owner, request.now)?;
        write_job(&mut tx, &job).await?;
        commit(tx).await?;

        debug!(job_id = %job.id, lock_token = job.lock_token, "claimed job");
        Ok(Some(job))
    }

    #[instrument(skip(self, update), fields(job_id = %id, status = %update.status), err)]
    async fn update_status(
        &self,
        id: JobId,
        expected_token: u64,
        update: StatusUpdate,
    ) -> Result<UpdateOutcome, JobStoreError> {
        let mut tx = self.begin().await?;
        let job = match lock_job(&mut tx, id, None).await? {
            Some(job) if job.lock_token == expected_token => job,
            _ => {
                rollback(tx).await?;
                return Ok(UpdateOutcome::Stale);
            }
        };

        let mut job = job;
        if let Err(e) = job.apply_update(&update) {
            rollback(tx).await?;
            return Err(e);
        }
        write_job(&mut tx, &job).await?;
        commit(tx).await?;
        Ok(UpdateOutcome::Applied(job))
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn report_progress(
        &self,
        id: JobId,
        expected_token: u64,
        progress: JobProgress,
    ) -> Result<UpdateOutcome, JobStoreError> {
        let mut tx = self.begin().await?;
        let mut job = match lock_job(&mut tx, id, None).await? {
            Some(job) if job.lock_token == expected_token => job,
            _ => {
                rollback(tx).await?;
                return Ok(UpdateOutcome::Stale);
            }
        };

        if !job.set_progress(progress, Utc::now()) {
            rollback(tx).await?;
            return Ok(UpdateOutcome::Stale);
        }
        write_job(&mut tx, &job).await?;
        commit(tx).await?;
        Ok(UpdateOutcome::Applied(job))
    }

    async fn lease(&self, id: JobId) -> Result<Option<Lease>, JobStoreError> {
        let row = sqlx::query("SELECT status, lock_token, lock_owner FROM jobs WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("load_lease", e))?;

        row.map(|r| -> Result<Lease, JobStoreError> {
            let status: String = r.try_get("status").map_err(decode_error)?;
            let lock_token: i64 = r.try_get("lock_token").map_err(decode_error)?;
            Ok(Lease {
                status: parse_status(&status)?,
                lock_token: lock_token as u64,
                lock_owner: r.try_get("lock_owner").map_err(decode_error)?,
            })
        })
        .transpose()
    }

    #[instrument(skip(self), fields(org_id = %org_id, job_id = %id), err)]
    async fn get(&self, org_id: OrgId, id: JobId) -> Result<Option<Job>, JobStoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1 AND org_id = $2");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .bind(org_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?;
        row.map(|r| decode_job(&r)).transpose()
    }

    #[instrument(skip(self, filter), fields(org_id = %org_id, page = pagination.page), err)]
    async fn query(
        &self,
        org_id: OrgId,
        filter: &JobFilter,
        pagination: &Pagination,
    ) -> Result<JobPage, JobStoreError> {
        pagination.validate()?;
        let params = FilterParams::from(filter);

        let count_sql = format!("SELECT COUNT(*) AS total FROM jobs WHERE {FILTER_PREDICATE}");
        let count_row = params
            .bind(sqlx::query(&count_sql), org_id)
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("count_jobs", e))?;
        let total: i64 = count_row.try_get("total").map_err(decode_error)?;

        let page_sql = format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE {FILTER_PREDICATE}
            ORDER BY {}
            LIMIT $10 OFFSET $11
            "#,
            order_clause(pagination)
        );
        let rows = params
            .bind(sqlx::query(&page_sql), org_id)
            .bind(pagination.limit as i64)
            .bind(pagination.offset() as i64)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("query_jobs", e))?;

        let jobs = rows.iter().map(decode_job).collect::<Result<Vec<_>, _>>()?;
        let total = total as u64;
        let has_more = pagination.offset() + (jobs.len() as u64) < total;

        Ok(JobPage {
            jobs,
            total,
            pagination: *pagination,
            has_more,
        })
    }

    #[instrument(skip(self), fields(org_id = %org_id, job_id = %id), err)]
    async fn delete(&self, org_id: OrgId, id: JobId) -> Result<Job, JobStoreError> {
        let mut tx = self.begin().await?;
        let Some(job) = lock_job(&mut tx, id, Some(org_id)).await? else {
            rollback(tx).await?;
            return Err(JobStoreError::NotFound(id));
        };
        if job.status == JobStatus::Running {
            rollback(tx).await?;
            return Err(JobStoreError::InvalidState {
                id,
                status: job.status,
                operation: "delete",
            });
        }

        sqlx::query("DELETE FROM jobs WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("delete_job", e))?;
        commit(tx).await?;
        Ok(job)
    }

    #[instrument(
        skip(self, now),
        fields(org_id = %org_id, job_id = %id, action = action.as_str()),
        err
    )]
    async fn control(
        &self,
        org_id: OrgId,
        id: JobId,
        action: ControlAction,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError> {
        let mut tx = self.begin().await?;
        let Some(mut job) = lock_job(&mut tx, id, Some(org_id)).await? else {
            rollback(tx).await?;
            return Err(JobStoreError::NotFound(id));
        };
        if let Err(e) = job.apply_control(action, now) {
            rollback(tx).await?;
            return Err(e);
        }
        write_job(&mut tx, &job).await?;
        commit(tx).await?;
        Ok(job)
    }

    async fn promote_due(&self, now: DateTime<Utc>) -> Result<usize, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET status = 'queued', updated_at = $1
            WHERE status IN ('pending', 'retry') AND scheduled_for <= $1
            "#,
        )
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("promote_due", e))?;
        Ok(result.rows_affected() as usize)
    }

    #[instrument(skip(self), err)]
    async fn find_overdue(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE status = 'stalled'
                OR (status = 'running'
                    AND started_at + timeout_ms * INTERVAL '1 millisecond' < $1)
            ORDER BY started_at ASC NULLS FIRST
            LIMIT $2
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(now)
            .bind(limit as i64)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_overdue", e))?;
        rows.iter().map(decode_job).collect()
    }

    #[instrument(skip(self), fields(org_id = %org_id), err)]
    async fn purge_finished(
        &self,
        org_id: OrgId,
        before: DateTime<Utc>,
    ) -> Result<usize, JobStoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE org_id = $1
                AND status IN ('completed', 'failed', 'cancelled')
                AND updated_at < $2
            "#,
        )
        .bind(org_id.as_uuid())
        .bind(before)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("purge_finished", e))?;
        Ok(result.rows_affected() as usize)
    }

    async fn stats(&self, org_id: OrgId) -> Result<JobStats, JobStoreError> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS count FROM jobs WHERE org_id = $1 GROUP BY status",
        )
        .bind(org_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("job_stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(decode_error)?;
            let count: i64 = row.try_get("count").map_err(decode_error)?;
            stats.add(parse_status(&status)?, count as usize);
        }
        Ok(stats)
    }
}

/// Owned bind values for [`FILTER_PREDICATE`].
struct FilterParams {
    statuses: Option<Vec<String>>,
    job_types: Option<Vec<String>>,
    priorities: Option<Vec<i16>>,
    user_id: Option<uuid::Uuid>,
    case_id: Option<String>,
    created_from: Option<DateTime<Utc>>,
    created_to: Option<DateTime<Utc>>,
    search: Option<String>,
}

impl From<&JobFilter> for FilterParams {
    fn from(filter: &JobFilter) -> Self {
        Self {
            statuses: filter
                .status
                .as_ref()
                .map(|s| s.as_slice().iter().map(|v| v.as_str().to_string()).collect()),
            job_types: filter
                .job_type
                .as_ref()
                .map(|t| t.as_slice().iter().map(|v| v.as_str().to_string()).collect()),
            priorities: filter
                .priority
                .as_ref()
                .map(|p| p.as_slice().iter().map(JobPriority::rank).collect()),
            user_id: filter.user_id.map(|u| *u.as_uuid()),
            case_id: filter.case_id.clone(),
            created_from: filter.created_from,
            created_to: filter.created_to,
            search: filter.search_term().map(|s| escape_like(&s)),
        }
    }
}

impl FilterParams {
    fn bind<'q>(
        &'q self,
        query: sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments>,
        org_id: OrgId,
    ) -> sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments> {
        query
            .bind(*org_id.as_uuid())
            .bind(&self.statuses)
            .bind(&self.job_types)
            .bind(&self.priorities)
            .bind(self.user_id)
            .bind(&self.case_id)
            .bind(self.created_from)
            .bind(self.created_to)
            .bind(&self.search)
    }
}

fn escape_like(term: &str) -> String {
    term.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

/// Mirrors [`Pagination::compare`]: nulls last, id as the tie-breaker.
fn order_clause(pagination: &Pagination) -> String {
    let column = match pagination.sort_by {
        SortField::Created => "created_at",
        SortField::Started => "started_at",
        SortField::Completed => "completed_at",
        SortField::Priority => "priority",
        SortField::Status => "status",
    };
    let direction = match pagination.sort_order {
        SortOrder::Asc => "ASC",
        SortOrder::Desc => "DESC",
    };
    format!("{column} {direction} NULLS LAST, id ASC")
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.to_string()).unwrap_or_default();
            JobStoreError::Storage(format!(
                "database error in {operation} ({code}): {}",
                db_err.message()
            ))
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed during {operation}"))
        }
        other => JobStoreError::Storage(format!("{operation}: {other}")),
    }
}

fn decode_error(err: sqlx::Error) -> JobStoreError {
    JobStoreError::Storage(format!("failed to decode job row: {err}"))
}

fn encode_json<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, JobStoreError> {
    serde_json::to_value(value)
        .map_err(|e| JobStoreError::Storage(format!("failed to encode column: {e}")))
}

fn parse_status(raw: &str) -> Result<JobStatus, JobStoreError> {
    raw.parse()
        .map_err(|_| JobStoreError::Storage(format!("unknown job status in row: {raw}")))
}

// SQLx row types

#[derive(Debug)]
struct JobRow {
    id: uuid::Uuid,
    org_id: uuid::Uuid,
    user_id: uuid::Uuid,
    job_type: String,
    data: serde_json::Value,
    status: String,
    priority: i16,
    timeout_ms: i64,
    max_retries: i32,
    retry_count: i32,
    scheduled_for: DateTime<Utc>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    failed_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    lock_owner: Option<String>,
    lock_token: i64,
    progress: Option<serde_json::Value>,
    metadata: serde_json::Value,
    case_id: Option<String>,
    history: serde_json::Value,
}

impl<'r> FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            org_id: row.try_get("org_id")?,
            user_id: row.try_get("user_id")?,
            job_type: row.try_get("job_type")?,
            data: row.try_get("data")?,
            status: row.try_get("status")?,
            priority: row.try_get("priority")?,
            timeout_ms: row.try_get("timeout_ms")?,
            max_retries: row.try_get("max_retries")?,
            retry_count: row.try_get("retry_count")?,
            scheduled_for: row.try_get("scheduled_for")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            failed_at: row.try_get("failed_at")?,
            last_error: row.try_get("last_error")?,
            lock_owner: row.try_get("lock_owner")?,
            lock_token: row.try_get("lock_token")?,
            progress: row.try_get("progress")?,
            metadata: row.try_get("metadata")?,
            case_id: row.try_get("case_id")?,
            history: row.try_get("history")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let corrupt = |column: &str, e: serde_json::Error| {
            JobStoreError::Storage(format!("corrupt {column} for job {}: {e}", row.id))
        };

        let data: JobData =
            serde_json::from_value(serde_json::json!({ "type": row.job_type, "data": row.data }))
                .map_err(|e| corrupt("data", e))?;
        let progress: Option<JobProgress> = row
            .progress
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| corrupt("progress", e))?;
        let metadata = serde_json::from_value(row.metadata).map_err(|e| corrupt("metadata", e))?;
        let history = serde_json::from_value(row.history).map_err(|e| corrupt("history", e))?;
        let priority = JobPriority::from_rank(row.priority).ok_or_else(|| {
            JobStoreError::Storage(format!(
                "unknown priority rank {} for job {}",
                row.priority, row.id
            ))
        })?;

        Ok(Job {
            id: JobId::from_uuid(row.id),
            org_id: OrgId::from_uuid(row.org_id),
            user_id: UserId::from_uuid(row.user_id),
            data,
            status: parse_status(&row.status)?,
            priority,
            timeout_ms: row.timeout_ms as u64,
            max_retries: row.max_retries as u32,
            retry_count: row.retry_count as u32,
            scheduled_for: row.scheduled_for,
            created_at: row.created_at,
            updated_at: row.updated_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            failed_at: row.failed_at,
            last_error: row.last_error,
            lock_owner: row.lock_owner,
            lock_token: row.lock_token as u64,
            progress,
            metadata,
            case_id: row.case_id,
            history,
        })
    }
}

fn decode_job(row: &PgRow) -> Result<Job, JobStoreError> {
    JobRow::from_row(row).map_err(decode_error)?.try_into()
}

#[cfg(test)]
mod tests {
    //! These run against a live database and are ignored by default:
    //! `DATABASE_URL=postgres://... cargo test -- --ignored`

    use super::*;
    use crate::jobs::query::OneOrMany;

    async fn store() -> PostgresJobStore {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        PostgresJobStore::connect(&url).await.unwrap()
    }

    fn new_job(org: OrgId, priority: JobPriority) -> NewJob {
        NewJob::new(org, UserId::new(), JobData::email_storage("e-1", "case-pg"))
            .with_priority(priority)
    }

    #[test]
    fn order_clause_matches_sort_options() {
        let p = Pagination::new(0, 10).sorted_by(SortField::Started, SortOrder::Asc);
        assert_eq!(order_clause(&p), "started_at ASC NULLS LAST, id ASC");
        assert_eq!(
            order_clause(&Pagination::default()),
            "created_at DESC NULLS LAST, id ASC"
        );
    }

    #[test]
    fn like_wildcards_are_escaped() {
        assert_eq!(escape_like("50%_off"), "50\\%\\_off");
    }

    #[test]
    fn filter_params_flatten_one_or_many() {
        let filter = JobFilter::default()
            .with_status(vec![JobStatus::Failed, JobStatus::Cancelled])
            .with_priority(JobPriority::Urgent)
            .with_search("  ABC ");
        let params = FilterParams::from(&filter);

        assert_eq!(
            params.statuses,
            Some(vec!["failed".to_string(), "cancelled".to_string()])
        );
        assert_eq!(params.priorities, Some(vec![4]));
        assert_eq!(params.search.as_deref(), Some("abc"));
        assert!(params.job_types.is_none());
        assert!(matches!(filter.priority, Some(OneOrMany::One(_))));
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn claim_follows_priority_and_fencing() {
        let store = store().await;
        let org = OrgId::new();
        let low = store.create(new_job(org, JobPriority::Low)).await.unwrap();
        let urgent = store.create(new_job(org, JobPriority::Urgent)).await.unwrap();

        let request = ClaimRequest::new("pg-worker", Utc::now()).for_org(org);
        let first = store.try_claim(&request).await.unwrap().unwrap();
        assert_eq!(first.id, urgent.id);
        assert_eq!(first.lock_token, 1);

        let stale = store
            .update_status(first.id, 0, StatusUpdate::completed(Utc::now()))
            .await
            .unwrap();
        assert_eq!(stale, UpdateOutcome::Stale);

        let applied = store
            .update_status(first.id, first.lock_token, StatusUpdate::completed(Utc::now()))
            .await
            .unwrap();
        assert!(applied.is_applied());

        let second = store.try_claim(&request).await.unwrap().unwrap();
        assert_eq!(second.id, low.id);
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn query_is_org_scoped_and_paginated() {
        let store = store().await;
        let org = OrgId::new();
        for _ in 0..5 {
            store.create(new_job(org, JobPriority::Normal)).await.unwrap();
        }
        store.create(new_job(OrgId::new(), JobPriority::Normal)).await.unwrap();

        let page = store
            .query(org, &JobFilter::default(), &Pagination::new(2, 2))
            .await
            .unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.jobs.len(), 1);
        assert!(!page.has_more);
    }
}
