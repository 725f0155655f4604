//! Postgres job store.
//!
//! The enqueue guard is the partial unique index `jobs_active_guard`, so two
//! processes racing to enqueue the same non-retryable job cannot both insert.
//! Claims use `FOR UPDATE SKIP LOCKED` so concurrent workers never claim the
//! same row. Updates to a running job match on `locked_by` as well as status.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::job::{Job, JobId, JobStatus};
use crate::queue::{InsertOutcome, JobFilter, JobStore, transition_rejected};

const COLUMNS: &str = "id, job_type_key, payload_json, status, entity_type_key, entity_key, \
     attempt_count, max_attempts, run_after, locked_until, locked_by, last_error, result_json, \
     created_at, updated_at, completed_at";

/// Same predicate as `Job::is_stale`. Shared by the count and the requeue.
const STALE_PREDICATE: &str =
    "status = 'running' AND locked_until IS NOT NULL AND locked_until < $1";

#[async_trait]
impl JobStore for super::Db {
    async fn insert(&self, job: Job, guarded: bool) -> Result<InsertOutcome> {
        let conflict = if guarded {
            "ON CONFLICT (job_type_key, entity_type_key, entity_key) \
             WHERE guarded AND status IN ('queued', 'running') DO NOTHING"
        } else {
            ""
        };
        let sql = format!(
            "INSERT INTO jobs (id, job_type_key, payload_json, status, entity_type_key, entity_key, \
                 guarded, attempt_count, max_attempts, run_after, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $11)
             {conflict}
             RETURNING {COLUMNS}"
        );
        let row: Option<JobRow> = sqlx::query_as(&sql)
            .bind(job.id.0)
            .bind(&job.job_type_key)
            .bind(&job.payload_json)
            .bind(job.status.as_str())
            .bind(&job.entity_type_key)
            .bind(&job.entity_key)
            .bind(guarded)
            .bind(job.attempt_count as i32)
            .bind(job.max_attempts as i32)
            .bind(job.run_after)
            .bind(job.created_at)
            .fetch_optional(self.pool())
            .await?;

        if let Some(row) = row {
            return Ok(InsertOutcome::Inserted(row.try_into_job()?));
        }

        // Conflict: report the job holding the guard.
        self.find_active(&job.job_type_key, &job.entity_type_key, &job.entity_key)
            .await?
            .map(InsertOutcome::Existing)
            .ok_or_else(|| {
                Error::Other(format!(
                    "enqueue of {} for {}:{} conflicted but no active job was found",
                    job.job_type_key, job.entity_type_key, job.entity_key
                ))
            })
    }

    async fn find_active(
        &self,
        job_type_key: &str,
        entity_type_key: &str,
        entity_key: &str,
    ) -> Result<Option<Job>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM jobs
             WHERE job_type_key = $1 AND entity_type_key = $2 AND entity_key = $3
               AND status IN ('queued', 'running')
             ORDER BY created_at
             LIMIT 1"
        );
        let row: Option<JobRow> = sqlx::query_as(&sql)
            .bind(job_type_key)
            .bind(entity_type_key)
            .bind(entity_key)
            .fetch_optional(self.pool())
            .await?;
        row.map(JobRow::try_into_job).transpose()
    }

    async fn get(&self, id: JobId) -> Result<Job> {
        let sql = format!("SELECT {COLUMNS} FROM jobs WHERE id = $1");
        let row: Option<JobRow> = sqlx::query_as(&sql)
            .bind(id.0)
            .fetch_optional(self.pool())
            .await?;
        row.ok_or_else(|| Error::NotFound(format!("job {id}")))?
            .try_into_job()
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        // LIMIT NULL is LIMIT ALL.
        let sql = format!(
            "SELECT {COLUMNS} FROM jobs
             WHERE ($1::text IS NULL OR status = $1)
               AND ($2::text IS NULL OR job_type_key = $2)
               AND ($3::text IS NULL OR entity_type_key = $3)
               AND ($4::text IS NULL OR entity_key = $4)
             ORDER BY created_at DESC
             LIMIT $5"
        );
        let rows: Vec<JobRow> = sqlx::query_as(&sql)
            .bind(filter.status.map(JobStatus::as_str))
            .bind(filter.job_type_key.as_deref())
            .bind(filter.entity_type_key.as_deref())
            .bind(filter.entity_key.as_deref())
            .bind(filter.limit.map(|n| n as i64))
            .fetch_all(self.pool())
            .await?;
        rows.into_iter().map(JobRow::try_into_job).collect()
    }

    async fn claim_next(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        locked_until: DateTime<Utc>,
    ) -> Result<Option<Job>> {
        let sql = format!(
            "WITH next AS (
                 SELECT id AS next_id FROM jobs
                 WHERE status = 'queued' AND run_after <= $1
                 ORDER BY run_after, created_at
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             UPDATE jobs
             SET status = 'running', locked_by = $2, locked_until = $3, updated_at = $1
             FROM next
             WHERE jobs.id = next.next_id
             RETURNING {COLUMNS}"
        );
        let row: Option<JobRow> = sqlx::query_as(&sql)
            .bind(now)
            .bind(worker_id)
            .bind(locked_until)
            .fetch_optional(self.pool())
            .await?;
        row.map(JobRow::try_into_job).transpose()
    }

    async fn extend_claim(
        &self,
        id: JobId,
        worker_id: &str,
        locked_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Job> {
        let sql = format!(
            "UPDATE jobs
             SET locked_until = $3, updated_at = $4
             WHERE id = $1 AND status = 'running' AND locked_by = $2
             RETURNING {COLUMNS}"
        );
        let row: Option<JobRow> = sqlx::query_as(&sql)
            .bind(id.0)
            .bind(worker_id)
            .bind(locked_until)
            .bind(now)
            .fetch_optional(self.pool())
            .await?;
        self.updated_or_rejected(id, row, JobStatus::Running).await
    }

    async fn mark_succeeded(
        &self,
        id: JobId,
        worker_id: &str,
        result: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Result<Job> {
        let sql = format!(
            "UPDATE jobs
             SET status = 'succeeded', result_json = $3, locked_by = NULL, locked_until = NULL,
                 completed_at = $4, updated_at = $4
             WHERE id = $1 AND status = 'running' AND locked_by = $2
             RETURNING {COLUMNS}"
        );
        let row: Option<JobRow> = sqlx::query_as(&sql)
            .bind(id.0)
            .bind(worker_id)
            .bind(result)
            .bind(now)
            .fetch_optional(self.pool())
            .await?;
        self.updated_or_rejected(id, row, JobStatus::Succeeded).await
    }

    async fn reschedule(
        &self,
        id: JobId,
        worker_id: &str,
        attempt_count: u32,
        run_after: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<Job> {
        let sql = format!(
            "UPDATE jobs
             SET status = 'queued', attempt_count = $3, run_after = $4, last_error = $5,
                 locked_by = NULL, locked_until = NULL, updated_at = $6
             WHERE id = $1 AND status = 'running' AND locked_by = $2
             RETURNING {COLUMNS}"
        );
        let row: Option<JobRow> = sqlx::query_as(&sql)
            .bind(id.0)
            .bind(worker_id)
            .bind(attempt_count as i32)
            .bind(run_after)
            .bind(error)
            .bind(now)
            .fetch_optional(self.pool())
            .await?;
        self.updated_or_rejected(id, row, JobStatus::Queued).await
    }

    async fn mark_failed(
        &self,
        id: JobId,
        worker_id: &str,
        attempt_count: u32,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<Job> {
        let sql = format!(
            "UPDATE jobs
             SET status = 'failed', attempt_count = $3, last_error = $4,
                 locked_by = NULL, locked_until = NULL, completed_at = $5, updated_at = $5
             WHERE id = $1 AND status = 'running' AND locked_by = $2
             RETURNING {COLUMNS}"
        );
        let row: Option<JobRow> = sqlx::query_as(&sql)
            .bind(id.0)
            .bind(worker_id)
            .bind(attempt_count as i32)
            .bind(error)
            .bind(now)
            .fetch_optional(self.pool())
            .await?;
        self.updated_or_rejected(id, row, JobStatus::Failed).await
    }

    async fn reset(&self, id: JobId, now: DateTime<Utc>) -> Result<Job> {
        let sql = format!(
            "UPDATE jobs
             SET status = 'queued', attempt_count = 0, run_after = $2, completed_at = NULL,
                 updated_at = $2
             WHERE id = $1 AND status = 'failed'
             RETURNING {COLUMNS}"
        );
        let row: Option<JobRow> = sqlx::query_as(&sql)
            .bind(id.0)
            .bind(now)
            .fetch_optional(self.pool())
            .await?;
        self.updated_or_rejected(id, row, JobStatus::Queued).await
    }

    async fn count_stale(&self, now: DateTime<Utc>) -> Result<u64> {
        let sql = format!("SELECT count(*) FROM jobs WHERE {STALE_PREDICATE}");
        let (count,): (i64,) = sqlx::query_as(&sql)
            .bind(now)
            .fetch_one(self.pool())
            .await?;
        Ok(count as u64)
    }

    async fn requeue_stale(&self, now: DateTime<Utc>) -> Result<Vec<JobId>> {
        let sql = format!(
            "UPDATE jobs
             SET status = 'queued', locked_by = NULL, locked_until = NULL,
                 run_after = $1, updated_at = $1
             WHERE {STALE_PREDICATE}
             RETURNING id"
        );
        let ids: Vec<(Uuid,)> = sqlx::query_as(&sql)
            .bind(now)
            .fetch_all(self.pool())
            .await?;
        Ok(ids.into_iter().map(|(id,)| JobId(id)).collect())
    }
}

impl super::Db {
    /// Turn an empty compare-and-set update into the right error.
    async fn updated_or_rejected(
        &self,
        id: JobId,
        row: Option<JobRow>,
        to: JobStatus,
    ) -> Result<Job> {
        match row {
            Some(row) => row.try_into_job(),
            None => {
                let current = JobStore::get(self, id).await?;
                Err(transition_rejected(&current, to))
            }
        }
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    job_type_key: String,
    payload_json: serde_json::Value,
    status: String,
    entity_type_key: String,
    entity_key: String,
    attempt_count: i32,
    max_attempts: i32,
    run_after: DateTime<Utc>,
    locked_until: Option<DateTime<Utc>>,
    locked_by: Option<String>,
    last_error: Option<String>,
    result_json: Option<serde_json::Value>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl JobRow {
    fn try_into_job(self) -> Result<Job> {
        Ok(Job {
            id: JobId(self.id),
            job_type_key: self.job_type_key,
            payload_json: self.payload_json,
            status: self.status.parse()?,
            entity_type_key: self.entity_type_key,
            entity_key: self.entity_key,
            attempt_count: self.attempt_count.max(0) as u32,
            max_attempts: self.max_attempts.max(1) as u32,
            run_after: self.run_after,
            locked_until: self.locked_until,
            locked_by: self.locked_by,
            last_error: self.last_error,
            result_json: self.result_json,
            created_at: self.created_at,
            updated_at: self.updated_at,
            completed_at: self.completed_at,
        })
    }
}
