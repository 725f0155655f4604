//! Durable job queue.
//!
//! [`JobQueue`] holds the queue rules (duplicate guard, retry backoff,
//! stale recovery) and delegates persistence to a [`JobStore`]. The store
//! is the only thing shared between worker processes.
//!
//! Lifecycle: `queued → running → {succeeded | failed}`. A retryable
//! failure goes back to `queued` with a later `run_after`; a running job
//! whose claim expired is stale and can be requeued.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use opentelemetry::KeyValue;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::model::job::{Job, JobId, JobPayload, JobStatus, NewJob};
use crate::telemetry::metrics;

/// What the store did with an insert.
#[derive(Debug, Clone)]
pub enum InsertOutcome {
    Inserted(Job),
    /// A guarded insert found a non-terminal job for the same key.
    Existing(Job),
}

/// Listing filter. Empty filter lists everything, newest first.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub job_type_key: Option<String>,
    pub entity_type_key: Option<String>,
    pub entity_key: Option<String>,
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn matches(&self, job: &Job) -> bool {
        self.status.is_none_or(|s| job.status == s)
            && self
                .job_type_key
                .as_deref()
                .is_none_or(|t| job.job_type_key == t)
            && self
                .entity_type_key
                .as_deref()
                .is_none_or(|t| job.entity_type_key == t)
            && self.entity_key.as_deref().is_none_or(|k| job.entity_key == k)
    }
}

/// Persistence for job records.
///
/// Status-changing methods are compare-and-set: they only act on a job in
/// the expected source status and return `InvalidTransition` otherwise.
/// Methods taking a `worker_id` also require the running job's claim to
/// belong to that worker, so a worker whose claim expired and was requeued
/// cannot retire the new holder's run.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job. With `guarded`, atomically refuse when a queued or
    /// running job exists for the same (type, entity type, entity key).
    async fn insert(&self, job: Job, guarded: bool) -> Result<InsertOutcome>;

    /// The queued or running job for a key, if any.
    async fn find_active(
        &self,
        job_type_key: &str,
        entity_type_key: &str,
        entity_key: &str,
    ) -> Result<Option<Job>>;

    async fn get(&self, id: JobId) -> Result<Job>;

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>>;

    /// Claim the next due queued job: queued → running, claim held until
    /// `locked_until`.
    async fn claim_next(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        locked_until: DateTime<Utc>,
    ) -> Result<Option<Job>>;

    /// Push out `locked_until` on a job this worker still holds.
    async fn extend_claim(
        &self,
        id: JobId,
        worker_id: &str,
        locked_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Job>;

    /// running → succeeded.
    async fn mark_succeeded(
        &self,
        id: JobId,
        worker_id: &str,
        result: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Result<Job>;

    /// running → queued for a later retry.
    async fn reschedule(
        &self,
        id: JobId,
        worker_id: &str,
        attempt_count: u32,
        run_after: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<Job>;

    /// running → failed, permanently.
    async fn mark_failed(
        &self,
        id: JobId,
        worker_id: &str,
        attempt_count: u32,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<Job>;

    /// failed → queued with a fresh attempt budget.
    async fn reset(&self, id: JobId, now: DateTime<Utc>) -> Result<Job>;

    /// Jobs matching the stale predicate ([`Job::is_stale`]).
    async fn count_stale(&self, now: DateTime<Utc>) -> Result<u64>;

    /// Move every stale job back to queued. Returns the requeued ids.
    async fn requeue_stale(&self, now: DateTime<Utc>) -> Result<Vec<JobId>>;
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Result of enqueueing. Not being enqueued is a normal outcome, not an error.
#[derive(Debug, Clone)]
pub enum EnqueueResult {
    Enqueued(Box<Job>),
    NotEnqueued { existing: Box<Job>, reason: String },
}

impl EnqueueResult {
    pub fn enqueued(&self) -> bool {
        matches!(self, EnqueueResult::Enqueued(_))
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            EnqueueResult::Enqueued(_) => None,
            EnqueueResult::NotEnqueued { reason, .. } => Some(reason),
        }
    }

    /// The new job, or the existing job that blocked the enqueue.
    pub fn job(&self) -> &Job {
        match self {
            EnqueueResult::Enqueued(job) => job,
            EnqueueResult::NotEnqueued { existing, .. } => existing,
        }
    }
}

/// A claimed job with its payload decoded.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub job: Job,
    pub payload: JobPayload,
}

/// What happened to a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    Rescheduled {
        attempt: u32,
        run_after: DateTime<Utc>,
    },
    Failed {
        attempt: u32,
    },
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Exponential backoff between attempts of retryable jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: TimeDelta,
    pub max_delay: TimeDelta,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: TimeDelta::seconds(30),
            max_delay: TimeDelta::minutes(30),
        }
    }
}

impl RetryPolicy {
    /// Delay after the `attempt`-th failure (1-based): base, 2×base, 4×base …
    pub fn delay_for(&self, attempt: u32) -> TimeDelta {
        let factor = 1i32 << attempt.saturating_sub(1).min(16);
        (self.base_delay * factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    /// How long a claim lasts before the job counts as stale.
    pub lock_duration: TimeDelta,
    pub retry: RetryPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lock_duration: TimeDelta::minutes(30),
            retry: RetryPolicy::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn JobStore>,
    config: QueueConfig,
}

impl JobQueue {
    pub fn new(store: Arc<dyn JobStore>, config: QueueConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Enqueue a job. Non-retryable types are refused while a queued or
    /// running job exists for the same entity; nothing is written then.
    pub async fn enqueue(&self, new: NewJob) -> Result<EnqueueResult> {
        let job_type = new.job_type();
        let guarded = !job_type.is_retryable();

        if guarded
            && let Some(existing) = self
                .store
                .find_active(job_type.as_str(), &new.entity_type_key, &new.entity_key)
                .await?
        {
            return Ok(not_enqueued(existing));
        }

        match self.store.insert(new.into_job(Utc::now()), guarded).await? {
            InsertOutcome::Inserted(job) => {
                metrics::jobs_enqueued().add(
                    1,
                    &[
                        KeyValue::new("job_type", job.job_type_key.clone()),
                        KeyValue::new("result", "ok"),
                    ],
                );
                info!(
                    job_id = %job.id,
                    job_type = %job.job_type_key,
                    entity = %format!("{}:{}", job.entity_type_key, job.entity_key),
                    "job enqueued"
                );
                Ok(EnqueueResult::Enqueued(Box::new(job)))
            }
            InsertOutcome::Existing(existing) => Ok(not_enqueued(existing)),
        }
    }

    /// Claim the next due job and decode its payload. Jobs whose payload
    /// cannot be decoded are failed on the spot and skipped.
    pub async fn dequeue(&self, worker_id: &str, now: DateTime<Utc>) -> Result<Option<ClaimedJob>> {
        loop {
            let locked_until = now + self.config.lock_duration;
            let Some(job) = self.store.claim_next(worker_id, now, locked_until).await? else {
                return Ok(None);
            };
            record_transition(JobStatus::Queued, JobStatus::Running);

            match JobPayload::decode(&job.job_type_key, &job.payload_json) {
                Ok(payload) => return Ok(Some(ClaimedJob { job, payload })),
                Err(e) => {
                    warn!(job_id = %job.id, error = %e, "undecodable payload, failing job");
                    self.store
                        .mark_failed(job.id, worker_id, job.attempt_count + 1, &e.to_string(), now)
                        .await?;
                    record_transition(JobStatus::Running, JobStatus::Failed);
                }
            }
        }
    }

    /// Retire a run as succeeded. Only the worker holding the claim may.
    pub async fn complete(
        &self,
        id: JobId,
        worker_id: &str,
        result: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Result<Job> {
        let job = self.store.mark_succeeded(id, worker_id, result, now).await?;
        record_transition(JobStatus::Running, JobStatus::Succeeded);
        Ok(job)
    }

    /// Record a failed attempt by the worker holding the claim.
    ///
    /// `max_attempts` counts runs, not retries: a retryable job is
    /// rescheduled with backoff while `attempt < max_attempts`, so the
    /// `max_attempts`-th failure is final. Everything else fails permanently
    /// on its first failure.
    pub async fn fail(
        &self,
        id: JobId,
        worker_id: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<FailOutcome> {
        let job = self.store.get(id).await?;
        if job.status != JobStatus::Running || job.locked_by.as_deref() != Some(worker_id) {
            return Err(transition_rejected(&job, JobStatus::Failed));
        }

        let attempt = job.attempt_count + 1;
        let retryable = job.job_type().is_ok_and(|t| t.is_retryable());

        if retryable && attempt < job.max_attempts {
            let run_after = now + self.config.retry.delay_for(attempt);
            self.store
                .reschedule(id, worker_id, attempt, run_after, error, now)
                .await?;
            record_transition(JobStatus::Running, JobStatus::Queued);
            info!(job_id = %id, attempt, max = job.max_attempts, %run_after, "job rescheduled");
            Ok(FailOutcome::Rescheduled { attempt, run_after })
        } else {
            self.store.mark_failed(id, worker_id, attempt, error, now).await?;
            record_transition(JobStatus::Running, JobStatus::Failed);
            warn!(job_id = %id, attempt, error, "job failed");
            Ok(FailOutcome::Failed { attempt })
        }
    }

    /// Extend this worker's claim by another lock duration from `now`.
    pub async fn renew_claim(
        &self,
        id: JobId,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Job> {
        self.store
            .extend_claim(id, worker_id, now + self.config.lock_duration, now)
            .await
    }

    /// Operator retry of a failed job.
    pub async fn reset(&self, id: JobId, now: DateTime<Utc>) -> Result<Job> {
        let job = self.store.reset(id, now).await?;
        record_transition(JobStatus::Failed, JobStatus::Queued);
        Ok(job)
    }

    /// Dry run of [`JobQueue::requeue_stale`]: same predicate, no writes.
    pub async fn stale_count(&self, now: DateTime<Utc>) -> Result<u64> {
        self.store.count_stale(now).await
    }

    /// Return crashed workers' jobs to the queue. Attempt counts are left
    /// alone; a crash is not a failure of the job.
    pub async fn requeue_stale(&self, now: DateTime<Utc>) -> Result<Vec<JobId>> {
        let requeued = self.store.requeue_stale(now).await?;
        if !requeued.is_empty() {
            metrics::jobs_stale_requeued().add(requeued.len() as u64, &[]);
            for id in &requeued {
                warn!(job_id = %id, "stale job requeued");
            }
        }
        Ok(requeued)
    }

    pub async fn get(&self, id: JobId) -> Result<Job> {
        self.store.get(id).await
    }

    pub async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        self.store.list(filter).await
    }
}

fn not_enqueued(existing: Job) -> EnqueueResult {
    metrics::jobs_enqueued().add(
        1,
        &[
            KeyValue::new("job_type", existing.job_type_key.clone()),
            KeyValue::new("result", "duplicate"),
        ],
    );
    let reason = format!(
        "job {} is already {} for {} {}:{}",
        existing.id,
        existing.status,
        existing.job_type_key,
        existing.entity_type_key,
        existing.entity_key
    );
    info!(job_id = %existing.id, %reason, "enqueue skipped");
    EnqueueResult::NotEnqueued {
        existing: Box::new(existing),
        reason,
    }
}

/// `InvalidTransition` for a compare-and-set that found `current` instead of
/// a running job claimed by the caller.
pub(crate) fn transition_rejected(current: &Job, to: JobStatus) -> Error {
    let from = match (current.status, current.locked_by.as_deref()) {
        (JobStatus::Running, Some(holder)) => format!("running (claimed by {holder})"),
        (status, _) => status.to_string(),
    };
    Error::InvalidTransition {
        from,
        to: to.to_string(),
    }
}

fn record_transition(from: JobStatus, to: JobStatus) {
    metrics::job_state_transitions().add(
        1,
        &[
            KeyValue::new("from", from.as_str()),
            KeyValue::new("to", to.as_str()),
        ],
    );
}
