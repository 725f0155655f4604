//! In-process job store for tests and single-process runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::{InsertOutcome, JobFilter, JobStore, transition_rejected};
use crate::error::{Error, Result};
use crate::model::job::{Job, JobId, JobStatus};

/// Jobs kept in insertion order behind one async mutex. Clones share the
/// same jobs.
#[derive(Debug, Clone, Default)]
pub struct MemoryJobStore {
    jobs: Arc<Mutex<Vec<Job>>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a stored job. Lets tests fabricate states such as an
    /// expired claim.
    pub async fn put(&self, job: Job) {
        let mut jobs = self.jobs.lock().await;
        match jobs.iter_mut().find(|j| j.id == job.id) {
            Some(slot) => *slot = job,
            None => jobs.push(job),
        }
    }
}

fn find_mut(jobs: &mut [Job], id: JobId) -> Result<&mut Job> {
    jobs.iter_mut()
        .find(|j| j.id == id)
        .ok_or_else(|| Error::NotFound(format!("job {id}")))
}

fn transition(job: &mut Job, to: JobStatus) -> Result<()> {
    if !job.status.can_transition_to(to) {
        return Err(Error::InvalidTransition {
            from: job.status.to_string(),
            to: to.to_string(),
        });
    }
    job.status = to;
    Ok(())
}

/// The job must be running under `worker_id`'s claim.
fn check_claim(job: &Job, worker_id: &str, to: JobStatus) -> Result<()> {
    if job.status != JobStatus::Running || job.locked_by.as_deref() != Some(worker_id) {
        return Err(transition_rejected(job, to));
    }
    Ok(())
}

fn is_active_for(job: &Job, job_type_key: &str, entity_type_key: &str, entity_key: &str) -> bool {
    !job.status.is_terminal()
        && job.job_type_key == job_type_key
        && job.entity_type_key == entity_type_key
        && job.entity_key == entity_key
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: Job, guarded: bool) -> Result<InsertOutcome> {
        let mut jobs = self.jobs.lock().await;
        if guarded
            && let Some(existing) = jobs.iter().find(|j| {
                is_active_for(j, &job.job_type_key, &job.entity_type_key, &job.entity_key)
            })
        {
            return Ok(InsertOutcome::Existing(existing.clone()));
        }
        jobs.push(job.clone());
        Ok(InsertOutcome::Inserted(job))
    }

    async fn find_active(
        &self,
        job_type_key: &str,
        entity_type_key: &str,
        entity_key: &str,
    ) -> Result<Option<Job>> {
        let jobs = self.jobs.lock().await;
        Ok(jobs
            .iter()
            .find(|j| is_active_for(j, job_type_key, entity_type_key, entity_key))
            .cloned())
    }

    async fn get(&self, id: JobId) -> Result<Job> {
        let jobs = self.jobs.lock().await;
        jobs.iter()
            .find(|j| j.id == id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("job {id}")))
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let jobs = self.jobs.lock().await;
        let mut listed: Vec<Job> = jobs.iter().filter(|j| filter.matches(j)).cloned().collect();
        listed.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            listed.truncate(limit);
        }
        Ok(listed)
    }

    async fn claim_next(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        locked_until: DateTime<Utc>,
    ) -> Result<Option<Job>> {
        let mut jobs = self.jobs.lock().await;
        let Some(job) = jobs
            .iter_mut()
            .filter(|j| j.status == JobStatus::Queued && j.run_after <= now)
            .min_by_key(|j| (j.run_after, j.created_at))
        else {
            return Ok(None);
        };

        transition(job, JobStatus::Running)?;
        job.locked_by = Some(worker_id.to_string());
        job.locked_until = Some(locked_until);
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn extend_claim(
        &self,
        id: JobId,
        worker_id: &str,
        locked_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Job> {
        let mut jobs = self.jobs.lock().await;
        let job = find_mut(&mut jobs, id)?;
        check_claim(job, worker_id, JobStatus::Running)?;
        job.locked_until = Some(locked_until);
        job.updated_at = now;
        Ok(job.clone())
    }

    async fn mark_succeeded(
        &self,
        id: JobId,
        worker_id: &str,
        result: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Result<Job> {
        let mut jobs = self.jobs.lock().await;
        let job = find_mut(&mut jobs, id)?;
        check_claim(job, worker_id, JobStatus::Succeeded)?;
        transition(job, JobStatus::Succeeded)?;
        job.result_json = result;
        job.locked_by = None;
        job.locked_until = None;
        job.completed_at = Some(now);
        job.updated_at = now;
        Ok(job.clone())
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
        let mut jobs = self.jobs.lock().await;
        let job = find_mut(&mut jobs, id)?;
        check_claim(job, worker_id, JobStatus::Queued)?;
        transition(job, JobStatus::Queued)?;
        job.attempt_count = attempt_count;
        job.run_after = run_after;
        job.last_error = Some(error.to_string());
        job.locked_by = None;
        job.locked_until = None;
        job.updated_at = now;
        Ok(job.clone())
    }

    async fn mark_failed(
        &self,
        id: JobId,
        worker_id: &str,
        attempt_count: u32,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<Job> {
        let mut jobs = self.jobs.lock().await;
        let job = find_mut(&mut jobs, id)?;
        check_claim(job, worker_id, JobStatus::Failed)?;
        transition(job, JobStatus::Failed)?;
        job.attempt_count = attempt_count;
        job.last_error = Some(error.to_string());
        job.locked_by = None;
        job.locked_until = None;
        job.completed_at = Some(now);
        job.updated_at = now;
        Ok(job.clone())
    }

    async fn reset(&self, id: JobId, now: DateTime<Utc>) -> Result<Job> {
        let mut jobs = self.jobs.lock().await;
        let job = find_mut(&mut jobs, id)?;
        if job.status != JobStatus::Failed {
            return Err(Error::InvalidTransition {
                from: job.status.to_string(),
                to: JobStatus::Queued.to_string(),
            });
        }
        transition(job, JobStatus::Queued)?;
        job.attempt_count = 0;
        job.run_after = now;
        job.completed_at = None;
        job.updated_at = now;
        Ok(job.clone())
    }

    async fn count_stale(&self, now: DateTime<Utc>) -> Result<u64> {
        let jobs = self.jobs.lock().await;
        Ok(jobs.iter().filter(|j| j.is_stale(now)).count() as u64)
    }

    async fn requeue_stale(&self, now: DateTime<Utc>) -> Result<Vec<JobId>> {
        let mut jobs = self.jobs.lock().await;
        let mut requeued = Vec::new();
        for job in jobs.iter_mut().filter(|j| j.is_stale(now)) {
            transition(job, JobStatus::Queued)?;
            job.locked_by = None;
            job.locked_until = None;
            job.run_after = now;
            job.updated_at = now;
            requeued.push(job.id);
        }
        Ok(requeued)
    }
}
