//! Job records and typed job payloads.
//!
//! A job is a durable request for a workflow run. Payloads travel as JSON
//! so external enqueuers can write rows directly; workers decode them once
//! into [`JobPayload`] at dequeue time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use super::contract::RootIntegrityRequest;
use super::provisioning::ProvisioningRequest;
use crate::error::{Error, Result};

/// Attempt ceiling for retryable job types.
pub const RETRYABLE_MAX_ATTEMPTS: u32 = 5;

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// A unit of work tracked by the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub job_type_key: String,
    pub payload_json: serde_json::Value,
    pub status: JobStatus,
    pub entity_type_key: String,
    pub entity_key: String,
    /// Failed attempts so far.
    pub attempt_count: u32,
    pub max_attempts: u32,
    /// Not eligible for dequeue before this instant.
    pub run_after: DateTime<Utc>,
    /// Claim expiry of a running job. Past this, the job is stale.
    pub locked_until: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub last_error: Option<String>,
    pub result_json: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Crash-recovery predicate: running with an expired claim.
    ///
    /// Stale counting and stale requeueing both go through this (or its SQL
    /// twin in `db::jobs`), so a preview count matches the requeue.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Running && self.locked_until.is_some_and(|until| until < now)
    }

    pub fn job_type(&self) -> Result<JobType> {
        self.job_type_key.parse()
    }
}

/// Newtype for job IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn can_transition_to(self, to: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, to),
            (Queued, Running)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Queued)     // retry backoff or stale requeue
                | (Failed, Queued) // operator reset
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            other => Err(Error::Other(format!("unknown job status: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Job types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    ProjectBootstrap,
    ProjectArchive,
    RootIntegrity,
    Delivery,
    DeliveryEmail,
}

impl JobType {
    pub fn as_str(self) -> &'static str {
        match self {
            JobType::ProjectBootstrap => "project_bootstrap",
            JobType::ProjectArchive => "project_archive",
            JobType::RootIntegrity => "root_integrity",
            JobType::Delivery => "delivery",
            JobType::DeliveryEmail => "delivery_email",
        }
    }

    /// Retryable types skip the duplicate guard and get backoff retries.
    pub fn is_retryable(self) -> bool {
        matches!(self, JobType::Delivery | JobType::DeliveryEmail)
    }

    pub fn default_max_attempts(self) -> u32 {
        if self.is_retryable() {
            RETRYABLE_MAX_ATTEMPTS
        } else {
            1
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for JobType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "project_bootstrap" => Ok(JobType::ProjectBootstrap),
            "project_archive" => Ok(JobType::ProjectArchive),
            "root_integrity" => Ok(JobType::RootIntegrity),
            "delivery" => Ok(JobType::Delivery),
            "delivery_email" => Ok(JobType::DeliveryEmail),
            other => Err(Error::Payload(format!("unknown job type: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectBootstrapPayload {
    pub project_id: String,
    #[serde(flatten)]
    pub request: ProvisioningRequest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectArchivePayload {
    pub project_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryPayload {
    pub delivery_id: String,
    pub project_id: String,
    #[serde(default)]
    pub files: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryEmailPayload {
    pub delivery_id: String,
    pub project_id: String,
    pub recipients: Vec<String>,
}

/// Typed job payload, one variant per job type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobPayload {
    ProjectBootstrap(ProjectBootstrapPayload),
    ProjectArchive(ProjectArchivePayload),
    RootIntegrity(RootIntegrityRequest),
    Delivery(DeliveryPayload),
    DeliveryEmail(DeliveryEmailPayload),
}

impl JobPayload {
    pub fn job_type(&self) -> JobType {
        match self {
            JobPayload::ProjectBootstrap(_) => JobType::ProjectBootstrap,
            JobPayload::ProjectArchive(_) => JobType::ProjectArchive,
            JobPayload::RootIntegrity(_) => JobType::RootIntegrity,
            JobPayload::Delivery(_) => JobType::Delivery,
            JobPayload::DeliveryEmail(_) => JobType::DeliveryEmail,
        }
    }

    /// Decode a stored payload according to its job type key.
    pub fn decode(job_type_key: &str, payload: &serde_json::Value) -> Result<Self> {
        let job_type: JobType = job_type_key.parse()?;
        let decoded = match job_type {
            JobType::ProjectBootstrap => JobPayload::ProjectBootstrap(from_value(job_type, payload)?),
            JobType::ProjectArchive => JobPayload::ProjectArchive(from_value(job_type, payload)?),
            JobType::RootIntegrity => JobPayload::RootIntegrity(from_value(job_type, payload)?),
            JobType::Delivery => JobPayload::Delivery(from_value(job_type, payload)?),
            JobType::DeliveryEmail => JobPayload::DeliveryEmail(from_value(job_type, payload)?),
        };
        Ok(decoded)
    }

    pub fn to_json(&self) -> Result<serde_json::Value> {
        let value = match self {
            JobPayload::ProjectBootstrap(p) => serde_json::to_value(p)?,
            JobPayload::ProjectArchive(p) => serde_json::to_value(p)?,
            JobPayload::RootIntegrity(p) => serde_json::to_value(p)?,
            JobPayload::Delivery(p) => serde_json::to_value(p)?,
            JobPayload::DeliveryEmail(p) => serde_json::to_value(p)?,
        };
        Ok(value)
    }

    /// The (entity type, entity key) a job with this payload is about.
    pub fn entity(&self) -> (String, String) {
        match self {
            JobPayload::ProjectBootstrap(p) => ("project".into(), p.project_id.clone()),
            JobPayload::ProjectArchive(p) => ("project".into(), p.project_id.clone()),
            JobPayload::RootIntegrity(p) => (
                "storage_root".into(),
                format!("{}:{}", p.provider_key, p.root_key),
            ),
            JobPayload::Delivery(p) => ("delivery".into(), p.delivery_id.clone()),
            JobPayload::DeliveryEmail(p) => ("delivery".into(), p.delivery_id.clone()),
        }
    }
}

fn from_value<T: serde::de::DeserializeOwned>(
    job_type: JobType,
    payload: &serde_json::Value,
) -> Result<T> {
    serde_json::from_value(payload.clone())
        .map_err(|e| Error::Payload(format!("{job_type} payload: {e}")))
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for new jobs. The queue's public API for enqueueing work.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub(crate) job_type: JobType,
    pub(crate) payload_json: serde_json::Value,
    pub(crate) entity_type_key: String,
    pub(crate) entity_key: String,
    pub(crate) max_attempts: Option<u32>,
    pub(crate) run_after: Option<DateTime<Utc>>,
}

impl NewJob {
    /// Build a job from a typed payload; the entity is derived from it.
    pub fn new(payload: &JobPayload) -> Result<Self> {
        let (entity_type_key, entity_key) = payload.entity();
        Ok(Self {
            job_type: payload.job_type(),
            payload_json: payload.to_json()?,
            entity_type_key,
            entity_key,
            max_attempts: None,
            run_after: None,
        })
    }

    /// Build a job from an already-encoded payload (external enqueuers).
    pub fn raw(
        job_type: JobType,
        payload_json: serde_json::Value,
        entity_type_key: impl Into<String>,
        entity_key: impl Into<String>,
    ) -> Self {
        Self {
            job_type,
            payload_json,
            entity_type_key: entity_type_key.into(),
            entity_key: entity_key.into(),
            max_attempts: None,
            run_after: None,
        }
    }

    pub fn entity(mut self, entity_type_key: impl Into<String>, entity_key: impl Into<String>) -> Self {
        self.entity_type_key = entity_type_key.into();
        self.entity_key = entity_key.into();
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = Some(n);
        self
    }

    pub fn run_after(mut self, at: DateTime<Utc>) -> Self {
        self.run_after = Some(at);
        self
    }

    pub fn job_type(&self) -> JobType {
        self.job_type
    }

    /// Materialize the record as it is first stored: queued, zero attempts.
    pub(crate) fn into_job(self, now: DateTime<Utc>) -> Job {
        Job {
            id: JobId::new(),
            job_type_key: self.job_type.as_str().to_string(),
            payload_json: self.payload_json,
            status: JobStatus::Queued,
            entity_type_key: self.entity_type_key,
            entity_key: self.entity_key,
            attempt_count: 0,
            max_attempts: self
                .max_attempts
                .unwrap_or_else(|| self.job_type.default_max_attempts())
                .max(1),
            run_after: self.run_after.unwrap_or(now),
            locked_until: None,
            locked_by: None,
            last_error: None,
            result_json: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }
}
