//! Registry of externally implemented workflows.
//!
//! Bootstrap and root integrity run in-crate. Archive, delivery and
//! delivery email are owned by other services and plug in here; a job whose
//! type has no registered handler fails with an explicit reason.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::Result;
use crate::model::job::{Job, JobPayload, JobType};

/// One workflow implementation. The returned value is stored as the job's
/// `result_json`; an `Err` fails the attempt.
#[async_trait]
pub trait WorkflowHandler: Send + Sync {
    async fn handle(&self, job: &Job, payload: &JobPayload) -> Result<serde_json::Value>;
}

/// Handlers indexed by job type.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<JobType, Arc<dyn WorkflowHandler>>,
}

impl HandlerRegistry {
    /// Create an empty registry with no handlers.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Register `handler` for `job_type`, replacing any previous one.
    pub fn register(mut self, job_type: JobType, handler: Arc<dyn WorkflowHandler>) -> Self {
        self.handlers.insert(job_type, handler);
        self
    }

    /// Look up the handler for a job type.
    pub fn get(&self, job_type: JobType) -> Option<&Arc<dyn WorkflowHandler>> {
        self.handlers.get(&job_type)
    }

    pub fn job_types(&self) -> Vec<JobType> {
        let mut types: Vec<JobType> = self.handlers.keys().copied().collect();
        types.sort_by_key(|t| t.as_str());
        types
    }
}
