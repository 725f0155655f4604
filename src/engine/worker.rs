//! Worker loop: claim a job, take its workflow lock, run it, retire it.

use chrono::Utc;
use opentelemetry::KeyValue;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{Instrument, error, info, warn};

use super::handlers::HandlerRegistry;
use crate::error::{Error, Result};
use crate::integrity::RootIntegrityChecker;
use crate::lock::{self, LockBackend, LockScope, WorkflowKind};
use crate::model::job::{Job, JobPayload, JobStatus, ProjectBootstrapPayload};
use crate::model::provisioning::ProvisioningResult;
use crate::provisioning::Provisioner;
use crate::queue::{ClaimedJob, FailOutcome, JobQueue};
use crate::telemetry::job::{record_state_transition, start_job_span};
use crate::telemetry::metrics;

/// Configuration for the worker loop.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Recorded as `locked_by` and as lease holder.
    pub worker_id: String,
    /// Sleep between polls when the queue is empty.
    pub poll_interval: Duration,
    /// How often to requeue stale jobs.
    pub stale_sweep_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", std::process::id()),
            poll_interval: Duration::from_secs(2),
            stale_sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Lock needed before running a job, if any.
fn lock_target(payload: &JobPayload) -> Option<(LockScope, WorkflowKind)> {
    match payload {
        // Bootstrap and integrity take their locks themselves so the lease
        // goes with the blocking filesystem work.
        JobPayload::ProjectBootstrap(_) => None,
        JobPayload::ProjectArchive(p) => {
            Some((LockScope::project(&p.project_id), WorkflowKind::Archive))
        }
        JobPayload::Delivery(p) => Some((LockScope::project(&p.project_id), WorkflowKind::Delivery)),
        JobPayload::DeliveryEmail(_) => None,
        JobPayload::RootIntegrity(_) => None,
    }
}

#[derive(Clone)]
pub struct Worker {
    queue: JobQueue,
    locks: Arc<dyn LockBackend>,
    provisioner: Provisioner,
    integrity: RootIntegrityChecker,
    handlers: Arc<HandlerRegistry>,
    config: WorkerConfig,
    shutdown: Arc<Notify>,
    stopping: Arc<AtomicBool>,
}

impl Worker {
    pub fn new(
        queue: JobQueue,
        locks: Arc<dyn LockBackend>,
        provisioner: Provisioner,
        integrity: RootIntegrityChecker,
        handlers: Arc<HandlerRegistry>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue,
            locks,
            provisioner,
            integrity,
            handlers,
            config,
            shutdown: Arc::new(Notify::new()),
            stopping: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Signal the worker to stop after the job in hand.
    pub fn shutdown(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.shutdown.notify_one();
    }

    /// Run the worker loop until shutdown.
    pub async fn run(&self) -> Result<()> {
        info!(worker = %self.config.worker_id, "worker started");
        let mut last_sweep: Option<Instant> = None;

        loop {
            if self.stopping.load(Ordering::SeqCst) {
                info!("worker shutting down");
                return Ok(());
            }

            if last_sweep.is_none_or(|at| at.elapsed() >= self.config.stale_sweep_interval) {
                last_sweep = Some(Instant::now());
                match self.queue.requeue_stale(Utc::now()).await {
                    Ok(ids) if !ids.is_empty() => info!(count = ids.len(), "stale sweep requeued jobs"),
                    Ok(_) => {}
                    Err(e) => error!("stale sweep error: {e}"),
                }
            }

            let processed = match self.process_next().await {
                Ok(processed) => processed,
                Err(e) => {
                    error!("process_next error: {e}");
                    false
                }
            };
            if processed {
                continue;
            }

            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("worker shutting down");
                    return Ok(());
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }

    /// Claim and run one job. Returns `false` when nothing was due.
    pub async fn process_next(&self) -> Result<bool> {
        let Some(claimed) = self
            .queue
            .dequeue(&self.config.worker_id, Utc::now())
            .await?
        else {
            return Ok(false);
        };

        let job = &claimed.job;
        let span = start_job_span(&job.job_type_key, &job.id, job.attempt_count + 1);
        record_state_transition(&span, JobStatus::Queued.as_str(), JobStatus::Running.as_str());

        let worker_id = self.config.worker_id.as_str();
        async {
            let started = Instant::now();
            let outcome = self.execute_with_renewal(&claimed).await;
            metrics::operation_duration_ms().record(
                started.elapsed().as_secs_f64() * 1000.0,
                &[KeyValue::new("operation", format!("job.{}", job.job_type_key))],
            );

            match outcome {
                Ok(result) => {
                    let completed = self
                        .queue
                        .complete(job.id, worker_id, Some(result), Utc::now())
                        .await;
                    match completed {
                        Ok(_) => {
                            record_state_transition(&span, "running", "succeeded");
                            info!(job_id = %job.id, "job succeeded");
                        }
                        // Stale-requeued and claimed by another worker meanwhile.
                        Err(e @ Error::InvalidTransition { .. }) => {
                            warn!(job_id = %job.id, error = %e, "claim lost, result discarded");
                        }
                        Err(e) => return Err(e),
                    }
                }
                Err(e) => {
                    let reason = failure_reason(&e);
                    match self.queue.fail(job.id, worker_id, &reason, Utc::now()).await {
                        Ok(FailOutcome::Rescheduled { .. }) => {
                            record_state_transition(&span, "running", "queued");
                        }
                        Ok(FailOutcome::Failed { .. }) => {
                            record_state_transition(&span, "running", "failed");
                        }
                        Err(e @ Error::InvalidTransition { .. }) => {
                            warn!(job_id = %job.id, error = %e, "claim lost, failure not recorded");
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
            Ok(true)
        }
        .instrument(span.clone())
        .await
    }

    /// Run the job while renewing its claim every third of the lock
    /// duration, so a long job is not requeued as stale under its worker.
    async fn execute_with_renewal(&self, claimed: &ClaimedJob) -> Result<serde_json::Value> {
        let every = (self.queue.config().lock_duration / 3)
            .to_std()
            .unwrap_or(Duration::from_secs(60))
            .max(Duration::from_millis(10));
        let mut renew = tokio::time::interval_at(tokio::time::Instant::now() + every, every);

        let work = self.execute(claimed);
        tokio::pin!(work);
        loop {
            tokio::select! {
                outcome = &mut work => return outcome,
                _ = renew.tick() => {
                    if let Err(e) = self
                        .queue
                        .renew_claim(claimed.job.id, &self.config.worker_id, Utc::now())
                        .await
                    {
                        warn!(job_id = %claimed.job.id, error = %e, "claim renewal failed");
                    }
                }
            }
        }
    }

    /// Run the workflow for a claimed job under its lock, if it needs one.
    async fn execute(&self, claimed: &ClaimedJob) -> Result<serde_json::Value> {
        match lock_target(&claimed.payload) {
            Some((scope, kind)) => {
                lock::run_exclusive(
                    self.locks.as_ref(),
                    &scope,
                    kind,
                    &self.config.worker_id,
                    self.dispatch(&claimed.job, &claimed.payload),
                )
                .await
            }
            None => self.dispatch(&claimed.job, &claimed.payload).await,
        }
    }

    async fn dispatch(&self, job: &Job, payload: &JobPayload) -> Result<serde_json::Value> {
        match payload {
            JobPayload::ProjectBootstrap(p) => self.bootstrap(p).await,
            JobPayload::RootIntegrity(request) => {
                let result = self.integrity.run(request).await?;
                if !result.errors.is_empty() {
                    return Err(Error::Other(format!(
                        "root integrity {}/{}: {}",
                        result.provider_key,
                        result.root_key,
                        result.errors.join("; ")
                    )));
                }
                Ok(serde_json::to_value(&result)?)
            }
            JobPayload::ProjectArchive(_)
            | JobPayload::Delivery(_)
            | JobPayload::DeliveryEmail(_) => {
                let job_type = payload.job_type();
                let Some(handler) = self.handlers.get(job_type) else {
                    metrics::jobs_unhandled()
                        .add(1, &[KeyValue::new("job_type", job_type.as_str())]);
                    warn!(job_type = %job_type, "no handler registered for job type");
                    return Err(Error::Other(format!(
                        "no handler registered for job type {job_type}"
                    )));
                };
                handler.handle(job, payload).await
            }
        }
    }

    async fn bootstrap(&self, payload: &ProjectBootstrapPayload) -> Result<serde_json::Value> {
        let lease = if payload.request.mode.is_mutating() {
            Some(
                lock::acquire(
                    self.locks.as_ref(),
                    &LockScope::project(&payload.project_id),
                    WorkflowKind::Bootstrap,
                    &self.config.worker_id,
                )
                .await?,
            )
        } else {
            None
        };

        let provisioner = self.provisioner.clone();
        let request = payload.request.clone();
        let result: ProvisioningResult =
            lock::spawn_blocking_with_lease(lease, move || provisioner.run(&request)).await??;

        let failed = if payload.request.mode.is_mutating() {
            !result.success()
        } else {
            !result.errors.is_empty()
        };
        if failed {
            let mut reason = result.summary();
            if let Some(first) = result.errors.first() {
                reason.push_str(&format!("; first error: {first}"));
            }
            return Err(Error::Other(format!(
                "bootstrap of project {} failed: {reason}",
                payload.project_id
            )));
        }
        Ok(serde_json::to_value(&result)?)
    }
}

fn failure_reason(e: &Error) -> String {
    match e {
        Error::LockUnavailable { scope } => format!(
            "workflow lock unavailable for scope {scope}: another workflow is running on this resource"
        ),
        other => other.to_string(),
    }
}
