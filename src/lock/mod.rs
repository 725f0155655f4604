//! Workflow locks: process-external mutual exclusion keyed by scope string.
//!
//! Acquisition is a single non-blocking try. A held lock comes back as a
//! [`WorkflowLease`]; "busy" comes back as `None` (or
//! [`Error::LockUnavailable`] from [`acquire`]) and is never waited on.
//!
//! Leases release on every exit path. Call [`WorkflowLease::release`] on the
//! normal path; if the lease is dropped instead (early return, panic, or the
//! owning future being cancelled) the backend's synchronous abandon hook
//! frees the lock.
//!
//! Blocking work keeps running on the blocking pool after its caller is
//! cancelled, so a lease protecting it must travel with it:
//! [`spawn_blocking_with_lease`] frees the lease only once the work returns.

pub mod memory;

use async_trait::async_trait;
use opentelemetry::KeyValue;
use std::future::Future;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::telemetry::metrics;

/// Opaque lock scope derived from resource identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockScope(String);

impl LockScope {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// `project:{id}`
    pub fn project(project_id: &str) -> Self {
        Self(format!("project:{project_id}"))
    }

    /// `root:{provider}:{root}`
    pub fn root(provider_key: &str, root_key: &str) -> Self {
        Self(format!("root:{provider_key}:{root_key}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for LockScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which workflow holds (or wants) a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkflowKind {
    Bootstrap,
    Archive,
    Delivery,
    RootIntegrity,
}

impl WorkflowKind {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowKind::Bootstrap => "bootstrap",
            WorkflowKind::Archive => "archive",
            WorkflowKind::Delivery => "delivery",
            WorkflowKind::RootIntegrity => "root_integrity",
        }
    }
}

impl std::fmt::Display for WorkflowKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[async_trait]
pub trait LockBackend: Send + Sync {
    /// One round trip. `Ok(None)` means another holder has the scope.
    async fn try_acquire(
        &self,
        scope: &LockScope,
        kind: WorkflowKind,
        holder_id: &str,
    ) -> Result<Option<WorkflowLease>>;
}

/// Backend-specific release of a held lock.
#[async_trait]
pub trait LeaseRelease: Send {
    async fn release(self: Box<Self>) -> Result<()>;

    /// Free the lock without awaiting. Called from `Drop`.
    fn abandon(self: Box<Self>);
}

/// Exclusive hold on a scope for the lifetime of one operation.
pub struct WorkflowLease {
    scope: LockScope,
    kind: WorkflowKind,
    holder_id: String,
    releaser: Option<Box<dyn LeaseRelease>>,
}

impl WorkflowLease {
    pub fn new(
        scope: LockScope,
        kind: WorkflowKind,
        holder_id: impl Into<String>,
        releaser: Box<dyn LeaseRelease>,
    ) -> Self {
        Self {
            scope,
            kind,
            holder_id: holder_id.into(),
            releaser: Some(releaser),
        }
    }

    pub fn scope(&self) -> &LockScope {
        &self.scope
    }

    pub fn kind(&self) -> WorkflowKind {
        self.kind
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    pub async fn release(mut self) -> Result<()> {
        match self.releaser.take() {
            Some(releaser) => {
                debug!(scope = %self.scope, holder = %self.holder_id, "lease released");
                releaser.release().await
            }
            None => Ok(()),
        }
    }
}

impl Drop for WorkflowLease {
    fn drop(&mut self) {
        if let Some(releaser) = self.releaser.take() {
            warn!(
                scope = %self.scope,
                holder = %self.holder_id,
                "lease dropped before release, abandoning"
            );
            releaser.abandon();
        }
    }
}

impl std::fmt::Debug for WorkflowLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowLease")
            .field("scope", &self.scope)
            .field("kind", &self.kind)
            .field("holder_id", &self.holder_id)
            .field("held", &self.releaser.is_some())
            .finish()
    }
}

/// Try-acquire or fail with [`Error::LockUnavailable`].
pub async fn acquire(
    backend: &dyn LockBackend,
    scope: &LockScope,
    kind: WorkflowKind,
    holder_id: &str,
) -> Result<WorkflowLease> {
    let lease = backend.try_acquire(scope, kind, holder_id).await?;
    let outcome = if lease.is_some() { "acquired" } else { "busy" };
    metrics::lock_attempts().add(
        1,
        &[
            KeyValue::new("workflow", kind.as_str()),
            KeyValue::new("result", outcome),
        ],
    );
    lease.ok_or_else(|| Error::LockUnavailable {
        scope: scope.to_string(),
    })
}

/// Run `operation` while holding `scope`.
///
/// The future is not polled unless the lock was acquired. The lease is
/// released after it finishes, whether it succeeded or failed; if this
/// future is itself dropped mid-flight the lease is abandoned.
pub async fn run_exclusive<T, F>(
    backend: &dyn LockBackend,
    scope: &LockScope,
    kind: WorkflowKind,
    holder_id: &str,
    operation: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let lease = acquire(backend, scope, kind, holder_id).await?;
    let outcome = operation.await;
    if let Err(e) = lease.release().await {
        warn!(scope = %scope, error = %e, "lease release failed");
    }
    outcome
}

/// Run blocking `work` on the blocking pool while `lease` is held.
///
/// The lease moves into the blocking task. If this future is dropped the
/// task still finishes and the lease is abandoned when it does, never
/// before. Otherwise the lease is released after `work` returns.
pub async fn spawn_blocking_with_lease<T, F>(lease: Option<WorkflowLease>, work: F) -> Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let (value, lease) = tokio::task::spawn_blocking(move || {
        let value = work();
        (value, lease)
    })
    .await?;

    if let Some(lease) = lease
        && let Err(e) = lease.release().await
    {
        warn!(error = %e, "lease release failed");
    }
    Ok(value)
}
