//! In-process lock backend for tests and single-process runs.
//!
//! Clones share one lock table, so two clones behave like two workers
//! pointed at the same backing store.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use super::{LeaseRelease, LockBackend, LockScope, WorkflowKind, WorkflowLease};
use crate::error::Result;

type LockTable = Arc<Mutex<HashMap<LockScope, (WorkflowKind, String)>>>;

#[derive(Debug, Clone, Default)]
pub struct MemoryLockBackend {
    held: LockTable,
}

impl MemoryLockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current holder of a scope, if any.
    pub fn holder(&self, scope: &LockScope) -> Option<(WorkflowKind, String)> {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(scope)
            .cloned()
    }

    pub fn is_held(&self, scope: &LockScope) -> bool {
        self.holder(scope).is_some()
    }
}

#[async_trait]
impl LockBackend for MemoryLockBackend {
    async fn try_acquire(
        &self,
        scope: &LockScope,
        kind: WorkflowKind,
        holder_id: &str,
    ) -> Result<Option<WorkflowLease>> {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        if held.contains_key(scope) {
            return Ok(None);
        }
        held.insert(scope.clone(), (kind, holder_id.to_string()));

        Ok(Some(WorkflowLease::new(
            scope.clone(),
            kind,
            holder_id,
            Box::new(MemoryRelease {
                held: Arc::clone(&self.held),
                scope: scope.clone(),
                holder_id: holder_id.to_string(),
            }),
        )))
    }
}

struct MemoryRelease {
    held: LockTable,
    scope: LockScope,
    holder_id: String,
}

impl MemoryRelease {
    fn remove(&self) {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        if held
            .get(&self.scope)
            .is_some_and(|(_, holder)| *holder == self.holder_id)
        {
            held.remove(&self.scope);
        }
    }
}

#[async_trait]
impl LeaseRelease for MemoryRelease {
    async fn release(self: Box<Self>) -> Result<()> {
        self.remove();
        Ok(())
    }

    fn abandon(self: Box<Self>) {
        self.remove();
    }
}
