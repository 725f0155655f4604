//! Contract-driven storage-root integrity checks.
//!
//! A run validates the requested mode, looks up the root's active contract,
//! lists the root and reports missing and unknown entries. In repair mode it
//! plans quarantine moves for unknown entries, subject to the size
//! guardrail, and executes them unless the run is a dry run.
//!
//! Executing moves requires the workflow lock for `root:{provider}:{root}`.
//! The lock is taken before the root is listed so the plan and the moves see
//! the same directory, and it stays held until the moves finish even if the
//! caller gives up on the run.

pub mod audit;
pub mod store;

use opentelemetry::KeyValue;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

use crate::error::Result;
use crate::fs::FileSystem;
use crate::lock::{self, LockBackend, LockScope, WorkflowKind};
use crate::model::contract::{
    IntegrityMode, RootIntegrityRequest, RootIntegrityResult, StorageRootContract,
};
use crate::telemetry::metrics;
use audit::QuarantineSettings;
use store::StorageRootStore;

#[derive(Clone)]
pub struct RootIntegrityChecker {
    roots: Arc<dyn StorageRootStore>,
    locks: Arc<dyn LockBackend>,
    fs: Arc<dyn FileSystem>,
    holder_id: String,
}

impl RootIntegrityChecker {
    pub fn new(
        roots: Arc<dyn StorageRootStore>,
        locks: Arc<dyn LockBackend>,
        fs: Arc<dyn FileSystem>,
        holder_id: impl Into<String>,
    ) -> Self {
        Self {
            roots,
            locks,
            fs,
            holder_id: holder_id.into(),
        }
    }

    /// Run one integrity check.
    ///
    /// Validation failures (bad mode, no active contract, unknown root) come
    /// back as an `Ok` result carrying only errors. The only `Err`s are store
    /// failures and [`crate::Error::LockUnavailable`] for a repair that
    /// could not take the root lock.
    pub async fn run(&self, request: &RootIntegrityRequest) -> Result<RootIntegrityResult> {
        let started = Instant::now();

        let mode = match request.mode.parse::<IntegrityMode>() {
            Ok(mode) => mode,
            Err(e) => {
                let mut result = RootIntegrityResult::new(request, None);
                result.errors.push(e.to_string());
                return Ok(result);
            }
        };
        let mut result = RootIntegrityResult::new(request, Some(mode));

        let Some(contract) = self
            .roots
            .active_contract(&request.provider_key, &request.root_key)
            .await?
        else {
            result.errors.push(format!(
                "no active storage root contract for {}/{}",
                request.provider_key, request.root_key
            ));
            return Ok(result);
        };
        result.contract_key = Some(contract.contract_key.clone());

        let settings = match QuarantineSettings::resolve(
            &contract,
            request.quarantine_relpath.as_deref(),
            request.max_items,
            request.max_bytes,
        ) {
            Ok(settings) => settings,
            Err(e) => {
                result.errors.push(e);
                return Ok(result);
            }
        };

        let Some(root) = self
            .roots
            .root_path(&request.provider_key, &request.root_key)
            .await?
        else {
            result.errors.push(format!(
                "no path registered for storage root {}/{}",
                request.provider_key, request.root_key
            ));
            return Ok(result);
        };

        let executes = mode == IntegrityMode::Repair && !request.dry_run;
        let lease = if executes {
            Some(
                lock::acquire(
                    self.locks.as_ref(),
                    &LockScope::root(&request.provider_key, &request.root_key),
                    WorkflowKind::RootIntegrity,
                    &self.holder_id,
                )
                .await?,
            )
        } else {
            None
        };

        let fs = Arc::clone(&self.fs);
        let result = lock::spawn_blocking_with_lease(lease, move || {
            inspect(fs.as_ref(), &root, &contract, &settings, mode, executes, result)
        })
        .await?;

        metrics::operation_duration_ms().record(
            started.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("operation", "root_integrity")],
        );
        info!(
            provider = %result.provider_key,
            root = %result.root_key,
            mode = %mode,
            dry_run = result.dry_run,
            missing = result.missing_required.len(),
            unknown = result.unknown_entries.len(),
            planned = result.quarantine_plan.len(),
            blocked = result.guardrail_blocks.len(),
            moved = result.actions.len(),
            errors = result.errors.len(),
            "root integrity checked"
        );
        Ok(result)
    }
}

fn inspect(
    fs: &dyn FileSystem,
    root: &Path,
    contract: &StorageRootContract,
    settings: &QuarantineSettings,
    mode: IntegrityMode,
    executes: bool,
    mut result: RootIntegrityResult,
) -> RootIntegrityResult {
    if let Err(e) = audit::audit_root(fs, root, contract, settings, &mut result) {
        result
            .errors
            .push(format!("cannot list root {}: {e}", root.display()));
        return result;
    }

    if mode == IntegrityMode::Repair {
        audit::plan_quarantine(fs, root, settings, &mut result);
        if executes {
            audit::execute_moves(fs, root, settings, &mut result);
        }
    }
    result
}
