//! Template-driven folder provisioning.
//!
//! `tokens` expands node names, `policy` holds the naming rules, `planner`
//! turns a template into a validated plan, and `executor` applies, verifies
//! or repairs that plan on disk and writes the manifest.

pub mod executor;
pub mod manifest;
pub mod planner;
pub mod policy;
pub mod template;
pub mod tokens;

use std::sync::Arc;
use tracing::info;

use crate::error::Result;
use crate::fs::FileSystem;
use crate::model::provisioning::{ProvisioningRequest, ProvisioningResult};
use crate::model::template::FolderPlan;
use executor::ExecutionOptions;
use policy::FolderPolicy;

/// Loads templates, plans, and executes provisioning requests.
#[derive(Clone)]
pub struct Provisioner {
    fs: Arc<dyn FileSystem>,
    policy: FolderPolicy,
}

impl Provisioner {
    pub fn new(fs: Arc<dyn FileSystem>, policy: FolderPolicy) -> Self {
        Self { fs, policy }
    }

    pub fn policy(&self) -> &FolderPolicy {
        &self.policy
    }

    /// Load the request's template and plan it. Policy violations are errors.
    pub fn plan(&self, request: &ProvisioningRequest) -> Result<FolderPlan> {
        let loaded = template::load_template(
            self.fs.as_ref(),
            &request.template_path,
            request.schema_path.as_deref(),
        )?;
        planner::plan(&loaded, &request.tokens, &self.policy)
    }

    /// Plan and execute a request. Blocking; run it off the async executor.
    pub fn run(&self, request: &ProvisioningRequest) -> Result<ProvisioningResult> {
        let plan = self.plan(request)?;
        let result = executor::execute(
            self.fs.as_ref(),
            &self.policy,
            &plan,
            ExecutionOptions {
                mode: request.mode,
                base_path: &request.base_path,
                seeds_path: request.seeds_path.as_deref(),
                tokens: &request.tokens,
                force_overwrite_seeded_files: request.force_overwrite_seeded_files,
            },
        );
        info!(
            template = %result.template_key,
            base_path = %request.base_path.display(),
            success = result.success(),
            "{}",
            result.summary()
        );
        Ok(result)
    }
}
