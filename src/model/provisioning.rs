//! Provisioning request, result, and manifest types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::template::{PlanItem, ProvisioningTokens};
use crate::error::Error;

/// How a plan is applied to the filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisioningMode {
    /// Compute the plan only. No filesystem access.
    Plan,
    /// Create whatever is absent.
    Apply,
    /// Read-only check for missing required items.
    Verify,
    /// Apply, optionally overwriting seeded files when forced.
    Repair,
}

impl ProvisioningMode {
    /// Does this mode write to the filesystem?
    pub fn is_mutating(self) -> bool {
        matches!(self, ProvisioningMode::Apply | ProvisioningMode::Repair)
    }
}

impl std::fmt::Display for ProvisioningMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProvisioningMode::Plan => "plan",
            ProvisioningMode::Apply => "apply",
            ProvisioningMode::Verify => "verify",
            ProvisioningMode::Repair => "repair",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ProvisioningMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "plan" => Ok(ProvisioningMode::Plan),
            "apply" => Ok(ProvisioningMode::Apply),
            "verify" => Ok(ProvisioningMode::Verify),
            "repair" => Ok(ProvisioningMode::Repair),
            other => Err(Error::Payload(format!(
                "unknown provisioning mode '{other}' (expected plan|apply|verify|repair)"
            ))),
        }
    }
}

/// A request to provision (or check) a project folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisioningRequest {
    pub mode: ProvisioningMode,
    pub template_path: PathBuf,
    pub base_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seeds_path: Option<PathBuf>,
    pub tokens: ProvisioningTokens,
    #[serde(default)]
    pub force_overwrite_seeded_files: bool,
}

/// Outcome of a provisioning run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisioningResult {
    pub mode: ProvisioningMode,
    pub template_key: String,
    pub template_hash: String,
    pub expected_items: Vec<PlanItem>,
    /// Items newly created by this invocation only.
    pub created_items: Vec<String>,
    /// Seeded files overwritten by a forced repair.
    pub reseeded_items: Vec<String>,
    pub missing_required: Vec<String>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest_path: Option<PathBuf>,
}

impl ProvisioningResult {
    pub fn success(&self) -> bool {
        self.errors.is_empty() && self.missing_required.is_empty()
    }

    /// One-line summary for logs and job failure reasons.
    pub fn summary(&self) -> String {
        format!(
            "{}: {} expected, {} created, {} missing required, {} errors",
            self.mode,
            self.expected_items.len(),
            self.created_items.len(),
            self.missing_required.len(),
            self.errors.len()
        )
    }
}

/// Manifest written under the admin/control folder after a successful apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderManifest {
    pub template_key: String,
    pub template_hash: String,
    pub tokens: ProvisioningTokens,
    pub expected_items: Vec<PlanItem>,
    pub generated_at: DateTime<Utc>,
}
