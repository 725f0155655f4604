//! Storage-root contract and integrity result types.

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::fs::EntrySize;

/// Allow-list describing what may live directly under a storage root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageRootContract {
    pub provider_key: String,
    pub root_key: String,
    pub contract_key: String,
    pub required_folders: Vec<String>,
    #[serde(default)]
    pub optional_folders: Vec<String>,
    #[serde(default)]
    pub allowed_extras: Vec<String>,
    #[serde(default)]
    pub allowed_root_files: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quarantine_relpath: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_items: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_bytes: Option<u64>,
    pub is_active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrityMode {
    Report,
    Repair,
}

impl std::fmt::Display for IntegrityMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IntegrityMode::Report => write!(f, "report"),
            IntegrityMode::Repair => write!(f, "repair"),
        }
    }
}

impl std::str::FromStr for IntegrityMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "report" => Ok(IntegrityMode::Report),
            "repair" => Ok(IntegrityMode::Repair),
            other => Err(Error::Payload(format!(
                "invalid integrity mode '{other}' (expected report|repair)"
            ))),
        }
    }
}

/// Root integrity job payload. `mode` stays a string on the wire so that an
/// unknown value can be reported in the result instead of failing decode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RootIntegrityRequest {
    pub provider_key: String,
    pub root_key: String,
    pub mode: String,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quarantine_relpath: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_items: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_bytes: Option<u64>,
}

/// A planned relocation of an unknown root entry into quarantine.
/// Paths are relative to the storage root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuarantineMove {
    pub entry: String,
    pub source: String,
    pub destination: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<EntrySize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardrailReason {
    UnknownSize,
    OverLimit,
}

impl std::fmt::Display for GuardrailReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GuardrailReason::UnknownSize => write!(f, "unknown_size"),
            GuardrailReason::OverLimit => write!(f, "over_limit"),
        }
    }
}

/// A quarantine move withheld by the size guardrail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardrailBlock {
    pub entry: String,
    pub reason: GuardrailReason,
    pub detail: String,
}

/// A move that was actually executed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityAction {
    pub action: String,
    pub source: String,
    pub destination: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RootIntegrityResult {
    pub provider_key: String,
    pub root_key: String,
    /// None when the requested mode string was rejected.
    pub mode: Option<IntegrityMode>,
    pub dry_run: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract_key: Option<String>,
    pub missing_required: Vec<String>,
    pub unknown_entries: Vec<String>,
    pub quarantine_plan: Vec<QuarantineMove>,
    pub guardrail_blocks: Vec<GuardrailBlock>,
    pub actions: Vec<IntegrityAction>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl RootIntegrityResult {
    pub(crate) fn new(request: &RootIntegrityRequest, mode: Option<IntegrityMode>) -> Self {
        Self {
            provider_key: request.provider_key.clone(),
            root_key: request.root_key.clone(),
            mode,
            dry_run: request.dry_run,
            contract_key: None,
            missing_required: Vec::new(),
            unknown_entries: Vec::new(),
            quarantine_plan: Vec::new(),
            guardrail_blocks: Vec::new(),
            actions: Vec::new(),
            warnings: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// False when any error was recorded or a required folder is absent.
    /// Guardrail blocks alone do not fail a run.
    pub fn success(&self) -> bool {
        self.errors.is_empty() && self.missing_required.is_empty()
    }
}
