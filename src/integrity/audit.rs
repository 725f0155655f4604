//! Root audit, quarantine planning and move execution.
//!
//! All functions here are blocking and operate on one root directory.
//! Entry names are compared case-insensitively, the way the storage
//! providers treat them.

use opentelemetry::KeyValue;
use std::collections::HashSet;
use std::io;
use std::path::{Component, Path};
use tracing::{debug, warn};

use crate::fs::{EntryKind, EntrySize, FileSystem};
use crate::model::contract::{
    GuardrailBlock, GuardrailReason, IntegrityAction, QuarantineMove, RootIntegrityResult,
    StorageRootContract,
};
use crate::provisioning::manifest::resolve;
use crate::telemetry::metrics;

pub const DEFAULT_QUARANTINE_RELPATH: &str = "_quarantine";

/// Effective quarantine settings: request overrides win over the contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuarantineSettings {
    pub relpath: String,
    pub max_items: Option<u64>,
    pub max_bytes: Option<u64>,
}

impl QuarantineSettings {
    pub fn resolve(
        contract: &StorageRootContract,
        relpath: Option<&str>,
        max_items: Option<u64>,
        max_bytes: Option<u64>,
    ) -> Result<Self, String> {
        let relpath = relpath
            .or(contract.quarantine_relpath.as_deref())
            .map(|p| p.trim().trim_matches('/').to_string())
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| DEFAULT_QUARANTINE_RELPATH.to_string());

        let plain = Path::new(&relpath)
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if !plain {
            return Err(format!(
                "quarantine path '{relpath}' must be relative to the root and may not contain '..'"
            ));
        }

        Ok(Self {
            relpath,
            max_items: max_items.or(contract.max_items),
            max_bytes: max_bytes.or(contract.max_bytes),
        })
    }

    /// First path segment; the entry that holds quarantine at the root.
    pub fn top_entry(&self) -> &str {
        self.relpath.split('/').next().unwrap_or(&self.relpath)
    }
}

/// Fill `missing_required` and `unknown_entries` from the root listing.
pub fn audit_root(
    fs: &dyn FileSystem,
    root: &Path,
    contract: &StorageRootContract,
    settings: &QuarantineSettings,
    result: &mut RootIntegrityResult,
) -> io::Result<()> {
    let entries = fs.list_dir(root)?;

    let present_dirs: HashSet<String> = entries
        .iter()
        .filter(|e| e.kind == EntryKind::Dir)
        .map(|e| e.name.to_lowercase())
        .collect();
    result.missing_required = contract
        .required_folders
        .iter()
        .filter(|name| !present_dirs.contains(&normalize(name)))
        .cloned()
        .collect();

    let known: HashSet<String> = contract
        .required_folders
        .iter()
        .chain(&contract.optional_folders)
        .chain(&contract.allowed_extras)
        .chain(&contract.allowed_root_files)
        .map(|name| normalize(name))
        .chain(std::iter::once(settings.top_entry().to_lowercase()))
        .collect();
    result.unknown_entries = entries
        .into_iter()
        .filter(|e| !known.contains(&e.name.to_lowercase()))
        .map(|e| e.name)
        .collect();

    Ok(())
}

/// Measure each unknown entry and either plan its move or block it.
///
/// A move is withheld when its size cannot be measured or exceeds a limit.
/// Unmeasurable entries are blocked even when no limit is configured.
pub fn plan_quarantine(
    fs: &dyn FileSystem,
    root: &Path,
    settings: &QuarantineSettings,
    result: &mut RootIntegrityResult,
) {
    let mut planned: HashSet<String> = HashSet::new();

    for entry in result.unknown_entries.clone() {
        let source = resolve(root, &entry);
        let size = match fs.measure(&source, settings.max_items) {
            Ok(size) => size,
            Err(e) => {
                block(result, &entry, GuardrailReason::UnknownSize, format!("size could not be measured: {e}"));
                continue;
            }
        };

        if let Some(detail) = over_limit(size, settings) {
            block(result, &entry, GuardrailReason::OverLimit, detail);
            continue;
        }

        let destination = match free_destination(fs, root, &settings.relpath, &entry, &planned) {
            Ok(destination) => destination,
            Err(e) => {
                result.errors.push(format!("{entry}: {e}"));
                continue;
            }
        };
        planned.insert(destination.to_lowercase());
        result.quarantine_plan.push(QuarantineMove {
            entry: entry.clone(),
            source: entry,
            destination,
            size: Some(size),
        });
    }
}

/// Execute the planned moves in order. Destinations are re-checked at move
/// time, so a name taken since planning gets the next free suffix.
pub fn execute_moves(
    fs: &dyn FileSystem,
    root: &Path,
    settings: &QuarantineSettings,
    result: &mut RootIntegrityResult,
) {
    if result.quarantine_plan.is_empty() {
        return;
    }
    if let Err(e) = fs.create_dir_all(&resolve(root, &settings.relpath)) {
        result
            .errors
            .push(format!("{}: cannot create quarantine folder: {e}", settings.relpath));
        return;
    }

    let mut used: HashSet<String> = HashSet::new();
    for planned in result.quarantine_plan.clone() {
        let outcome = move_entry(fs, root, settings, &planned, &used);
        match outcome {
            Ok(destination) => {
                debug!(source = %planned.source, destination = %destination, "quarantined");
                used.insert(destination.to_lowercase());
                result.actions.push(IntegrityAction {
                    action: "quarantine_move".to_string(),
                    source: planned.source,
                    destination,
                });
                metrics::integrity_moves().add(1, &[KeyValue::new("outcome", "moved")]);
            }
            Err(e) => {
                warn!(source = %planned.source, error = %e, "quarantine move failed");
                result.errors.push(format!("{}: {e}", planned.entry));
                metrics::integrity_moves().add(1, &[KeyValue::new("outcome", "error")]);
            }
        }
    }
}

fn move_entry(
    fs: &dyn FileSystem,
    root: &Path,
    settings: &QuarantineSettings,
    planned: &QuarantineMove,
    used: &HashSet<String>,
) -> io::Result<String> {
    let source = resolve(root, &planned.source);
    if fs.entry_kind(&source)?.is_none() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            "entry disappeared before it could be moved",
        ));
    }

    let destination = if fs.entry_kind(&resolve(root, &planned.destination))?.is_none()
        && !used.contains(&planned.destination.to_lowercase())
    {
        planned.destination.clone()
    } else {
        free_destination(fs, root, &settings.relpath, &planned.entry, used)?
    };

    fs.rename(&source, &resolve(root, &destination))?;
    Ok(destination)
}

/// `{relpath}/{name}`, or `{name}__2`, `{name}__3` … when taken on disk or
/// by an earlier move in the same run.
fn free_destination(
    fs: &dyn FileSystem,
    root: &Path,
    relpath: &str,
    name: &str,
    taken: &HashSet<String>,
) -> io::Result<String> {
    let mut candidate = format!("{relpath}/{name}");
    let mut n = 1u32;
    while taken.contains(&candidate.to_lowercase())
        || fs.entry_kind(&resolve(root, &candidate))?.is_some()
    {
        n += 1;
        candidate = format!("{relpath}/{name}__{n}");
    }
    Ok(candidate)
}

fn over_limit(size: EntrySize, settings: &QuarantineSettings) -> Option<String> {
    if let Some(max) = settings.max_items
        && size.items > max
    {
        return Some(format!("{} item(s) exceeds maxItems {max}", size.items));
    }
    if let Some(max) = settings.max_bytes
        && size.bytes > max
    {
        return Some(format!("{} byte(s) exceeds maxBytes {max}", size.bytes));
    }
    None
}

fn block(result: &mut RootIntegrityResult, entry: &str, reason: GuardrailReason, detail: String) {
    debug!(entry, %reason, %detail, "quarantine move blocked");
    metrics::integrity_moves().add(1, &[KeyValue::new("outcome", "blocked")]);
    result.guardrail_blocks.push(GuardrailBlock {
        entry: entry.to_string(),
        reason,
        detail,
    });
}

fn normalize(name: &str) -> String {
    name.trim().trim_matches('/').to_lowercase()
}
