//! Plan executor: applies, verifies, or repairs a plan against the filesystem.
//!
//! Every item is create-if-absent, so re-running apply after a crash or a
//! partial failure finishes whatever was left and creates nothing twice.
//! Per-item failures are collected into `errors` and the run carries on.
//! When a directory cannot be created its descendants are skipped (not
//! errored) and picked up by the next apply.

use chrono::Utc;
use opentelemetry::KeyValue;
use std::collections::BTreeMap;
use std::io;
use std::path::{Component, Path};
use tracing::{debug, info, warn};

use super::manifest::{read_manifest, resolve, write_manifest};
use super::policy::FolderPolicy;
use crate::fs::{EntryKind, FileSystem};
use crate::model::provisioning::{ProvisioningMode, ProvisioningResult};
use crate::model::template::{FolderPlan, ItemKind, PlanItem, ProvisioningTokens};
use crate::telemetry::metrics;

/// Everything the executor needs besides the plan itself.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionOptions<'a> {
    pub mode: ProvisioningMode,
    pub base_path: &'a Path,
    pub seeds_path: Option<&'a Path>,
    pub tokens: &'a ProvisioningTokens,
    pub force_overwrite_seeded_files: bool,
}

enum ItemOutcome {
    Created,
    Existing,
    Reseeded,
}

pub fn execute(
    fs: &dyn FileSystem,
    policy: &FolderPolicy,
    plan: &FolderPlan,
    options: ExecutionOptions<'_>,
) -> ProvisioningResult {
    let mut result = ProvisioningResult {
        mode: options.mode,
        template_key: plan.template_key.clone(),
        template_hash: plan.template_hash.clone(),
        expected_items: plan.items.clone(),
        created_items: Vec::new(),
        reseeded_items: Vec::new(),
        missing_required: Vec::new(),
        warnings: Vec::new(),
        errors: Vec::new(),
        manifest_path: None,
    };

    match options.mode {
        ProvisioningMode::Plan => {}
        ProvisioningMode::Verify => {
            check_drift(fs, policy, plan, options.base_path, &mut result);
            collect_missing_required(fs, plan, options.base_path, &mut result);
        }
        ProvisioningMode::Apply | ProvisioningMode::Repair => {
            apply(fs, policy, plan, options, &mut result);
        }
    }

    let mode = options.mode.to_string();
    metrics::provisioning_items().add(
        result.created_items.len() as u64,
        &[
            KeyValue::new("mode", mode.clone()),
            KeyValue::new("outcome", "created"),
        ],
    );
    metrics::provisioning_items().add(
        result.errors.len() as u64,
        &[KeyValue::new("mode", mode), KeyValue::new("outcome", "error")],
    );

    result
}

fn apply(
    fs: &dyn FileSystem,
    policy: &FolderPolicy,
    plan: &FolderPlan,
    options: ExecutionOptions<'_>,
    result: &mut ProvisioningResult,
) {
    let overwrite_seeds =
        options.mode == ProvisioningMode::Repair && options.force_overwrite_seeded_files;
    if options.force_overwrite_seeded_files && options.mode == ProvisioningMode::Apply {
        result
            .warnings
            .push("forceOverwriteSeededFiles is ignored outside repair mode".to_string());
    }
    if options.mode == ProvisioningMode::Repair {
        check_drift(fs, policy, plan, options.base_path, result);
    }

    if let Err(e) = fs.create_dir_all(options.base_path) {
        result.errors.push(format!(
            "base path {}: {e}",
            options.base_path.display()
        ));
        collect_missing_required(fs, plan, options.base_path, result);
        return;
    }

    // failed directory -> number of descendants skipped because of it
    let mut failed_dirs: BTreeMap<String, usize> = BTreeMap::new();

    for item in &plan.items {
        if let Some(skipped) = failed_dirs
            .iter_mut()
            .find(|(dir, _)| is_descendant(&item.relative_path, dir))
            .map(|(_, count)| count)
        {
            *skipped += 1;
            continue;
        }

        match apply_item(fs, item, options, overwrite_seeds) {
            Ok(ItemOutcome::Created) => {
                debug!(path = %item.relative_path, kind = %item.kind, "created");
                result.created_items.push(item.relative_path.clone());
            }
            Ok(ItemOutcome::Reseeded) => {
                debug!(path = %item.relative_path, "reseeded");
                result.reseeded_items.push(item.relative_path.clone());
            }
            Ok(ItemOutcome::Existing) => {}
            Err(e) => {
                warn!(path = %item.relative_path, error = %e, "provisioning item failed");
                result.errors.push(format!("{}: {e}", item.relative_path));
                if item.kind == ItemKind::Dir {
                    failed_dirs.insert(item.relative_path.clone(), 0);
                }
            }
        }
    }

    for (dir, skipped) in failed_dirs.iter().filter(|(_, n)| **n > 0) {
        result.warnings.push(format!(
            "skipped {skipped} item(s) under '{dir}' because it could not be created; re-run to finish"
        ));
    }

    collect_missing_required(fs, plan, options.base_path, result);

    if result.errors.is_empty() {
        match write_manifest(
            fs,
            options.base_path,
            policy,
            plan,
            options.tokens,
            Utc::now(),
        ) {
            Ok(path) => {
                info!(
                    manifest = %path.display(),
                    created = result.created_items.len(),
                    "provisioning applied"
                );
                result.manifest_path = Some(path);
            }
            Err(e) => result
                .errors
                .push(format!("{}: {e}", policy.manifest_relative_path())),
        }
    } else {
        result.warnings.push(format!(
            "manifest not written: {} item error(s)",
            result.errors.len()
        ));
    }
}

fn apply_item(
    fs: &dyn FileSystem,
    item: &PlanItem,
    options: ExecutionOptions<'_>,
    overwrite_seeds: bool,
) -> io::Result<ItemOutcome> {
    let path = resolve(options.base_path, &item.relative_path);
    let existing = fs.entry_kind(&path)?;

    match (item.kind, existing) {
        (ItemKind::Dir, Some(EntryKind::Dir)) => Ok(ItemOutcome::Existing),
        (ItemKind::Dir, Some(_)) => Err(io::Error::other(
            "expected a directory but something else is there",
        )),
        (ItemKind::Dir, None) => match fs.create_dir(&path) {
            Ok(()) => Ok(ItemOutcome::Created),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(ItemOutcome::Existing),
            Err(e) => Err(e),
        },
        (ItemKind::File, Some(EntryKind::File)) => {
            if overwrite_seeds && let Some(seed_key) = &item.seed_key {
                let contents = read_seed(fs, options.seeds_path, seed_key)?;
                fs.write(&path, &contents)?;
                Ok(ItemOutcome::Reseeded)
            } else {
                Ok(ItemOutcome::Existing)
            }
        }
        (ItemKind::File, Some(_)) => Err(io::Error::other(
            "expected a file but something else is there",
        )),
        (ItemKind::File, None) => {
            let contents = match &item.seed_key {
                Some(seed_key) => read_seed(fs, options.seeds_path, seed_key)?,
                None => Vec::new(),
            };
            match fs.create_file(&path, &contents) {
                Ok(()) => Ok(ItemOutcome::Created),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(ItemOutcome::Existing),
                Err(e) => Err(e),
            }
        }
    }
}

fn read_seed(fs: &dyn FileSystem, seeds_path: Option<&Path>, seed_key: &str) -> io::Result<Vec<u8>> {
    let seeds_path = seeds_path.ok_or_else(|| {
        io::Error::other(format!("seed '{seed_key}' requested but no seeds path was given"))
    })?;
    let escapes = Path::new(seed_key)
        .components()
        .any(|c| !matches!(c, Component::Normal(_)));
    if escapes {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("seed key '{seed_key}' must be a plain relative path"),
        ));
    }
    fs.read(&resolve(seeds_path, seed_key))
        .map_err(|e| io::Error::new(e.kind(), format!("seed '{seed_key}': {e}")))
}

fn collect_missing_required(
    fs: &dyn FileSystem,
    plan: &FolderPlan,
    base_path: &Path,
    result: &mut ProvisioningResult,
) {
    for item in plan.items.iter().filter(|item| item.required) {
        let path = resolve(base_path, &item.relative_path);
        let present = match (item.kind, fs.entry_kind(&path)) {
            (ItemKind::Dir, Ok(Some(EntryKind::Dir))) => true,
            (ItemKind::File, Ok(Some(EntryKind::File))) => true,
            (_, Ok(_)) => false,
            (_, Err(e)) => {
                result
                    .warnings
                    .push(format!("{}: cannot inspect: {e}", item.relative_path));
                false
            }
        };
        if !present {
            result.missing_required.push(item.relative_path.clone());
        }
    }
}

fn check_drift(
    fs: &dyn FileSystem,
    policy: &FolderPolicy,
    plan: &FolderPlan,
    base_path: &Path,
    result: &mut ProvisioningResult,
) {
    match read_manifest(fs, base_path, policy) {
        Ok(Some(manifest)) if manifest.template_hash != plan.template_hash => {
            result.warnings.push(format!(
                "template drift: manifest records {} ({}), current template is {}",
                manifest.template_hash, manifest.template_key, plan.template_hash
            ));
        }
        Ok(_) => {}
        Err(e) => result.warnings.push(format!("manifest unreadable: {e}")),
    }
}

fn is_descendant(path: &str, dir: &str) -> bool {
    path.len() > dir.len() && path.starts_with(dir) && path.as_bytes()[dir.len()] == b'/'
}
