//! Folder manifest read/write.

use chrono::{DateTime, Utc};
use std::io;
use std::path::{Path, PathBuf};

use super::policy::FolderPolicy;
use crate::error::{Error, Result};
use crate::fs::FileSystem;
use crate::model::provisioning::FolderManifest;
use crate::model::template::{FolderPlan, ProvisioningTokens};

/// Join a `/`-separated relative path onto `base`.
pub fn resolve(base: &Path, relative: &str) -> PathBuf {
    relative
        .split('/')
        .filter(|segment| !segment.is_empty())
        .fold(base.to_path_buf(), |path, segment| path.join(segment))
}

pub fn manifest_path(base_path: &Path, policy: &FolderPolicy) -> PathBuf {
    resolve(base_path, &policy.manifest_relative_path())
}

/// Write the manifest through a temp file and rename, so readers never see
/// a half-written manifest.
pub fn write_manifest(
    fs: &dyn FileSystem,
    base_path: &Path,
    policy: &FolderPolicy,
    plan: &FolderPlan,
    tokens: &ProvisioningTokens,
    generated_at: DateTime<Utc>,
) -> io::Result<PathBuf> {
    let manifest = FolderManifest {
        template_key: plan.template_key.clone(),
        template_hash: plan.template_hash.clone(),
        tokens: tokens.clone(),
        expected_items: plan.items.clone(),
        generated_at,
    };
    let bytes = serde_json::to_vec_pretty(&manifest)?;

    let path = manifest_path(base_path, policy);
    if let Some(parent) = path.parent() {
        fs.create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    fs.write(&tmp, &bytes)?;
    fs.rename(&tmp, &path)?;
    Ok(path)
}

/// Read an existing manifest. `Ok(None)` when there is none yet.
pub fn read_manifest(
    fs: &dyn FileSystem,
    base_path: &Path,
    policy: &FolderPolicy,
) -> Result<Option<FolderManifest>> {
    let path = manifest_path(base_path, policy);
    if !fs.exists(&path)? {
        return Ok(None);
    }
    let bytes = fs.read(&path)?;
    let manifest = serde_json::from_slice(&bytes)
        .map_err(|e| Error::Other(format!("unreadable manifest {}: {e}", path.display())))?;
    Ok(Some(manifest))
}
