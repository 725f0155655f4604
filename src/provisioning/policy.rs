//! Folder naming policy.
//!
//! Top-level folders carry a two-digit prefix (`01_FOOTAGE`), and the control
//! folder that holds the manifest may only sit directly under the admin
//! top-level folder.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::LazyLock;

use crate::error::{Error, Result};

static TOP_LEVEL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{2}_.+").expect("top-level pattern is valid"));

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct FolderPolicy {
    /// The designated admin top-level folder.
    pub admin_folder: String,
    /// Control-folder marker. Holds the manifest.
    pub control_folder: String,
}

impl Default for FolderPolicy {
    fn default() -> Self {
        Self {
            admin_folder: "00_ADMIN".to_string(),
            control_folder: "_ops".to_string(),
        }
    }
}

impl FolderPolicy {
    /// Load a policy from a TOML file. Missing keys fall back to defaults.
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read folder policy {}: {e}", path.display()))
        })?;
        let policy: FolderPolicy = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("bad folder policy {}: {e}", path.display())))?;
        policy.validate()?;
        Ok(policy)
    }

    /// The policy must itself satisfy its own naming rules.
    pub fn validate(&self) -> Result<()> {
        if !TOP_LEVEL_RE.is_match(&self.admin_folder) {
            return Err(Error::Config(format!(
                "admin folder '{}' must match the top-level pattern ^\\d{{2}}_.+",
                self.admin_folder
            )));
        }
        if !is_plain_segment(&self.control_folder) {
            return Err(Error::Config(format!(
                "control folder '{}' is not a valid folder name",
                self.control_folder
            )));
        }
        Ok(())
    }

    /// Manifest location relative to the provisioning base path.
    pub fn manifest_relative_path(&self) -> String {
        format!(
            "{}/{}/manifest/folder_manifest.json",
            self.admin_folder, self.control_folder
        )
    }

    pub fn is_control_folder(&self, name: &str) -> bool {
        name.eq_ignore_ascii_case(&self.control_folder)
    }

    /// Validate one expanded name given its expanded ancestors (outermost first).
    pub fn check_name(&self, name: &str, ancestors: &[String]) -> Result<()> {
        let location = if ancestors.is_empty() {
            "<root>".to_string()
        } else {
            ancestors.join("/")
        };

        if !is_plain_segment(name) {
            return Err(Error::Policy(format!(
                "name '{name}' under '{location}' is not a valid single path segment"
            )));
        }

        if ancestors.is_empty() && !TOP_LEVEL_RE.is_match(name) {
            return Err(Error::Policy(format!(
                "top-level folder '{name}' must match ^\\d{{2}}_.+ (for example 01_FOOTAGE)"
            )));
        }

        if self.is_control_folder(name) {
            let under_admin = ancestors.len() == 1
                && ancestors[0].eq_ignore_ascii_case(&self.admin_folder);
            if !under_admin {
                return Err(Error::Policy(format!(
                    "control folder '{}' is only allowed directly under '{}', found under '{location}'",
                    self.control_folder, self.admin_folder
                )));
            }
        }

        Ok(())
    }
}

fn is_plain_segment(name: &str) -> bool {
    !name.trim().is_empty() && name != "." && name != ".." && !name.contains(['/', '\\'])
}
