//! Folder template types.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Template
// ---------------------------------------------------------------------------

/// Declarative tree of folders and files to provision for a project.
///
/// The root node is a container; its children are the top-level folders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderTemplate {
    pub template_key: String,
    pub root: TemplateNode,
}

/// One node of a template. `name` is a pattern that may contain token
/// placeholders such as `{PROJECT_CODE}` or `{EDITOR_INITIALS}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateNode {
    pub name: String,

    #[serde(default)]
    pub children: Vec<TemplateNode>,

    #[serde(default = "default_required")]
    pub required: bool,

    /// Key into the seeds source. Seeded nodes are files.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed_key: Option<String>,

    /// Explicit kind. When absent, seeded nodes are files and the rest are dirs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ItemKind>,
}

fn default_required() -> bool {
    true
}

impl TemplateNode {
    /// A required directory node.
    pub fn dir(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            children: Vec::new(),
            required: true,
            seed_key: None,
            kind: None,
        }
    }

    /// A required file node seeded from `seed_key`.
    pub fn seeded_file(name: impl Into<String>, seed_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            children: Vec::new(),
            required: true,
            seed_key: Some(seed_key.into()),
            kind: Some(ItemKind::File),
        }
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn child(mut self, node: TemplateNode) -> Self {
        self.children.push(node);
        self
    }

    pub fn resolved_kind(&self) -> ItemKind {
        match (self.kind, &self.seed_key) {
            (Some(kind), _) => kind,
            (None, Some(_)) => ItemKind::File,
            (None, None) => ItemKind::Dir,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    File,
    Dir,
}

impl std::fmt::Display for ItemKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ItemKind::File => write!(f, "file"),
            ItemKind::Dir => write!(f, "dir"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tokens
// ---------------------------------------------------------------------------

/// Project identity values substituted into node name patterns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisioningTokens {
    pub project_code: String,
    pub project_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
    #[serde(default)]
    pub editor_initials: Vec<String>,
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// A concrete, validated filesystem item. `relative_path` uses `/` separators
/// and is relative to the provisioning base path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanItem {
    pub relative_path: String,
    pub kind: ItemKind,
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed_key: Option<String>,
}

/// Output of the planner: the template identity plus every expected item,
/// parents always listed before their children.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderPlan {
    pub template_key: String,
    pub template_hash: String,
    pub items: Vec<PlanItem>,
}
