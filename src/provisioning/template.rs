//! Template loading, structural validation, and content hashing.

use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::path::Path;

use crate::error::{Error, Result};
use crate::fs::FileSystem;
use crate::model::template::{FolderTemplate, ItemKind, TemplateNode};

/// A template together with its content hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedTemplate {
    pub template: FolderTemplate,
    pub hash: String,
}

impl LoadedTemplate {
    pub fn new(template: FolderTemplate) -> Result<Self> {
        validate_structure(&template)?;
        let hash = template_hash(&template)?;
        Ok(Self { template, hash })
    }
}

/// Pre-validation rules applied to the raw template JSON.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateSchema {
    /// Keys every node object must spell out explicitly.
    #[serde(default)]
    pub required_node_keys: Vec<String>,
    #[serde(default)]
    pub max_depth: Option<usize>,
}

/// Read a template file, optionally pre-validating it against a schema file.
pub fn load_template(
    fs: &dyn FileSystem,
    template_path: &Path,
    schema_path: Option<&Path>,
) -> Result<LoadedTemplate> {
    let bytes = fs.read(template_path).map_err(|e| {
        Error::Template(format!("cannot read template {}: {e}", template_path.display()))
    })?;
    let raw: serde_json::Value = serde_json::from_slice(&bytes).map_err(|e| {
        Error::Template(format!("template {} is not valid JSON: {e}", template_path.display()))
    })?;

    if let Some(schema_path) = schema_path {
        let schema_bytes = fs.read(schema_path).map_err(|e| {
            Error::Template(format!("cannot read schema {}: {e}", schema_path.display()))
        })?;
        let schema: TemplateSchema = serde_json::from_slice(&schema_bytes).map_err(|e| {
            Error::Template(format!("bad template schema {}: {e}", schema_path.display()))
        })?;
        check_against_schema(&raw, &schema)?;
    }

    let template: FolderTemplate = serde_json::from_value(raw).map_err(|e| {
        Error::Template(format!("template {} does not decode: {e}", template_path.display()))
    })?;
    LoadedTemplate::new(template)
}

/// `sha256:<hex>` over the canonical serialization, so whitespace and key
/// order in the source file do not count as drift.
pub fn template_hash(template: &FolderTemplate) -> Result<String> {
    let canonical = serde_json::to_vec(template)?;
    Ok(format!("sha256:{}", hex::encode(Sha256::digest(&canonical))))
}

pub fn validate_structure(template: &FolderTemplate) -> Result<()> {
    if template.template_key.trim().is_empty() {
        return Err(Error::Template("templateKey must not be empty".into()));
    }
    if template.root.children.is_empty() {
        return Err(Error::Template(format!(
            "template '{}' has no top-level folders",
            template.template_key
        )));
    }
    for child in &template.root.children {
        validate_node(child, &template.template_key)?;
    }
    Ok(())
}

fn validate_node(node: &TemplateNode, template_key: &str) -> Result<()> {
    if node.name.trim().is_empty() {
        return Err(Error::Template(format!(
            "template '{template_key}' contains a node with an empty name"
        )));
    }
    if node.resolved_kind() == ItemKind::File && !node.children.is_empty() {
        return Err(Error::Template(format!(
            "file node '{}' cannot have children",
            node.name
        )));
    }
    if node.seed_key.is_some() && node.resolved_kind() == ItemKind::Dir {
        return Err(Error::Template(format!(
            "directory node '{}' cannot carry a seedKey",
            node.name
        )));
    }
    for child in &node.children {
        validate_node(child, template_key)?;
    }
    Ok(())
}

fn check_against_schema(raw: &serde_json::Value, schema: &TemplateSchema) -> Result<()> {
    let root = raw
        .get("root")
        .ok_or_else(|| Error::Template("template has no 'root' node".into()))?;
    let children = root
        .get("children")
        .and_then(|c| c.as_array())
        .cloned()
        .unwrap_or_default();

    let mut pending: Vec<(serde_json::Value, usize)> =
        children.into_iter().map(|node| (node, 1)).collect();
    while let Some((node, depth)) = pending.pop() {
        let object = node
            .as_object()
            .ok_or_else(|| Error::Template("template node is not an object".into()))?;
        let name = object.get("name").and_then(|n| n.as_str()).unwrap_or("<unnamed>");

        for key in &schema.required_node_keys {
            if !object.contains_key(key) {
                return Err(Error::Template(format!(
                    "node '{name}' is missing required key '{key}'"
                )));
            }
        }
        if let Some(max_depth) = schema.max_depth
            && depth > max_depth
        {
            return Err(Error::Template(format!(
                "node '{name}' is nested {depth} levels deep (max {max_depth})"
            )));
        }
        if let Some(children) = object.get("children").and_then(|c| c.as_array()) {
            pending.extend(children.iter().cloned().map(|child| (child, depth + 1)));
        }
    }
    Ok(())
}
