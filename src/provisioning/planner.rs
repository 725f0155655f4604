//! Template planner: template + tokens → validated list of plan items.
//!
//! Planning never touches the filesystem and is fail-closed: the first
//! policy violation aborts with an error and no partial plan.

use std::collections::HashSet;

use super::policy::FolderPolicy;
use super::template::LoadedTemplate;
use super::tokens::expand_name;
use crate::error::{Error, Result};
use crate::model::template::{FolderPlan, PlanItem, ProvisioningTokens, TemplateNode};

pub fn plan(
    template: &LoadedTemplate,
    tokens: &ProvisioningTokens,
    policy: &FolderPolicy,
) -> Result<FolderPlan> {
    let mut planner = Planner {
        tokens,
        policy,
        items: Vec::new(),
        seen: HashSet::new(),
    };
    let mut ancestors = Vec::new();
    for node in &template.template.root.children {
        planner.walk(node, &mut ancestors)?;
    }

    Ok(FolderPlan {
        template_key: template.template.template_key.clone(),
        template_hash: template.hash.clone(),
        items: planner.items,
    })
}

struct Planner<'a> {
    tokens: &'a ProvisioningTokens,
    policy: &'a FolderPolicy,
    items: Vec<PlanItem>,
    /// Lowercased paths, so case-only collisions are caught too.
    seen: HashSet<String>,
}

impl Planner<'_> {
    fn walk(&mut self, node: &TemplateNode, ancestors: &mut Vec<String>) -> Result<()> {
        for expanded in expand_name(&node.name, node.required, self.tokens) {
            let name = expanded.trim().to_string();
            self.policy.check_name(&name, ancestors)?;

            let relative_path = if ancestors.is_empty() {
                name.clone()
            } else {
                format!("{}/{name}", ancestors.join("/"))
            };
            if !self.seen.insert(relative_path.to_lowercase()) {
                return Err(Error::Policy(format!(
                    "template expands to '{relative_path}' more than once"
                )));
            }

            self.items.push(PlanItem {
                relative_path,
                kind: node.resolved_kind(),
                required: node.required,
                seed_key: node.seed_key.clone(),
            });

            ancestors.push(name);
            for child in &node.children {
                self.walk(child, ancestors)?;
            }
            ancestors.pop();
        }
        Ok(())
    }
}
