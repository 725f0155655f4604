//! Token expansion for template node names.
//!
//! Pure string work: a pattern plus project tokens yields zero or more
//! concrete names. The editor-initials placeholder fans out to one name per
//! distinct initial.

use std::collections::HashSet;

use crate::model::template::ProvisioningTokens;

pub const PROJECT_CODE: &str = "{PROJECT_CODE}";
pub const PROJECT_NAME: &str = "{PROJECT_NAME}";
pub const CLIENT_NAME: &str = "{CLIENT_NAME}";
pub const EDITOR_INITIALS: &str = "{EDITOR_INITIALS}";

/// Stand-in for editor initials on required nodes when none are known, so
/// the folder still exists and is obviously waiting to be renamed.
pub const EDITOR_INITIALS_SENTINEL: &str = "EDITOR INITIALS HERE";

const PATH_HOSTILE: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

/// Expand a node name pattern against `tokens`.
pub fn expand_name(pattern: &str, required: bool, tokens: &ProvisioningTokens) -> Vec<String> {
    let base = pattern
        .replace(PROJECT_CODE, &sanitize_token(&tokens.project_code))
        .replace(PROJECT_NAME, &sanitize_token(&tokens.project_name))
        .replace(
            CLIENT_NAME,
            &sanitize_token(tokens.client_name.as_deref().unwrap_or_default()),
        );

    if !base.contains(EDITOR_INITIALS) {
        return vec![base];
    }

    let initials = distinct_initials(&tokens.editor_initials);
    if initials.is_empty() {
        return if required {
            vec![base.replace(EDITOR_INITIALS, EDITOR_INITIALS_SENTINEL)]
        } else {
            Vec::new()
        };
    }

    initials
        .iter()
        .map(|initial| base.replace(EDITOR_INITIALS, initial))
        .collect()
}

/// Trimmed, sanitized initials with case-insensitive duplicates removed.
/// The first spelling of each initial wins.
pub fn distinct_initials(initials: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    initials
        .iter()
        .map(|initial| sanitize_token(initial))
        .filter(|initial| !initial.is_empty())
        .filter(|initial| seen.insert(initial.to_lowercase()))
        .collect()
}

/// Make a token value safe to splice into a single path segment.
pub fn sanitize_token(value: &str) -> String {
    value
        .trim()
        .chars()
        .map(|c| if PATH_HOSTILE.contains(&c) { '_' } else { c })
        .collect()
}
