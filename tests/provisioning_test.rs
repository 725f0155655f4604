//! Folder provisioning: token expansion, planning policy, and the executor
//! against a real temp directory.

use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::json;
use studio_ops::Error;
use studio_ops::fs::{DirEntry, EntryKind, EntrySize, FileSystem, LocalFs};
use studio_ops::model::provisioning::{ProvisioningMode, ProvisioningRequest};
use studio_ops::model::template::{FolderTemplate, ProvisioningTokens, TemplateNode};
use studio_ops::provisioning::Provisioner;
use studio_ops::provisioning::planner;
use studio_ops::provisioning::policy::FolderPolicy;
use studio_ops::provisioning::template::LoadedTemplate;
use studio_ops::provisioning::tokens::{EDITOR_INITIALS_SENTINEL, expand_name};
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn tokens() -> ProvisioningTokens {
    ProvisioningTokens {
        project_code: "P1234".into(),
        project_name: "Night Shift".into(),
        client_name: Some("Acme".into()),
        editor_initials: vec!["EC".into(), "MM".into()],
    }
}

fn feature_template() -> serde_json::Value {
    json!({
        "templateKey": "feature-v1",
        "root": {
            "name": "root",
            "children": [
                {
                    "name": "00_ADMIN",
                    "children": [
                        { "name": "_ops" },
                        { "name": "README.txt", "seedKey": "readme.txt" }
                    ]
                },
                {
                    "name": "01_FOOTAGE",
                    "children": [
                        { "name": "{PROJECT_CODE}_RAW" },
                        { "name": "PROXIES", "required": false }
                    ]
                },
                {
                    "name": "02_EDIT",
                    "children": [
                        { "name": "{EDITOR_INITIALS}_CUTS" }
                    ]
                }
            ]
        }
    })
}

struct Workspace {
    _dir: TempDir,
    template_path: PathBuf,
    seeds_path: PathBuf,
    base_path: PathBuf,
}

fn workspace(template: serde_json::Value) -> Workspace {
    let dir = TempDir::new().unwrap();
    let template_path = dir.path().join("template.json");
    std::fs::write(&template_path, serde_json::to_vec_pretty(&template).unwrap()).unwrap();
    let seeds_path = dir.path().join("seeds");
    std::fs::create_dir(&seeds_path).unwrap();
    std::fs::write(seeds_path.join("readme.txt"), b"project readme v1").unwrap();
    let base_path = dir.path().join("projects").join("P1234");
    Workspace {
        template_path,
        seeds_path,
        base_path,
        _dir: dir,
    }
}

fn request(ws: &Workspace, mode: ProvisioningMode) -> ProvisioningRequest {
    ProvisioningRequest {
        mode,
        template_path: ws.template_path.clone(),
        base_path: ws.base_path.clone(),
        schema_path: None,
        seeds_path: Some(ws.seeds_path.clone()),
        tokens: tokens(),
        force_overwrite_seeded_files: false,
    }
}

fn provisioner() -> Provisioner {
    Provisioner::new(Arc::new(LocalFs::new()), FolderPolicy::default())
}

/// Every path under `root`, relative, for before/after comparisons.
fn snapshot(root: &Path) -> BTreeSet<PathBuf> {
    let mut seen = BTreeSet::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries {
            let path = entry.unwrap().path();
            seen.insert(path.strip_prefix(root).unwrap().to_path_buf());
            if path.is_dir() {
                pending.push(path);
            }
        }
    }
    seen
}

fn plan_for(template: FolderTemplate) -> studio_ops::Result<studio_ops::model::template::FolderPlan> {
    let loaded = LoadedTemplate::new(template)?;
    planner::plan(&loaded, &tokens(), &FolderPolicy::default())
}

fn template_of(children: Vec<TemplateNode>) -> FolderTemplate {
    FolderTemplate {
        template_key: "t".into(),
        root: TemplateNode {
            children,
            ..TemplateNode::dir("root")
        },
    }
}

// ---------------------------------------------------------------------------
// Tokens
// ---------------------------------------------------------------------------

#[test]
fn editor_initials_fan_out_one_name_per_initial() {
    let names = expand_name("{EDITOR_INITIALS}_CUTS", true, &tokens());
    assert_eq!(names, vec!["EC_CUTS", "MM_CUTS"]);
}

#[test]
fn required_editor_node_without_initials_gets_sentinel() {
    let tokens = ProvisioningTokens {
        editor_initials: vec![],
        ..tokens()
    };
    let names = expand_name("{EDITOR_INITIALS}_CUTS", true, &tokens);
    assert_eq!(names.len(), 1);
    assert!(names[0].contains(EDITOR_INITIALS_SENTINEL));
}

#[test]
fn optional_editor_node_without_initials_expands_to_nothing() {
    let tokens = ProvisioningTokens {
        editor_initials: vec![],
        ..tokens()
    };
    assert!(expand_name("{EDITOR_INITIALS}_CUTS", false, &tokens).is_empty());
}

#[test]
fn duplicate_initials_collapse_and_hostile_characters_are_replaced() {
    let tokens = ProvisioningTokens {
        project_code: "P/12:34".into(),
        editor_initials: vec!["EC".into(), " ec ".into(), "".into(), "MM".into()],
        ..tokens()
    };
    assert_eq!(
        expand_name("{EDITOR_INITIALS}", true, &tokens),
        vec!["EC", "MM"]
    );
    assert_eq!(expand_name("{PROJECT_CODE}_RAW", true, &tokens), vec!["P_12_34_RAW"]);
}

// ---------------------------------------------------------------------------
// Planning policy
// ---------------------------------------------------------------------------

#[test]
fn top_level_name_without_numeric_prefix_fails_planning() {
    let err = plan_for(template_of(vec![TemplateNode::dir("FOOTAGE")])).unwrap_err();
    assert!(matches!(err, Error::Policy(_)));
    assert!(err.to_string().contains("top-level"), "{err}");
}

#[test]
fn control_folder_outside_admin_fails_planning() {
    let err = plan_for(template_of(vec![
        TemplateNode::dir("01_FOOTAGE").child(TemplateNode::dir("_ops")),
    ]))
    .unwrap_err();
    assert!(matches!(err, Error::Policy(_)));
    assert!(err.to_string().contains("_ops"), "{err}");
}

#[test]
fn control_folder_nested_deeper_under_admin_fails_planning() {
    let err = plan_for(template_of(vec![
        TemplateNode::dir("00_ADMIN").child(TemplateNode::dir("DOCS").child(TemplateNode::dir("_ops"))),
    ]))
    .unwrap_err();
    assert!(err.to_string().contains("_ops"), "{err}");
}

#[test]
fn control_folder_directly_under_admin_is_allowed() {
    let plan = plan_for(template_of(vec![
        TemplateNode::dir("00_ADMIN").child(TemplateNode::dir("_ops")),
    ]))
    .unwrap();
    let paths: Vec<_> = plan.items.iter().map(|i| i.relative_path.as_str()).collect();
    assert_eq!(paths, vec!["00_ADMIN", "00_ADMIN/_ops"]);
}

#[test]
fn two_nodes_expanding_to_the_same_path_fail_planning() {
    let err = plan_for(template_of(vec![
        TemplateNode::dir("01_EDIT"),
        TemplateNode::dir("01_edit"),
    ]))
    .unwrap_err();
    assert!(err.to_string().contains("more than once"), "{err}");
}

#[test]
fn plan_lists_parents_before_children_with_expanded_names() {
    let ws = workspace(feature_template());
    let plan = provisioner().plan(&request(&ws, ProvisioningMode::Plan)).unwrap();
    let paths: Vec<_> = plan.items.iter().map(|i| i.relative_path.as_str()).collect();
    assert_eq!(
        paths,
        vec![
            "00_ADMIN",
            "00_ADMIN/_ops",
            "00_ADMIN/README.txt",
            "01_FOOTAGE",
            "01_FOOTAGE/P1234_RAW",
            "01_FOOTAGE/PROXIES",
            "02_EDIT",
            "02_EDIT/EC_CUTS",
            "02_EDIT/MM_CUTS",
        ]
    );
    assert!(plan.template_hash.starts_with("sha256:"));
}

#[test]
fn schema_rejects_nodes_missing_required_keys() {
    let ws = workspace(feature_template());
    let schema_path = ws.template_path.with_file_name("schema.json");
    std::fs::write(&schema_path, r#"{"requiredNodeKeys": ["name", "required"]}"#).unwrap();

    let mut req = request(&ws, ProvisioningMode::Plan);
    req.schema_path = Some(schema_path);
    let err = provisioner().plan(&req).unwrap_err();
    assert!(matches!(err, Error::Template(_)));
    assert!(err.to_string().contains("required"), "{err}");
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

#[test]
fn plan_mode_does_not_touch_the_filesystem() {
    let ws = workspace(feature_template());
    let result = provisioner().run(&request(&ws, ProvisioningMode::Plan)).unwrap();
    assert_eq!(result.expected_items.len(), 9);
    assert!(result.created_items.is_empty());
    assert!(!ws.base_path.exists());
}

#[test]
fn apply_twice_creates_nothing_the_second_time() {
    let ws = workspace(feature_template());
    let p = provisioner();

    let first = p.run(&request(&ws, ProvisioningMode::Apply)).unwrap();
    assert!(first.success(), "{:?}", first.errors);
    assert_eq!(first.created_items.len(), 9);
    assert!(ws.base_path.join("02_EDIT").join("MM_CUTS").is_dir());
    assert_eq!(
        std::fs::read(ws.base_path.join("00_ADMIN").join("README.txt")).unwrap(),
        b"project readme v1"
    );

    let second = p.run(&request(&ws, ProvisioningMode::Apply)).unwrap();
    assert!(second.success(), "{:?}", second.errors);
    assert!(second.created_items.is_empty());
}

#[test]
fn apply_writes_manifest_with_template_identity() {
    let ws = workspace(feature_template());
    let result = provisioner().run(&request(&ws, ProvisioningMode::Apply)).unwrap();

    let manifest_path = ws
        .base_path
        .join("00_ADMIN/_ops/manifest/folder_manifest.json");
    assert_eq!(result.manifest_path.as_deref(), Some(manifest_path.as_path()));

    let manifest: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&manifest_path).unwrap()).unwrap();
    assert_eq!(manifest["templateKey"], "feature-v1");
    assert_eq!(manifest["templateHash"], json!(result.template_hash));
    assert_eq!(manifest["tokens"]["projectCode"], "P1234");
    assert_eq!(manifest["expectedItems"].as_array().unwrap().len(), 9);
    assert!(manifest["generatedAt"].is_string());
}

#[test]
fn apply_leaves_existing_content_alone() {
    let ws = workspace(feature_template());
    let admin = ws.base_path.join("00_ADMIN");
    std::fs::create_dir_all(&admin).unwrap();
    std::fs::write(admin.join("README.txt"), b"edited by producer").unwrap();

    let result = provisioner().run(&request(&ws, ProvisioningMode::Apply)).unwrap();
    assert!(result.success(), "{:?}", result.errors);
    assert!(!result.created_items.contains(&"00_ADMIN".to_string()));
    assert!(!result.created_items.contains(&"00_ADMIN/README.txt".to_string()));
    assert_eq!(std::fs::read(admin.join("README.txt")).unwrap(), b"edited by producer");
}

#[test]
fn verify_reports_missing_required_and_changes_nothing() {
    let ws = workspace(feature_template());
    let p = provisioner();
    p.run(&request(&ws, ProvisioningMode::Apply)).unwrap();
    std::fs::remove_dir(ws.base_path.join("01_FOOTAGE/P1234_RAW")).unwrap();
    std::fs::remove_dir(ws.base_path.join("01_FOOTAGE/PROXIES")).unwrap();

    let before = snapshot(&ws.base_path);
    let result = p.run(&request(&ws, ProvisioningMode::Verify)).unwrap();
    let after = snapshot(&ws.base_path);

    assert_eq!(before, after);
    assert_eq!(result.missing_required, vec!["01_FOOTAGE/P1234_RAW"]);
    assert!(result.created_items.is_empty());
    assert!(!result.success());
}

#[test]
fn verify_warns_when_template_changed_since_manifest() {
    let ws = workspace(feature_template());
    let p = provisioner();
    p.run(&request(&ws, ProvisioningMode::Apply)).unwrap();

    let mut changed = feature_template();
    changed["root"]["children"][2]["children"][0]["name"] = json!("{EDITOR_INITIALS}_SELECTS");
    std::fs::write(&ws.template_path, serde_json::to_vec(&changed).unwrap()).unwrap();

    let result = p.run(&request(&ws, ProvisioningMode::Verify)).unwrap();
    assert!(
        result.warnings.iter().any(|w| w.contains("template drift")),
        "{:?}",
        result.warnings
    );
}

#[test]
fn forced_repair_reseeds_files_but_apply_does_not() {
    let ws = workspace(feature_template());
    let p = provisioner();
    p.run(&request(&ws, ProvisioningMode::Apply)).unwrap();
    std::fs::write(ws.seeds_path.join("readme.txt"), b"project readme v2").unwrap();
    let readme = ws.base_path.join("00_ADMIN/README.txt");

    let mut forced_apply = request(&ws, ProvisioningMode::Apply);
    forced_apply.force_overwrite_seeded_files = true;
    let result = p.run(&forced_apply).unwrap();
    assert!(result.reseeded_items.is_empty());
    assert!(result.warnings.iter().any(|w| w.contains("ignored")));
    assert_eq!(std::fs::read(&readme).unwrap(), b"project readme v1");

    let mut forced_repair = request(&ws, ProvisioningMode::Repair);
    forced_repair.force_overwrite_seeded_files = true;
    let result = p.run(&forced_repair).unwrap();
    assert_eq!(result.reseeded_items, vec!["00_ADMIN/README.txt"]);
    assert!(result.created_items.is_empty());
    assert_eq!(std::fs::read(&readme).unwrap(), b"project readme v2");
}

#[test]
fn missing_seed_is_an_item_error_and_blocks_the_manifest() {
    let ws = workspace(feature_template());
    std::fs::remove_file(ws.seeds_path.join("readme.txt")).unwrap();

    let result = provisioner().run(&request(&ws, ProvisioningMode::Apply)).unwrap();
    assert_eq!(result.errors.len(), 1);
    assert!(result.errors[0].starts_with("00_ADMIN/README.txt:"), "{:?}", result.errors);
    // Everything else was still created.
    assert_eq!(result.created_items.len(), 8);
    assert!(result.manifest_path.is_none());
    assert!(result.warnings.iter().any(|w| w.contains("manifest not written")));
}

/// Local disk that refuses to create one directory.
struct RefusingFs {
    inner: LocalFs,
    refuse: PathBuf,
}

impl FileSystem for RefusingFs {
    fn entry_kind(&self, path: &Path) -> io::Result<Option<EntryKind>> {
        self.inner.entry_kind(path)
    }
    fn create_dir(&self, path: &Path) -> io::Result<()> {
        if path == self.refuse {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "access denied"));
        }
        self.inner.create_dir(path)
    }
    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        self.inner.create_dir_all(path)
    }
    fn create_file(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        self.inner.create_file(path, contents)
    }
    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        self.inner.read(path)
    }
    fn write(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        self.inner.write(path, contents)
    }
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        self.inner.rename(from, to)
    }
    fn list_dir(&self, path: &Path) -> io::Result<Vec<DirEntry>> {
        self.inner.list_dir(path)
    }
    fn measure(&self, path: &Path, stop_after_items: Option<u64>) -> io::Result<EntrySize> {
        self.inner.measure(path, stop_after_items)
    }
}

#[test]
fn failed_directory_skips_its_subtree_and_next_apply_finishes() {
    let ws = workspace(feature_template());
    let refusing = Provisioner::new(
        Arc::new(RefusingFs {
            inner: LocalFs::new(),
            refuse: ws.base_path.join("01_FOOTAGE"),
        }),
        FolderPolicy::default(),
    );

    let result = refusing.run(&request(&ws, ProvisioningMode::Apply)).unwrap();
    assert_eq!(result.errors.len(), 1, "{:?}", result.errors);
    assert!(result.errors[0].starts_with("01_FOOTAGE:"));
    assert!(
        result
            .warnings
            .iter()
            .any(|w| w.contains("skipped 2 item(s) under '01_FOOTAGE'")),
        "{:?}",
        result.warnings
    );
    // Siblings after the failure were still created.
    assert!(result.created_items.contains(&"02_EDIT/MM_CUTS".to_string()));
    assert!(result.missing_required.contains(&"01_FOOTAGE".to_string()));
    assert!(result.manifest_path.is_none());
    assert!(!result.success());

    let retry = provisioner().run(&request(&ws, ProvisioningMode::Apply)).unwrap();
    assert!(retry.success(), "{:?}", retry.errors);
    assert_eq!(
        retry.created_items,
        vec!["01_FOOTAGE", "01_FOOTAGE/P1234_RAW", "01_FOOTAGE/PROXIES"]
    );
    assert!(retry.manifest_path.is_some());
}

#[test]
fn wrong_kind_at_a_planned_path_is_an_item_error() {
    let ws = workspace(feature_template());
    std::fs::create_dir_all(&ws.base_path).unwrap();
    std::fs::write(ws.base_path.join("02_EDIT"), b"not a folder").unwrap();

    let result = provisioner().run(&request(&ws, ProvisioningMode::Apply)).unwrap();
    assert!(result.errors.iter().any(|e| e.starts_with("02_EDIT:")), "{:?}", result.errors);
    assert!(result.missing_required.contains(&"02_EDIT".to_string()));
}
