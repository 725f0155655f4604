//! Storage-root integrity checks against a temp directory, with in-memory
//! contract and lock stores.

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use studio_ops::fs::{DirEntry, EntryKind, EntrySize, FileSystem, LocalFs};
use studio_ops::integrity::RootIntegrityChecker;
use studio_ops::integrity::store::MemoryRootStore;
use studio_ops::lock::memory::MemoryLockBackend;
use studio_ops::lock::{LockBackend, LockScope, WorkflowKind};
use studio_ops::model::contract::{
    GuardrailReason, IntegrityMode, RootIntegrityRequest, StorageRootContract,
};
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn contract() -> StorageRootContract {
    StorageRootContract {
        provider_key: "nas".into(),
        root_key: "projects".into(),
        contract_key: "projects-root-v1".into(),
        required_folders: vec!["01_PROJECTS".into(), "02_LIBRARY".into()],
        optional_folders: vec!["03_ARCHIVE".into()],
        allowed_extras: vec!["scratch".into()],
        allowed_root_files: vec!["README.md".into()],
        quarantine_relpath: None,
        max_items: None,
        max_bytes: None,
        is_active: true,
    }
}

/// Root with one required folder, one allowed file, and two strays.
fn populated_root() -> TempDir {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    std::fs::create_dir(root.join("01_PROJECTS")).unwrap();
    std::fs::write(root.join("README.md"), b"root readme").unwrap();
    std::fs::create_dir(root.join("junk")).unwrap();
    std::fs::write(root.join("junk").join("a.mov"), b"0123456789").unwrap();
    std::fs::write(root.join("stray.txt"), b"stray").unwrap();
    dir
}

struct Harness {
    roots: MemoryRootStore,
    locks: MemoryLockBackend,
    checker: RootIntegrityChecker,
}

fn harness(root: &Path, contract: Option<StorageRootContract>, fs: Arc<dyn FileSystem>) -> Harness {
    let roots = MemoryRootStore::new();
    if let Some(contract) = contract {
        roots.add_contract(contract);
    }
    roots.set_root_path("nas", "projects", root);
    let locks = MemoryLockBackend::new();
    let checker = RootIntegrityChecker::new(
        Arc::new(roots.clone()),
        Arc::new(locks.clone()),
        fs,
        "worker-test",
    );
    Harness {
        roots,
        locks,
        checker,
    }
}

fn local_harness(root: &Path) -> Harness {
    harness(root, Some(contract()), Arc::new(LocalFs::new()))
}

fn request(mode: &str, dry_run: bool) -> RootIntegrityRequest {
    RootIntegrityRequest {
        provider_key: "nas".into(),
        root_key: "projects".into(),
        mode: mode.into(),
        dry_run,
        quarantine_relpath: None,
        max_items: None,
        max_bytes: None,
    }
}

/// Local disk that cannot measure anything.
struct UnmeasurableFs(LocalFs);

impl FileSystem for UnmeasurableFs {
    fn entry_kind(&self, path: &Path) -> io::Result<Option<EntryKind>> {
        self.0.entry_kind(path)
    }
    fn create_dir(&self, path: &Path) -> io::Result<()> {
        self.0.create_dir(path)
    }
    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        self.0.create_dir_all(path)
    }
    fn create_file(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        self.0.create_file(path, contents)
    }
    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        self.0.read(path)
    }
    fn write(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        self.0.write(path, contents)
    }
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        self.0.rename(from, to)
    }
    fn list_dir(&self, path: &Path) -> io::Result<Vec<DirEntry>> {
        self.0.list_dir(path)
    }
    fn measure(&self, _path: &Path, _stop_after_items: Option<u64>) -> io::Result<EntrySize> {
        Err(io::Error::other("size not reported by provider"))
    }
}

/// Local disk whose renames take `delay`, counting the ones that finished.
struct SlowRenameFs {
    inner: LocalFs,
    delay: Duration,
    renamed: Arc<AtomicUsize>,
}

impl FileSystem for SlowRenameFs {
    fn entry_kind(&self, path: &Path) -> io::Result<Option<EntryKind>> {
        self.inner.entry_kind(path)
    }
    fn create_dir(&self, path: &Path) -> io::Result<()> {
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
        std::thread::sleep(self.delay);
        self.inner.rename(from, to)?;
        self.renamed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
    fn list_dir(&self, path: &Path) -> io::Result<Vec<DirEntry>> {
        self.inner.list_dir(path)
    }
    fn measure(&self, path: &Path, stop_after_items: Option<u64>) -> io::Result<EntrySize> {
        self.inner.measure(path, stop_after_items)
    }
}

// ---------------------------------------------------------------------------
// Validation short-circuits
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unknown_mode_yields_error_only_result() {
    // No contract registered and a root that does not exist: a mode error
    // must come back before either is looked at.
    let h = harness(Path::new("/nonexistent/root"), None, Arc::new(LocalFs::new()));
    let result = h.checker.run(&request("audit", false)).await.unwrap();

    assert_eq!(result.mode, None);
    assert_eq!(result.errors.len(), 1);
    assert!(result.errors[0].contains("audit"), "{:?}", result.errors);
    assert!(result.contract_key.is_none());
    assert!(result.unknown_entries.is_empty());
    assert!(!result.success());
}

#[tokio::test]
async fn mode_is_case_insensitive() {
    let dir = populated_root();
    let h = local_harness(dir.path());
    let result = h.checker.run(&request("REPORT", false)).await.unwrap();
    assert_eq!(result.mode, Some(IntegrityMode::Report));
}

#[tokio::test]
async fn missing_contract_yields_error_only_result() {
    let h = harness(Path::new("/nonexistent/root"), None, Arc::new(LocalFs::new()));
    let result = h.checker.run(&request("report", false)).await.unwrap();

    assert_eq!(result.mode, Some(IntegrityMode::Report));
    assert_eq!(result.errors.len(), 1);
    assert!(result.errors[0].contains("no active storage root contract"));
}

#[tokio::test]
async fn inactive_contract_counts_as_missing() {
    let dir = populated_root();
    let h = harness(
        dir.path(),
        Some(StorageRootContract {
            is_active: false,
            ..contract()
        }),
        Arc::new(LocalFs::new()),
    );
    let result = h.checker.run(&request("report", false)).await.unwrap();
    assert!(result.errors[0].contains("no active storage root contract"));
    assert!(result.unknown_entries.is_empty());
}

#[tokio::test]
async fn newest_active_contract_wins() {
    let dir = populated_root();
    let h = local_harness(dir.path());
    h.roots.add_contract(StorageRootContract {
        contract_key: "projects-root-v2".into(),
        required_folders: vec!["01_PROJECTS".into()],
        ..contract()
    });

    let result = h.checker.run(&request("report", false)).await.unwrap();
    assert_eq!(result.contract_key.as_deref(), Some("projects-root-v2"));
    assert!(result.missing_required.is_empty());
}

#[tokio::test]
async fn escaping_quarantine_path_is_rejected() {
    let dir = populated_root();
    let h = local_harness(dir.path());
    let mut req = request("repair", false);
    req.quarantine_relpath = Some("../outside".into());

    let result = h.checker.run(&req).await.unwrap();
    assert_eq!(result.errors.len(), 1);
    assert!(result.actions.is_empty());
    assert!(dir.path().join("junk").is_dir());
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

#[tokio::test]
async fn report_lists_missing_and_unknown_entries() {
    let dir = populated_root();
    let h = local_harness(dir.path());
    let result = h.checker.run(&request("report", true)).await.unwrap();

    assert_eq!(result.contract_key.as_deref(), Some("projects-root-v1"));
    assert_eq!(result.missing_required, vec!["02_LIBRARY"]);
    assert_eq!(result.unknown_entries, vec!["junk", "stray.txt"]);
    assert!(result.errors.is_empty());
    assert!(!result.success());
}

#[tokio::test]
async fn report_never_acts_even_without_dry_run() {
    let dir = populated_root();
    let h = local_harness(dir.path());
    let result = h.checker.run(&request("report", false)).await.unwrap();

    assert!(result.actions.is_empty());
    assert!(result.quarantine_plan.is_empty());
    assert!(dir.path().join("junk").is_dir());
    assert!(dir.path().join("stray.txt").is_file());
    assert!(!dir.path().join("_quarantine").exists());
}

#[tokio::test]
async fn allow_lists_match_case_insensitively() {
    let dir = TempDir::new().unwrap();
    std::fs::create_dir(dir.path().join("01_projects")).unwrap();
    std::fs::create_dir(dir.path().join("02_Library")).unwrap();
    std::fs::create_dir(dir.path().join("SCRATCH")).unwrap();
    std::fs::write(dir.path().join("readme.MD"), b"").unwrap();

    let h = local_harness(dir.path());
    let result = h.checker.run(&request("report", true)).await.unwrap();
    assert!(result.missing_required.is_empty());
    assert!(result.unknown_entries.is_empty());
    assert!(result.success());
}

#[tokio::test]
async fn required_name_occupied_by_a_file_is_missing() {
    let dir = populated_root();
    std::fs::write(dir.path().join("02_LIBRARY"), b"not a folder").unwrap();
    let h = local_harness(dir.path());
    let result = h.checker.run(&request("report", true)).await.unwrap();
    assert_eq!(result.missing_required, vec!["02_LIBRARY"]);
    assert!(!result.unknown_entries.contains(&"02_LIBRARY".to_string()));
}

// ---------------------------------------------------------------------------
// Repair
// ---------------------------------------------------------------------------

#[tokio::test]
async fn repair_dry_run_plans_without_moving() {
    let dir = populated_root();
    let h = local_harness(dir.path());
    let result = h.checker.run(&request("repair", true)).await.unwrap();

    let destinations: Vec<_> = result
        .quarantine_plan
        .iter()
        .map(|m| m.destination.as_str())
        .collect();
    assert_eq!(destinations, vec!["_quarantine/junk", "_quarantine/stray.txt"]);
    assert_eq!(result.quarantine_plan[0].size.map(|s| s.items), Some(2));
    assert!(result.actions.is_empty());
    assert!(dir.path().join("junk").is_dir());
    assert!(!dir.path().join("_quarantine").exists());
}

#[tokio::test]
async fn repair_moves_unknown_entries_into_quarantine() {
    let dir = populated_root();
    let h = local_harness(dir.path());
    let result = h.checker.run(&request("repair", false)).await.unwrap();

    assert!(result.errors.is_empty(), "{:?}", result.errors);
    assert_eq!(result.actions.len(), 2);
    assert!(result.actions.iter().all(|a| a.action == "quarantine_move"));
    assert!(!dir.path().join("junk").exists());
    assert_eq!(
        std::fs::read(dir.path().join("_quarantine/junk/a.mov")).unwrap(),
        b"0123456789"
    );
    assert!(dir.path().join("_quarantine/stray.txt").is_file());

    // The quarantine folder itself is not an unknown entry next time.
    let again = h.checker.run(&request("report", true)).await.unwrap();
    assert!(again.unknown_entries.is_empty(), "{:?}", again.unknown_entries);
}

#[tokio::test]
async fn repair_picks_a_free_name_on_collision() {
    let dir = populated_root();
    std::fs::create_dir_all(dir.path().join("_quarantine/junk")).unwrap();
    let h = local_harness(dir.path());

    let result = h.checker.run(&request("repair", false)).await.unwrap();
    let junk = result.actions.iter().find(|a| a.source == "junk").unwrap();
    assert_eq!(junk.destination, "_quarantine/junk__2");
    assert!(dir.path().join("_quarantine/junk__2/a.mov").is_file());
}

#[tokio::test]
async fn request_overrides_contract_quarantine_path() {
    let dir = populated_root();
    let h = local_harness(dir.path());
    let mut req = request("repair", false);
    req.quarantine_relpath = Some("scratch/held".into());

    let result = h.checker.run(&req).await.unwrap();
    assert!(result.errors.is_empty(), "{:?}", result.errors);
    assert!(dir.path().join("scratch/held/stray.txt").is_file());
}

#[tokio::test]
async fn unmeasurable_entries_are_blocked_with_unknown_size() {
    for dry_run in [true, false] {
        let dir = populated_root();
        let h = harness(
            dir.path(),
            Some(StorageRootContract {
                max_bytes: Some(1_000_000),
                ..contract()
            }),
            Arc::new(UnmeasurableFs(LocalFs::new())),
        );

        let result = h.checker.run(&request("repair", dry_run)).await.unwrap();
        assert_eq!(result.guardrail_blocks.len(), 2, "dry_run={dry_run}");
        assert!(
            result
                .guardrail_blocks
                .iter()
                .all(|b| b.reason == GuardrailReason::UnknownSize)
        );
        assert!(result.quarantine_plan.is_empty());
        assert!(result.actions.is_empty());
        assert!(dir.path().join("junk").is_dir());
        // A block is a soft outcome, not an error.
        assert!(result.errors.is_empty());
    }
}

#[tokio::test]
async fn oversized_entries_are_blocked_with_over_limit() {
    let dir = populated_root();
    for i in 0..5 {
        std::fs::write(dir.path().join("junk").join(format!("f{i}.bin")), b"x").unwrap();
    }
    let h = local_harness(dir.path());
    let mut req = request("repair", false);
    req.max_items = Some(3);

    let result = h.checker.run(&req).await.unwrap();
    assert_eq!(result.guardrail_blocks.len(), 1);
    assert_eq!(result.guardrail_blocks[0].entry, "junk");
    assert_eq!(result.guardrail_blocks[0].reason, GuardrailReason::OverLimit);
    // The small entry still moves.
    assert_eq!(result.actions.len(), 1);
    assert_eq!(result.actions[0].source, "stray.txt");
    assert!(dir.path().join("junk").is_dir());
}

#[tokio::test]
async fn byte_limit_blocks_large_files() {
    let dir = populated_root();
    let h = local_harness(dir.path());
    let mut req = request("repair", true);
    req.max_bytes = Some(8);

    let result = h.checker.run(&req).await.unwrap();
    let blocked: Vec<_> = result.guardrail_blocks.iter().map(|b| b.entry.as_str()).collect();
    assert_eq!(blocked, vec!["junk"]);
    assert_eq!(result.quarantine_plan.len(), 1);
}

// ---------------------------------------------------------------------------
// Locking
// ---------------------------------------------------------------------------

#[tokio::test]
async fn repair_fails_fast_when_root_lock_is_held() {
    let dir = populated_root();
    let h = local_harness(dir.path());
    let scope = LockScope::root("nas", "projects");
    let held = h
        .locks
        .try_acquire(&scope, WorkflowKind::Archive, "other-worker")
        .await
        .unwrap()
        .unwrap();

    let err = h.checker.run(&request("repair", false)).await.unwrap_err();
    assert!(err.is_lock_unavailable(), "{err}");
    assert!(err.to_string().contains("root:nas:projects"));
    assert!(dir.path().join("junk").is_dir());

    // Reports and dry runs do not need the lock.
    assert!(h.checker.run(&request("report", false)).await.is_ok());
    assert!(h.checker.run(&request("repair", true)).await.is_ok());

    held.release().await.unwrap();
}

#[tokio::test]
async fn repair_releases_root_lock_when_done() {
    let dir = populated_root();
    let h = local_harness(dir.path());
    h.checker.run(&request("repair", false)).await.unwrap();
    assert!(!h.locks.is_held(&LockScope::root("nas", "projects")));
}

#[tokio::test]
async fn repair_moves_nothing_twice() {
    let dir = populated_root();
    let h = local_harness(dir.path());
    h.checker.run(&request("repair", false)).await.unwrap();
    let second = h.checker.run(&request("repair", false)).await.unwrap();
    assert!(second.actions.is_empty());
    assert!(second.unknown_entries.is_empty());
}

#[tokio::test]
async fn cancelled_repair_holds_root_lock_until_moves_finish() {
    let dir = populated_root();
    let renamed = Arc::new(AtomicUsize::new(0));
    let fs = SlowRenameFs {
        inner: LocalFs::new(),
        delay: Duration::from_millis(200),
        renamed: Arc::clone(&renamed),
    };
    let h = harness(dir.path(), Some(contract()), Arc::new(fs));
    let scope = LockScope::root("nas", "projects");

    let req = request("repair", false);
    let run = h.checker.run(&req);
    assert!(tokio::time::timeout(Duration::from_millis(50), run).await.is_err());

    // The moves carry on without the caller, and the lock stays with them.
    assert!(h.locks.is_held(&scope));
    assert!(
        h.locks
            .try_acquire(&scope, WorkflowKind::Archive, "other-worker")
            .await
            .unwrap()
            .is_none()
    );

    let deadline = Instant::now() + Duration::from_secs(10);
    while h.locks.is_held(&scope) {
        assert!(Instant::now() < deadline, "root lock never freed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(renamed.load(Ordering::SeqCst), 2);
    assert!(dir.path().join("_quarantine").join("junk").is_dir());
    assert!(dir.path().join("_quarantine").join("stray.txt").is_file());
}
