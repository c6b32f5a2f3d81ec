use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use filetime::{set_file_mtime, FileTime};
use scopes_core::Layout;
use scopes_sync::{
    ConflictStrategy, PromotionRecord, ScopeSync, SkipReason, SyncError, SyncOptions,
};
use tempfile::TempDir;

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_test_writer()
        .try_init();
}

fn output(root: &TempDir) -> PathBuf {
    root.path().join("_scopes-output")
}

fn project(scopes: &[&str]) -> (TempDir, ScopeSync) {
    init_tracing();
    let root = TempDir::new().expect("root");
    for scope in scopes {
        fs::create_dir_all(output(&root).join(scope).join("architecture")).expect("scope dir");
    }
    let sync = ScopeSync::new(Layout::new(root.path()));
    (root, sync)
}

fn write(path: &Path, contents: &str) {
    fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
    fs::write(path, contents).expect("write");
}

fn sidecar(path: &Path) -> PromotionRecord {
    let mut meta = path.as_os_str().to_owned();
    meta.push(".meta");
    let yaml = fs::read_to_string(PathBuf::from(meta)).expect("sidecar present");
    serde_yaml::from_str(&yaml).expect("sidecar parses")
}

fn future_mtime(path: &Path) {
    let later = FileTime::from_system_time(SystemTime::now() + Duration::from_secs(120));
    set_file_mtime(path, later).expect("bump mtime");
}

#[test]
fn promotion_versions_only_move_on_content_change() {
    let (root, sync) = project(&["auth"]);
    let source = output(&root).join("auth/architecture/overview.md");
    let shared = output(&root).join("_shared/auth/architecture/overview.md");
    write(&source, "# Auth v1\n");

    let first = sync.sync_up("auth", None, SyncOptions::default()).expect("first");
    assert_eq!(first.promoted.len(), 1);
    assert_eq!(first.promoted[0].version, 1);
    assert_eq!(first.promoted[0].file, "architecture/overview.md");
    assert_eq!(fs::read_to_string(&shared).unwrap(), "# Auth v1\n");

    let record = sidecar(&shared);
    assert_eq!(record.source_scope, "auth");
    assert_eq!(record.original_path, "architecture/overview.md");
    assert_eq!(record.version, 1);

    let again = sync.sync_up("auth", None, SyncOptions::default()).expect("again");
    assert!(again.promoted.is_empty());
    assert_eq!(again.skipped.len(), 1);
    assert_eq!(again.skipped[0].reason, SkipReason::Unchanged);
    assert_eq!(sidecar(&shared).version, 1);

    write(&source, "# Auth v2\n");
    let changed = sync.sync_up("auth", None, SyncOptions::default()).expect("changed");
    assert_eq!(changed.promoted[0].version, 2);
    assert_eq!(sidecar(&shared).version, 2);
    assert_eq!(fs::read_to_string(&shared).unwrap(), "# Auth v2\n");

    let status = sync.sync_status("auth").expect("status");
    assert_eq!(status.promoted_files, vec!["architecture/overview.md".to_string()]);
    assert!(status.last_sync_up.is_some());
    assert!(status.last_sync_down.is_none());
}

#[test]
fn foreign_edit_of_shared_copy_conflicts_until_forced() {
    let (root, sync) = project(&["auth"]);
    let source = output(&root).join("auth/architecture/overview.md");
    let shared = output(&root).join("_shared/auth/architecture/overview.md");
    write(&source, "mine\n");
    sync.sync_up("auth", None, SyncOptions::default()).expect("promote");

    fs::write(&shared, "edited in place\n").unwrap();
    write(&source, "mine, revised\n");

    let blocked = sync.sync_up("auth", None, SyncOptions::default()).expect("sync");
    assert!(blocked.promoted.is_empty());
    assert_eq!(blocked.conflicts.len(), 1);
    assert_eq!(blocked.conflicts[0].target, shared);
    assert_eq!(fs::read_to_string(&shared).unwrap(), "edited in place\n");

    let forced = sync.sync_up("auth", None, SyncOptions::forced()).expect("forced");
    assert!(forced.conflicts.is_empty());
    assert_eq!(forced.promoted[0].version, 2);
    assert_eq!(fs::read_to_string(&shared).unwrap(), "mine, revised\n");
}

#[test]
fn second_pull_of_same_version_is_up_to_date() {
    let (root, sync) = project(&["auth", "payments"]);
    write(&output(&root).join("auth/architecture/overview.md"), "auth\n");
    sync.sync_up("auth", None, SyncOptions::default()).expect("promote");

    let first = sync.sync_down("payments", SyncOptions::default()).expect("pull");
    assert_eq!(first.pulled.len(), 1);
    assert_eq!(first.pulled[0].source_scope, "auth");
    assert_eq!(first.pulled[0].version, 1);
    let mirror = output(&root).join("payments/shared/auth/architecture/overview.md");
    assert_eq!(fs::read_to_string(&mirror).unwrap(), "auth\n");
    assert!(!output(&root)
        .join("payments/shared/auth/architecture/overview.md.meta")
        .exists());

    let second = sync.sync_down("payments", SyncOptions::default()).expect("pull again");
    assert!(second.pulled.is_empty());
    assert_eq!(second.up_to_date.len(), 1);
    assert_eq!(second.up_to_date[0].file, "architecture/overview.md");

    let status = sync.sync_status("payments").expect("status");
    assert_eq!(status.pulled_files, vec!["auth/architecture/overview.md".to_string()]);
}

#[test]
fn new_shared_version_is_pulled_over_untouched_mirror() {
    let (root, sync) = project(&["auth", "payments"]);
    let source = output(&root).join("auth/architecture/overview.md");
    write(&source, "v1\n");
    sync.sync_up("auth", None, SyncOptions::default()).unwrap();
    sync.sync_down("payments", SyncOptions::default()).unwrap();

    write(&source, "v2\n");
    sync.sync_up("auth", None, SyncOptions::default()).unwrap();
    let result = sync.sync_down("payments", SyncOptions::default()).unwrap();
    assert!(result.conflicts.is_empty());
    assert_eq!(result.pulled[0].version, 2);
    let mirror = output(&root).join("payments/shared/auth/architecture/overview.md");
    assert_eq!(fs::read_to_string(mirror).unwrap(), "v2\n");
}

fn diverged(root: &TempDir, sync: &ScopeSync) -> PathBuf {
    let source = output(root).join("auth/architecture/overview.md");
    write(&source, "v1\n");
    sync.sync_up("auth", None, SyncOptions::default()).unwrap();
    sync.sync_down("payments", SyncOptions::default()).unwrap();

    let mirror = output(root).join("payments/shared/auth/architecture/overview.md");
    fs::write(&mirror, "local tweak\n").unwrap();
    future_mtime(&mirror);

    write(&source, "v2\n");
    sync.sync_up("auth", None, SyncOptions::default()).unwrap();
    mirror
}

#[test]
fn local_edit_plus_shared_change_conflicts() {
    let (root, sync) = project(&["auth", "payments"]);
    let mirror = diverged(&root, &sync);

    let result = sync.sync_down("payments", SyncOptions::default()).unwrap();
    assert!(result.pulled.is_empty());
    assert_eq!(result.conflicts.len(), 1);
    let conflict = &result.conflicts[0];
    assert_eq!(conflict.scope, "payments");
    assert_eq!(conflict.source_scope, "auth");
    assert_eq!(conflict.local, mirror);
    assert_eq!(fs::read_to_string(&mirror).unwrap(), "local tweak\n");

    let forced = sync.sync_down("payments", SyncOptions::forced()).unwrap();
    assert_eq!(forced.pulled.len(), 1);
    assert_eq!(fs::read_to_string(&mirror).unwrap(), "v2\n");
}

#[test]
fn backup_and_update_keeps_local_copy_aside() {
    let (root, sync) = project(&["auth", "payments"]);
    let mirror = diverged(&root, &sync);
    let conflict = sync
        .sync_down("payments", SyncOptions::default())
        .unwrap()
        .conflicts
        .remove(0);

    let resolution = sync
        .resolve_conflict(&conflict, ConflictStrategy::BackupAndUpdate)
        .expect("resolve");
    let backup = resolution.backup.expect("backup written");
    assert_eq!(fs::read_to_string(&backup).unwrap(), "local tweak\n");
    assert_eq!(fs::read_to_string(&mirror).unwrap(), "v2\n");

    let next = sync.sync_down("payments", SyncOptions::default()).unwrap();
    assert!(next.conflicts.is_empty());
    assert_eq!(next.up_to_date.len(), 1);
}

#[test]
fn keep_shared_and_keep_local() {
    let (root, sync) = project(&["auth", "payments"]);
    let mirror = diverged(&root, &sync);
    let conflict = sync
        .sync_down("payments", SyncOptions::default())
        .unwrap()
        .conflicts
        .remove(0);

    let kept = sync
        .resolve_conflict(&conflict, ConflictStrategy::KeepLocal)
        .unwrap();
    assert!(kept.backup.is_none());
    assert_eq!(fs::read_to_string(&mirror).unwrap(), "local tweak\n");
    let still = sync.sync_down("payments", SyncOptions::default()).unwrap();
    assert_eq!(still.conflicts.len(), 1);

    let taken = sync
        .resolve_conflict(&still.conflicts[0], ConflictStrategy::KeepShared)
        .unwrap();
    assert!(taken.backup.is_none());
    assert_eq!(fs::read_to_string(&mirror).unwrap(), "v2\n");
    let next = sync.sync_down("payments", SyncOptions::default()).unwrap();
    assert_eq!(next.up_to_date.len(), 1);
}

#[test]
fn pull_into_missing_scope_fails() {
    let (_root, sync) = project(&["auth"]);
    assert!(sync.sync_down("ghost", SyncOptions::default()).is_err());
}

#[test]
fn reserved_scope_id_is_rejected() {
    let (root, sync) = project(&["auth"]);
    write(&output(&root).join("_shared/auth/architecture/overview.md"), "auth\n");

    let err = sync.sync_down("_shared", SyncOptions::default()).unwrap_err();
    assert!(matches!(err, SyncError::Validation(_)), "got: {err}");
    assert!(!output(&root).join("_shared/shared").exists());
    assert!(!output(&root).join("_shared/.sync-meta.yaml").exists());

    let err = sync.sync_up("_shared", None, SyncOptions::default()).unwrap_err();
    assert!(matches!(err, SyncError::Validation(_)), "got: {err}");
}

#[test]
fn traversal_scope_id_is_rejected() {
    let (root, sync) = project(&["auth"]);
    write(&output(&root).join("auth/architecture/overview.md"), "auth\n");

    for id in ["..", "../auth", "auth/architecture"] {
        let up = sync.sync_up(id, None, SyncOptions::default()).unwrap_err();
        assert!(matches!(up, SyncError::Validation(_)), "{id}: {up}");
        let down = sync.sync_down(id, SyncOptions::default()).unwrap_err();
        assert!(matches!(down, SyncError::Validation(_)), "{id}: {down}");
        assert!(matches!(sync.sync_status(id), Err(SyncError::Validation(_))));
    }
    assert!(!root.path().join(".sync-meta.yaml").exists());
    assert!(!output(&root).join("_shared").exists());
}

#[test]
fn interrupted_write_leftovers_are_not_pulled() {
    let (root, sync) = project(&["auth", "payments"]);
    write(&output(&root).join("auth/architecture/overview.md"), "auth\n");
    sync.sync_up("auth", None, SyncOptions::default()).expect("promote");
    write(
        &output(&root).join("_shared/auth/architecture/overview.md.tmp"),
        "half written",
    );

    let result = sync.sync_down("payments", SyncOptions::default()).expect("pull");
    assert_eq!(result.pulled.len(), 1);
    assert_eq!(result.pulled[0].file, "architecture/overview.md");
    assert!(!output(&root)
        .join("payments/shared/auth/architecture/overview.md.tmp")
        .exists());
}

#[test]
fn failed_sidecar_write_rolls_back_shared_copy() {
    let (root, sync) = project(&["auth"]);
    let source = output(&root).join("auth/architecture/overview.md");
    let shared = output(&root).join("_shared/auth/architecture/overview.md");
    let meta = output(&root).join("_shared/auth/architecture/overview.md.meta");
    write(&source, "v1\n");
    sync.sync_up("auth", None, SyncOptions::default()).expect("promote");

    // A directory where the sidecar belongs makes the rename fail.
    fs::remove_file(&meta).unwrap();
    fs::create_dir(&meta).unwrap();
    write(&source, "v2\n");

    let failed = sync.sync_up("auth", None, SyncOptions::default()).expect("sync");
    assert!(failed.promoted.is_empty());
    assert_eq!(failed.errors.len(), 1);
    assert_eq!(failed.errors[0].file, source);
    assert_eq!(fs::read_to_string(&shared).unwrap(), "v1\n");

    fs::remove_dir(&meta).unwrap();
    let retried = sync.sync_up("auth", None, SyncOptions::default()).expect("retry");
    assert_eq!(retried.promoted.len(), 1);
    assert_eq!(retried.promoted[0].version, 2);
    assert_eq!(fs::read_to_string(&shared).unwrap(), "v2\n");
    assert_eq!(sidecar(&shared).version, 2);
}

#[test]
fn failed_first_promotion_leaves_no_shared_copy() {
    let (root, sync) = project(&["auth"]);
    let source = output(&root).join("auth/architecture/overview.md");
    write(&source, "v1\n");
    fs::create_dir_all(output(&root).join("_shared/auth/architecture/overview.md.meta")).unwrap();

    let failed = sync.sync_up("auth", None, SyncOptions::default()).expect("sync");
    assert_eq!(failed.errors.len(), 1);
    assert!(!output(&root).join("_shared/auth/architecture/overview.md").exists());
    assert!(sync.sync_status("auth").unwrap().promoted_files.is_empty());
}
