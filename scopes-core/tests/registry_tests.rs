//! Registry lifecycle, error-message and on-disk format tests.

use assert_fs::prelude::*;
use predicates::prelude::*;
use scopes_core::{
    LockOptions, NewScope, RemoveOptions, ScopeError, ScopeId, ScopeManager, ScopeRegistry,
    ScopeStatus, StateError, Versioned,
};
use std::fs;
use std::time::Duration;

fn manager(temp: &assert_fs::TempDir) -> ScopeManager {
    let mgr = ScopeManager::new(temp.path()).with_lock_options(
        LockOptions::default().with_backoff(Duration::from_millis(1), Duration::from_millis(5)),
    );
    mgr.initialize().expect("initialize");
    mgr
}

fn read_registry(temp: &assert_fs::TempDir) -> Versioned<ScopeRegistry> {
    let raw = fs::read_to_string(temp.path().join("_scopes/_config/scopes.yaml")).expect("read");
    serde_yaml::from_str(&raw).expect("parse registry")
}

// ---------------------------------------------------------------------------
// 1. Create
// ---------------------------------------------------------------------------

#[test]
fn create_single_scope_persists_one_active_entry() {
    let temp = assert_fs::TempDir::new().expect("tempdir");
    let mgr = manager(&temp);

    mgr.create_scope("auth", NewScope::default()).expect("create");

    let doc = read_registry(&temp);
    assert_eq!(doc.data.scopes.len(), 1);
    let auth = &doc.data.scopes["auth"];
    assert_eq!(auth.status, ScopeStatus::Active);
    assert_eq!(auth.meta.artifact_count, 0);
    assert_eq!(auth.name, "auth");
    assert_eq!(doc.data.version, 1);
    // initialize wrote version 1, create bumped it.
    assert_eq!(doc.version, 2);

    temp.child("_scopes/_config/scopes.yaml")
        .assert(predicate::str::contains("status: active"));
    temp.child("_scopes-output/auth/planning-artifacts")
        .assert(predicate::path::is_dir());
    temp.child("_scopes/_config/scopes.yaml.lock")
        .assert(predicate::path::missing());
}

#[test]
fn every_mutation_bumps_version_by_one() {
    let temp = assert_fs::TempDir::new().expect("tempdir");
    let mgr = manager(&temp);

    assert_eq!(read_registry(&temp).version, 1);
    mgr.create_scope("auth", NewScope::default()).expect("create");
    assert_eq!(read_registry(&temp).version, 2);
    mgr.touch_scope("auth").expect("touch");
    assert_eq!(read_registry(&temp).version, 3);
    mgr.archive_scope("auth").expect("archive");
    assert_eq!(read_registry(&temp).version, 4);
    mgr.increment_artifact_count("auth", 2).expect("increment");
    assert_eq!(read_registry(&temp).version, 5);

    // A rejected mutation writes nothing.
    assert!(mgr.increment_artifact_count("auth", -10).is_err());
    assert_eq!(read_registry(&temp).version, 5);
}

// ---------------------------------------------------------------------------
// 2. Remove with dependents
// ---------------------------------------------------------------------------

#[test]
fn remove_with_dependents_requires_force() {
    let temp = assert_fs::TempDir::new().expect("tempdir");
    let mgr = manager(&temp);
    mgr.create_scope("auth", NewScope::default()).expect("auth");
    mgr.create_scope(
        "payments",
        NewScope::named("Payments").with_dependencies(["auth"]),
    )
    .expect("payments");

    let err = mgr.remove_scope("auth", RemoveOptions::default()).unwrap_err();
    match &err {
        ScopeError::HasDependents { id, dependents } => {
            assert_eq!(id, "auth");
            assert_eq!(dependents, &vec![ScopeId::from("payments")]);
        }
        other => panic!("expected HasDependents, got {other}"),
    }
    assert!(mgr.scope_exists("auth"));

    mgr.remove_scope("auth", RemoveOptions::forced()).expect("force remove");
    assert!(!mgr.scope_exists("auth"));
    let payments = mgr.get_scope("payments").expect("load").expect("payments");
    assert!(payments.dependencies.is_empty());

    let doc = read_registry(&temp);
    assert!(!doc.data.scopes.contains_key("auth"));
}

#[test]
fn remove_missing_scope_is_not_found() {
    let temp = assert_fs::TempDir::new().expect("tempdir");
    let mgr = manager(&temp);
    let err = mgr.remove_scope("ghost", RemoveOptions::forced()).unwrap_err();
    assert!(matches!(err, ScopeError::NotFound { .. }), "got: {err}");
    assert!(err.to_string().contains("'ghost'"));
}

#[test]
fn remove_keeps_directory_unless_asked() {
    let temp = assert_fs::TempDir::new().expect("tempdir");
    let mgr = manager(&temp);
    mgr.create_scope("auth", NewScope::default()).expect("auth");

    assert_eq!(mgr.remove_scope("auth", RemoveOptions::default()).expect("remove"), None);
    temp.child("_scopes-output/auth/planning-artifacts")
        .assert(predicate::path::is_dir());
}

#[test]
fn remove_with_files_backs_up_then_deletes() {
    let temp = assert_fs::TempDir::new().expect("tempdir");
    let mgr = manager(&temp);
    mgr.create_scope("auth", NewScope::default()).expect("auth");
    temp.child("_scopes-output/auth/planning-artifacts/prd.md")
        .write_str("# PRD\n")
        .expect("write prd");

    let backup = mgr
        .remove_scope("auth", RemoveOptions::default().with_files(true))
        .expect("remove")
        .expect("backup taken");
    assert!(!mgr.scope_exists("auth"));
    temp.child("_scopes-output/auth")
        .assert(predicate::path::missing());
    assert_eq!(backup.parent(), Some(temp.path().join("_scopes-output").as_path()));
    assert_eq!(
        fs::read_to_string(backup.join("planning-artifacts/prd.md")).expect("backup copy"),
        "# PRD\n"
    );
}

#[test]
fn remove_with_files_tolerates_missing_directory() {
    let temp = assert_fs::TempDir::new().expect("tempdir");
    let mgr = manager(&temp);
    mgr.create_scope("auth", NewScope::default()).expect("auth");
    fs::remove_dir_all(temp.path().join("_scopes-output/auth")).expect("rm");

    let backup = mgr
        .remove_scope("auth", RemoveOptions::default().with_files(false))
        .expect("remove");
    assert_eq!(backup, None);
    assert!(!mgr.scope_exists("auth"));
}

// ---------------------------------------------------------------------------
// 3. Corruption and concurrent edits
// ---------------------------------------------------------------------------

#[test]
fn corrupt_registry_is_a_parse_error_naming_the_file() {
    let temp = assert_fs::TempDir::new().expect("tempdir");
    let mgr = manager(&temp);
    temp.child("_scopes/_config/scopes.yaml")
        .write_str(": : corrupt : yaml : !!!\n  - broken: [unclosed")
        .expect("corrupt");

    let err = mgr.load_registry(true).unwrap_err();
    assert!(
        matches!(err, ScopeError::State(StateError::Parse { .. })),
        "got: {err}"
    );
    assert!(err.to_string().contains("scopes.yaml"));

    // Mutations refuse too, and leave the file as found.
    assert!(mgr.create_scope("auth", NewScope::default()).is_err());
    temp.child("_scopes/_config/scopes.yaml")
        .assert(predicate::str::contains("broken"));
}

#[test]
fn hand_edited_invalid_registry_is_rejected() {
    let temp = assert_fs::TempDir::new().expect("tempdir");
    let mgr = manager(&temp);
    mgr.create_scope("auth", NewScope::default()).expect("create");

    let path = temp.path().join("_scopes/_config/scopes.yaml");
    let raw = fs::read_to_string(&path).expect("read");
    fs::write(&path, raw.replace("id: auth", "id: other")).expect("write");

    let err = mgr.load_registry(true).unwrap_err();
    assert!(err.to_string().contains("does not match"), "got: {err}");
}

#[test]
fn two_managers_do_not_lose_updates() {
    let temp = assert_fs::TempDir::new().expect("tempdir");
    let first = manager(&temp);
    let second = manager(&temp);
    first.create_scope("auth", NewScope::default()).expect("create");

    // `second` has a cached registry from initialize; mutations must not use it.
    second
        .create_scope("payments", NewScope::default())
        .expect("create via second manager");

    let doc = read_registry(&temp);
    assert!(doc.data.scopes.contains_key("auth"));
    assert!(doc.data.scopes.contains_key("payments"));
}

#[test]
fn threaded_artifact_increments_are_serialized() {
    let temp = assert_fs::TempDir::new().expect("tempdir");
    let options = LockOptions::default()
        .with_retries(500)
        .with_backoff(Duration::from_millis(1), Duration::from_millis(4));
    let mgr = ScopeManager::new(temp.path()).with_lock_options(options);
    mgr.initialize().expect("initialize");
    mgr.create_scope("auth", NewScope::default()).expect("create");

    std::thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                for _ in 0..5 {
                    mgr.increment_artifact_count("auth", 1).expect("increment");
                }
            });
        }
    });

    let auth = mgr.get_scope("auth").expect("load").expect("auth");
    assert_eq!(auth.meta.artifact_count, 20);
}
