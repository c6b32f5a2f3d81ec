//! Moving a pre-scope project into a scope, and restoring from backups.
//!
//! A legacy project keeps `planning-artifacts/`, `implementation-artifacts/`
//! and `tests/` directly under the output base, next to a few root files.
//! [`ScopeMigrator::migrate`] moves all of it under `<output>/<scope>/`.
//!
//! Backups live in the output base as `_backup_migration_<millis>` (taken
//! before a migration) or `_backup_<scope>_<millis>` (taken before a scope
//! directory is removed); [`ScopeMigrator::rollback`] restores either kind.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{scope_io_err, ScopeError, StateError, ValidationError};
use crate::layout::{
    Layout, BACKUP_PREFIX, IMPLEMENTATION_DIR, MIGRATION_BACKUP_TAG, PLANNING_DIR,
    PROJECT_CONTEXT_FILE, TESTS_DIR,
};
use crate::state_lock::write_atomic;
use crate::tree::{child_names, copy_tree, remove_path, tree_stats};
use crate::types::{ScopeId, ScopePaths};
use crate::validator::validate_scope_id;

/// Scope that legacy artifacts move into when none is given.
pub const DEFAULT_MIGRATION_SCOPE: &str = "default";

const LEGACY_DIRS: [&str; 3] = [PLANNING_DIR, IMPLEMENTATION_DIR, TESTS_DIR];

const SPRINT_STATUS_FILE: &str = "sprint-status.yaml";
const WORKFLOW_STATUS_FILE: &str = "workflow-status.yaml";
const LEGACY_ROOT_FILES: [&str; 3] = [PROJECT_CONTEXT_FILE, SPRINT_STATUS_FILE, WORKFLOW_STATUS_FILE];

/// What a legacy layout holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationAnalysis {
    pub has_legacy_artifacts: bool,
    /// Legacy directories present, in canonical order.
    pub directories: Vec<String>,
    /// Every file found, relative to the output base.
    pub files: Vec<String>,
    pub total_size: u64,
    pub suggested_scope: ScopeId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrateOptions {
    /// Target scope; the migrator's default scope when `None`.
    pub scope: Option<String>,
    /// Copy the legacy layout to `_backup_migration_<millis>` first.
    pub backup: bool,
}

impl Default for MigrateOptions {
    fn default() -> Self {
        Self {
            scope: None,
            backup: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub scope: ScopeId,
    /// `false` when there was nothing to migrate and nothing was touched.
    pub needed: bool,
    pub backup: Option<PathBuf>,
    /// Entries moved, relative to the output base (`planning-artifacts/prd.md`).
    pub migrated: Vec<String>,
    /// Entries left in place because the scope already had one by that name.
    pub skipped: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum BackupKind {
    Migration,
    ScopeRemoval { scope: ScopeId },
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupInfo {
    pub name: String,
    pub path: PathBuf,
    pub kind: BackupKind,
    /// From the name's millisecond suffix, else the directory's mtime.
    pub created: Option<DateTime<Utc>>,
    /// Top-level entries, sorted.
    pub contents: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RollbackOptions {
    /// Replace entries that already exist at the destination.
    pub force: bool,
    /// Keep the backup directory even after a clean restore.
    pub keep_backup: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestoreFailure {
    pub entry: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RollbackReport {
    pub restored: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<RestoreFailure>,
    pub backup_removed: bool,
}

impl RollbackReport {
    pub fn is_success(&self) -> bool {
        !self.restored.is_empty() && self.skipped.is_empty() && self.failed.is_empty()
    }
}

#[derive(Serialize)]
struct MigratedMarker<'a> {
    scope_id: &'a ScopeId,
    migrated: bool,
    migrated_at: DateTime<Utc>,
    original_backup: Option<String>,
    version: u32,
}

#[derive(Debug, Clone)]
pub struct ScopeMigrator {
    layout: Layout,
    default_scope: ScopeId,
}

impl ScopeMigrator {
    pub fn new(layout: Layout) -> Self {
        Self {
            layout,
            default_scope: ScopeId::from(DEFAULT_MIGRATION_SCOPE),
        }
    }

    pub fn with_default_scope(mut self, scope: impl Into<ScopeId>) -> Self {
        self.default_scope = scope.into();
        self
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// `true` when the output base still has a legacy planning or
    /// implementation directory.
    pub fn needs_migration(&self) -> bool {
        let output = self.layout.output_dir();
        output.is_dir()
            && (output.join(PLANNING_DIR).is_dir() || output.join(IMPLEMENTATION_DIR).is_dir())
    }

    pub fn analyze_existing(&self) -> MigrationAnalysis {
        let output = self.layout.output_dir();
        let mut analysis = MigrationAnalysis {
            has_legacy_artifacts: false,
            directories: Vec::new(),
            files: Vec::new(),
            total_size: 0,
            suggested_scope: self.default_scope.clone(),
        };

        for dir in LEGACY_DIRS {
            let path = output.join(dir);
            if !path.is_dir() {
                continue;
            }
            analysis.has_legacy_artifacts = true;
            analysis.directories.push(dir.to_string());
            let stats = tree_stats(&path);
            analysis
                .files
                .extend(stats.files.into_iter().map(|f| format!("{dir}/{f}")));
            analysis.total_size += stats.size;
        }

        for file in LEGACY_ROOT_FILES {
            let Ok(meta) = fs::metadata(output.join(file)) else {
                continue;
            };
            if meta.is_file() {
                analysis.has_legacy_artifacts = true;
                analysis.files.push(file.to_string());
                analysis.total_size += meta.len();
            }
        }
        analysis
    }

    /// Copy every legacy directory and root file into a fresh
    /// `_backup_migration_<millis>` directory.
    pub fn create_backup(&self) -> Result<PathBuf, ScopeError> {
        let output = self.layout.output_dir();
        let backup = self
            .layout
            .backup_dir(MIGRATION_BACKUP_TAG, Utc::now().timestamp_millis());
        fs::create_dir_all(&backup).map_err(|e| scope_io_err(&backup, e))?;

        let mut files = 0;
        for name in LEGACY_DIRS.iter().chain(LEGACY_ROOT_FILES.iter()) {
            let source = output.join(name);
            if source.exists() {
                files += copy_tree(&source, &backup.join(name))?;
            }
        }
        tracing::info!(backup = %backup.display(), files, "backed up legacy layout");
        Ok(backup)
    }

    /// Move the legacy layout into a scope. Entries the scope already has are
    /// left where they are and reported as skipped; a legacy directory is
    /// only removed once it is empty. The registry is not touched.
    pub fn migrate(&self, options: MigrateOptions) -> Result<MigrationReport, ScopeError> {
        let scope = options
            .scope
            .map(ScopeId::from)
            .unwrap_or_else(|| self.default_scope.clone());
        validate_migration_scope(scope.as_str())?;

        let mut report = MigrationReport {
            scope: scope.clone(),
            needed: false,
            backup: None,
            migrated: Vec::new(),
            skipped: Vec::new(),
        };
        if !self.needs_migration() {
            tracing::info!(scope = %scope, "no legacy layout, nothing to migrate");
            return Ok(report);
        }
        report.needed = true;

        if options.backup {
            report.backup = Some(self.create_backup()?);
        }

        let output = self.layout.output_dir();
        let paths = self.layout.scope_paths(scope.as_str());
        for dir in [&paths.planning, &paths.implementation, &paths.tests] {
            fs::create_dir_all(dir).map_err(|e| scope_io_err(dir, e))?;
        }

        for legacy in LEGACY_DIRS {
            let source = output.join(legacy);
            if !source.is_dir() {
                continue;
            }
            let target_dir = legacy_dir_target(&paths, legacy);
            for name in child_names(&source)? {
                let key = format!("{legacy}/{name}");
                let target = target_dir.join(&name);
                if target.exists() {
                    tracing::warn!(scope = %scope, entry = %key, "already in scope, left in place");
                    report.skipped.push(key);
                    continue;
                }
                let from = source.join(&name);
                copy_tree(&from, &target)?;
                remove_path(&from)?;
                report.migrated.push(key);
            }
            if child_names(&source)?.is_empty() {
                remove_path(&source)?;
            }
        }

        for file in LEGACY_ROOT_FILES {
            let source = output.join(file);
            if !source.is_file() {
                continue;
            }
            let target = root_file_target(&paths, file).join(file);
            if target.exists() {
                tracing::warn!(scope = %scope, entry = file, "already in scope, left in place");
                report.skipped.push(file.to_string());
                continue;
            }
            fs::rename(&source, &target).map_err(|e| scope_io_err(&target, e))?;
            report.migrated.push(file.to_string());
        }

        let marker = MigratedMarker {
            scope_id: &scope,
            migrated: true,
            migrated_at: Utc::now(),
            original_backup: report
                .backup
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
            version: 1,
        };
        let yaml = serde_yaml::to_string(&marker).map_err(StateError::from)?;
        write_atomic(&paths.meta, yaml.as_bytes())?;

        tracing::info!(
            scope = %scope,
            migrated = report.migrated.len(),
            skipped = report.skipped.len(),
            "migrated legacy layout"
        );
        Ok(report)
    }

    /// `_backup_*` directories in the output base, newest first.
    pub fn list_backups(&self) -> Result<Vec<BackupInfo>, ScopeError> {
        let output = self.layout.output_dir();
        if !output.is_dir() {
            return Ok(Vec::new());
        }

        let mut backups = Vec::new();
        for name in child_names(&output)? {
            let path = output.join(&name);
            if !name.starts_with(BACKUP_PREFIX) || !path.is_dir() {
                continue;
            }
            let (kind, stamped) = parse_backup_name(&name);
            let created = stamped.or_else(|| {
                fs::metadata(&path)
                    .and_then(|m| m.modified())
                    .ok()
                    .map(DateTime::<Utc>::from)
            });
            backups.push(BackupInfo {
                contents: child_names(&path)?,
                name,
                path,
                kind,
                created,
            });
        }
        backups.sort_by(|a, b| b.created.cmp(&a.created));
        Ok(backups)
    }

    /// Copy a backup's top-level entries back: migration backups into the
    /// output base, scope backups into that scope's directory. The backup is
    /// deleted after a clean restore unless `keep_backup`.
    pub fn rollback(
        &self,
        backup: &Path,
        options: RollbackOptions,
    ) -> Result<RollbackReport, ScopeError> {
        if !backup.is_dir() {
            return Err(ScopeError::MissingDirectory {
                path: backup.to_path_buf(),
            });
        }
        let destination = match backup
            .file_name()
            .map(|n| parse_backup_name(&n.to_string_lossy()).0)
        {
            Some(BackupKind::ScopeRemoval { scope }) => {
                validate_scope_id(scope.as_str())?;
                self.layout.scope_dir(scope.as_str())
            }
            _ => self.layout.output_dir(),
        };
        fs::create_dir_all(&destination).map_err(|e| scope_io_err(&destination, e))?;

        let mut report = RollbackReport::default();
        for name in child_names(backup)? {
            let target = destination.join(&name);
            if target.exists() {
                if !options.force {
                    report.skipped.push(name);
                    continue;
                }
                if let Err(e) = remove_path(&target) {
                    report.failed.push(RestoreFailure {
                        entry: name,
                        error: e.to_string(),
                    });
                    continue;
                }
            }
            match copy_tree(&backup.join(&name), &target) {
                Ok(_) => report.restored.push(name),
                Err(e) => {
                    tracing::warn!(entry = %name, error = %e, "restore failed");
                    report.failed.push(RestoreFailure {
                        entry: name,
                        error: e.to_string(),
                    });
                }
            }
        }

        if report.is_success() && !options.keep_backup {
            remove_path(backup)?;
            report.backup_removed = true;
        }
        tracing::info!(
            backup = %backup.display(),
            restored = report.restored.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            removed = report.backup_removed,
            "rollback finished"
        );
        Ok(report)
    }
}

/// A scope named like a legacy directory would be migrated into itself.
fn validate_migration_scope(scope: &str) -> Result<(), ValidationError> {
    validate_scope_id(scope)?;
    if LEGACY_DIRS.contains(&scope) {
        return Err(ValidationError::single(format!(
            "scope id '{scope}' clashes with the legacy '{scope}/' directory"
        )));
    }
    Ok(())
}

fn legacy_dir_target<'a>(paths: &'a ScopePaths, legacy: &str) -> &'a Path {
    match legacy {
        PLANNING_DIR => &paths.planning,
        IMPLEMENTATION_DIR => &paths.implementation,
        _ => &paths.tests,
    }
}

fn root_file_target<'a>(paths: &'a ScopePaths, file: &str) -> &'a Path {
    match file {
        SPRINT_STATUS_FILE => &paths.implementation,
        WORKFLOW_STATUS_FILE => &paths.planning,
        _ => &paths.root,
    }
}

/// `_backup_migration_<ms>` or `_backup_<scope>_<ms>`.
fn parse_backup_name(name: &str) -> (BackupKind, Option<DateTime<Utc>>) {
    let parsed = name
        .strip_prefix(BACKUP_PREFIX)
        .and_then(|rest| rest.rsplit_once('_'))
        .and_then(|(tag, millis)| {
            let millis: i64 = millis.parse().ok()?;
            Some((tag, DateTime::<Utc>::from_timestamp_millis(millis)?))
        });
    match parsed {
        Some((MIGRATION_BACKUP_TAG, at)) => (BackupKind::Migration, Some(at)),
        Some((tag, at)) if !tag.is_empty() => (
            BackupKind::ScopeRemoval {
                scope: ScopeId::from(tag),
            },
            Some(at),
        ),
        _ => (BackupKind::Unknown, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_fs::prelude::*;
    use predicates::prelude::*;

    fn legacy_project() -> (assert_fs::TempDir, ScopeMigrator) {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("_scopes-output/planning-artifacts/prd.md")
            .write_str("# PRD\n")
            .unwrap();
        temp.child("_scopes-output/implementation-artifacts/stories/s1.md")
            .write_str("story\n")
            .unwrap();
        temp.child("_scopes-output/project-context.md")
            .write_str("ctx")
            .unwrap();
        temp.child("_scopes-output/sprint-status.yaml")
            .write_str("sprint: 1\n")
            .unwrap();
        let migrator = ScopeMigrator::new(Layout::new(temp.path()));
        (temp, migrator)
    }

    #[test]
    fn backup_names_parse() {
        let (kind, at) = parse_backup_name("_backup_migration_1700000000000");
        assert_eq!(kind, BackupKind::Migration);
        assert_eq!(at.unwrap().timestamp_millis(), 1_700_000_000_000);

        let (kind, _) = parse_backup_name("_backup_user-auth_1700000000000");
        assert_eq!(
            kind,
            BackupKind::ScopeRemoval {
                scope: ScopeId::from("user-auth")
            }
        );

        assert_eq!(parse_backup_name("_backup_auth_notanumber").0, BackupKind::Unknown);
        assert_eq!(parse_backup_name("_backup_123").0, BackupKind::Unknown);
    }

    #[test]
    fn detection_requires_planning_or_implementation() {
        let temp = assert_fs::TempDir::new().unwrap();
        let migrator = ScopeMigrator::new(Layout::new(temp.path()));
        assert!(!migrator.needs_migration());

        temp.child("_scopes-output/tests/t.md").write_str("t").unwrap();
        assert!(!migrator.needs_migration());
        assert!(migrator.analyze_existing().has_legacy_artifacts);

        temp.child("_scopes-output/implementation-artifacts")
            .create_dir_all()
            .unwrap();
        assert!(migrator.needs_migration());
    }

    #[test]
    fn analysis_lists_files_and_size() {
        let (_temp, migrator) = legacy_project();
        let analysis = migrator.analyze_existing();
        assert!(analysis.has_legacy_artifacts);
        assert_eq!(
            analysis.directories,
            vec!["planning-artifacts".to_string(), "implementation-artifacts".to_string()]
        );
        assert_eq!(
            analysis.files,
            vec![
                "planning-artifacts/prd.md".to_string(),
                "implementation-artifacts/stories/s1.md".to_string(),
                "project-context.md".to_string(),
                "sprint-status.yaml".to_string(),
            ]
        );
        assert_eq!(analysis.total_size, 6 + 6 + 3 + 10);
        assert_eq!(analysis.suggested_scope, "default");
    }

    #[test]
    fn backup_copies_legacy_layout() {
        let (temp, migrator) = legacy_project();
        let backup = migrator.create_backup().unwrap();
        assert!(backup
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("_backup_migration_"));
        assert_eq!(
            fs::read_to_string(backup.join("implementation-artifacts/stories/s1.md")).unwrap(),
            "story\n"
        );
        assert!(backup.join("sprint-status.yaml").is_file());
        temp.child("_scopes-output/planning-artifacts/prd.md")
            .assert(predicate::path::is_file());
    }

    #[test]
    fn scope_named_after_legacy_dir_is_rejected() {
        let (temp, migrator) = legacy_project();
        let err = migrator
            .migrate(MigrateOptions {
                scope: Some("tests".into()),
                backup: false,
            })
            .unwrap_err();
        assert!(matches!(err, ScopeError::Validation(_)), "got: {err}");
        assert!(matches!(
            migrator.migrate(MigrateOptions {
                scope: Some("_shared".into()),
                backup: false,
            }),
            Err(ScopeError::Validation(_))
        ));
        temp.child("_scopes-output/planning-artifacts/prd.md")
            .assert(predicate::path::is_file());
    }

    #[test]
    fn nothing_to_migrate_touches_nothing() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("_scopes-output").create_dir_all().unwrap();
        let report = ScopeMigrator::new(Layout::new(temp.path()))
            .migrate(MigrateOptions::default())
            .unwrap();
        assert!(!report.needed);
        assert!(report.backup.is_none());
        temp.child("_scopes-output/default")
            .assert(predicate::path::missing());
    }
}
