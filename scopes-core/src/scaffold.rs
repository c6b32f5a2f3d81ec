//! Directory scaffolding for scopes.
//!
//! [`ScopeManager`](crate::manager::ScopeManager) only needs directories to
//! exist; how they are populated is up to the [`ScopeScaffold`] it is given.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{scope_io_err, ScopeError, StateError};
use crate::layout::{Layout, IMPLEMENTATION_DIR, PLANNING_DIR, TESTS_DIR};
use crate::state_lock::write_atomic;
use crate::tree::{copy_tree, remove_path};
use crate::types::{Scope, ScopeId, ScopePaths};

/// Creates the directories the scope system and individual scopes rely on.
pub trait ScopeScaffold: Send + Sync {
    /// Shared layer and events directory.
    fn initialize_system(&self, layout: &Layout) -> Result<(), ScopeError>;

    /// Per-scope directory tree. Must be idempotent.
    fn initialize_scope(&self, layout: &Layout, scope: &Scope) -> Result<ScopePaths, ScopeError>;

    /// Delete the scope's directory tree, copying it to
    /// `<output>/_backup_<id>_<millis>` first when `backup` is set. Returns
    /// the backup location.
    fn remove_scope(
        &self,
        layout: &Layout,
        id: &str,
        backup: bool,
    ) -> Result<Option<PathBuf>, ScopeError>;
}

#[derive(Serialize)]
struct ScopeMarker<'a> {
    scope_id: &'a ScopeId,
    created: DateTime<Utc>,
    version: u32,
    structure: MarkerStructure,
}

#[derive(Serialize)]
struct MarkerStructure {
    planning_artifacts: String,
    implementation_artifacts: String,
    tests: String,
}

/// Plain directories plus a `.scope-meta.yaml` marker.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirScaffold;

impl ScopeScaffold for DirScaffold {
    fn initialize_system(&self, layout: &Layout) -> Result<(), ScopeError> {
        ensure_dir(&layout.shared_dir())?;
        ensure_dir(&layout.events_dir())
    }

    fn initialize_scope(&self, layout: &Layout, scope: &Scope) -> Result<ScopePaths, ScopeError> {
        let paths = layout.scope_paths(scope.id.as_str());
        ensure_dir(&paths.planning)?;
        ensure_dir(&paths.implementation)?;
        ensure_dir(&paths.tests)?;

        if !paths.meta.exists() {
            let marker = ScopeMarker {
                scope_id: &scope.id,
                created: scope.created,
                version: 1,
                structure: MarkerStructure {
                    planning_artifacts: format!("{PLANNING_DIR}/"),
                    implementation_artifacts: format!("{IMPLEMENTATION_DIR}/"),
                    tests: format!("{TESTS_DIR}/"),
                },
            };
            let yaml = serde_yaml::to_string(&marker).map_err(StateError::from)?;
            write_atomic(&paths.meta, yaml.as_bytes())?;
        }

        tracing::debug!(scope = %scope.id, root = %paths.root.display(), "scope directories ready");
        Ok(paths)
    }

    fn remove_scope(
        &self,
        layout: &Layout,
        id: &str,
        backup: bool,
    ) -> Result<Option<PathBuf>, ScopeError> {
        let root = layout.scope_dir(id);
        if !root.is_dir() {
            return Err(ScopeError::MissingDirectory { path: root });
        }

        let backup_dir = if backup {
            let dir = layout.backup_dir(id, Utc::now().timestamp_millis());
            let files = copy_tree(&root, &dir)?;
            tracing::info!(scope = id, backup = %dir.display(), files, "backed up scope directory");
            Some(dir)
        } else {
            None
        };

        remove_path(&root)?;
        tracing::info!(scope = id, root = %root.display(), "removed scope directory");
        Ok(backup_dir)
    }
}

fn ensure_dir(path: &Path) -> Result<(), ScopeError> {
    fs::create_dir_all(path).map_err(|e| scope_io_err(path, e))
}
