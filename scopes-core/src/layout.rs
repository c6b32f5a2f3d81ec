//! On-disk layout of a scoped project.
//!
//! ```text
//! <project_root>/
//!   _scopes/
//!     _config/scopes.yaml            (registry)
//!     _events/event-log.yaml         (append-only event log)
//!     _events/subscriptions.yaml
//!   <output_base>/                   (default `_scopes-output`)
//!     _shared/<source_scope>/…       (promoted artifacts + `.meta` sidecars)
//!     <scope>/
//!       .sync-meta.yaml
//!       .scope-meta.yaml
//!       planning-artifacts/ implementation-artifacts/ tests/
//!       shared/<source_scope>/…      (pulled mirror)
//!       project-context.md           (scope context, optional)
//!     _backup_<scope>_<millis>/      (copy taken before removing a scope)
//!     _backup_migration_<millis>/    (copy taken before a legacy migration)
//!   .active-scope                    (session marker)
//! ```
//!
//! All helpers are pure; nothing here creates directories.

use std::path::{Path, PathBuf};

use crate::types::{ScopePaths, DEFAULT_OUTPUT_BASE, SHARED_DIR};

pub const STATE_DIR: &str = "_scopes";
pub const CONFIG_DIR: &str = "_config";
pub const EVENTS_DIR: &str = "_events";
pub const REGISTRY_FILE: &str = "scopes.yaml";
pub const EVENT_LOG_FILE: &str = "event-log.yaml";
pub const SUBSCRIPTIONS_FILE: &str = "subscriptions.yaml";
pub const SYNC_META_FILE: &str = ".sync-meta.yaml";
pub const SCOPE_META_FILE: &str = ".scope-meta.yaml";
pub const SESSION_FILE: &str = ".active-scope";
/// Directory inside a scope that mirrors pulled shared artifacts.
pub const PULLED_DIR: &str = "shared";

pub const PLANNING_DIR: &str = "planning-artifacts";
pub const IMPLEMENTATION_DIR: &str = "implementation-artifacts";
pub const TESTS_DIR: &str = "tests";

pub const PROJECT_CONTEXT_FILE: &str = "project-context.md";
pub const BACKUP_PREFIX: &str = "_backup_";
/// Backup kind tag; `_backup_migration_<millis>`.
pub const MIGRATION_BACKUP_TAG: &str = "migration";

/// Path conventions rooted at a project directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    project_root: PathBuf,
    output_base: String,
}

impl Layout {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
            output_base: DEFAULT_OUTPUT_BASE.to_string(),
        }
    }

    pub fn with_output_base(mut self, output_base: impl Into<String>) -> Self {
        self.output_base = output_base.into();
        self
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    /// Output base relative to the project root, as configured.
    pub fn output_base(&self) -> &str {
        &self.output_base
    }

    pub fn output_dir(&self) -> PathBuf {
        self.project_root.join(&self.output_base)
    }

    pub fn shared_dir(&self) -> PathBuf {
        self.output_dir().join(SHARED_DIR)
    }

    pub fn scope_dir(&self, scope: &str) -> PathBuf {
        self.output_dir().join(scope)
    }

    /// Where `scope` promotes to: `<output>/_shared/<scope>/`.
    pub fn shared_scope_dir(&self, scope: &str) -> PathBuf {
        self.shared_dir().join(scope)
    }

    /// Where `scope` mirrors artifacts pulled from `source`.
    pub fn pulled_dir(&self, scope: &str, source: &str) -> PathBuf {
        self.scope_dir(scope).join(PULLED_DIR).join(source)
    }

    pub fn sync_meta_path(&self, scope: &str) -> PathBuf {
        self.scope_dir(scope).join(SYNC_META_FILE)
    }

    pub fn state_dir(&self) -> PathBuf {
        self.project_root.join(STATE_DIR)
    }

    pub fn config_dir(&self) -> PathBuf {
        self.state_dir().join(CONFIG_DIR)
    }

    pub fn registry_path(&self) -> PathBuf {
        self.config_dir().join(REGISTRY_FILE)
    }

    pub fn events_dir(&self) -> PathBuf {
        self.state_dir().join(EVENTS_DIR)
    }

    pub fn event_log_path(&self) -> PathBuf {
        self.events_dir().join(EVENT_LOG_FILE)
    }

    pub fn subscriptions_path(&self) -> PathBuf {
        self.events_dir().join(SUBSCRIPTIONS_FILE)
    }

    /// `<output>/_backup_<tag>_<millis>`; `tag` is a scope id or
    /// [`MIGRATION_BACKUP_TAG`].
    pub fn backup_dir(&self, tag: &str, millis: i64) -> PathBuf {
        self.output_dir().join(format!("{BACKUP_PREFIX}{tag}_{millis}"))
    }

    pub fn session_path(&self) -> PathBuf {
        self.project_root.join(SESSION_FILE)
    }

    pub fn scope_paths(&self, scope: &str) -> ScopePaths {
        let root = self.scope_dir(scope);
        ScopePaths {
            planning: root.join(PLANNING_DIR),
            implementation: root.join(IMPLEMENTATION_DIR),
            tests: root.join(TESTS_DIR),
            meta: root.join(SCOPE_META_FILE),
            root,
        }
    }
}
