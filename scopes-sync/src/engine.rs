//! [`ScopeSync`] and the result types shared by promote, pull and conflict
//! resolution.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use scopes_core::validator::validate_scope_id;
use scopes_core::{Layout, LockOptions, StateLock, Versioned};

use crate::error::SyncError;
use crate::meta::SyncMeta;

/// Patterns promoted when `sync_up` is given no explicit file list.
pub const DEFAULT_PROMOTABLE_PATTERNS: &[&str] = &[
    "architecture/*.md",
    "contracts/*.md",
    "principles/*.md",
    "project-context.md",
];

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncOptions {
    /// Overwrite instead of reporting conflicts.
    pub force: bool,
}

impl SyncOptions {
    pub fn forced() -> Self {
        Self { force: true }
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// A file that could not be processed; the rest of the batch continues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileError {
    pub file: PathBuf,
    pub error: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotFound,
    /// Shared copy already holds this content from this scope's last promotion.
    Unchanged,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::NotFound => write!(f, "file not found"),
            SkipReason::Unchanged => write!(f, "unchanged"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Skipped {
    pub file: PathBuf,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Promoted {
    /// Relative to the scope directory, `/`-separated.
    pub file: String,
    pub target: PathBuf,
    pub version: u64,
}

/// The shared copy was changed by someone else since this scope last
/// promoted it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromoteConflict {
    pub file: String,
    pub source: PathBuf,
    pub target: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncUpResult {
    pub promoted: Vec<Promoted>,
    pub conflicts: Vec<PromoteConflict>,
    pub errors: Vec<FileError>,
    pub skipped: Vec<Skipped>,
}

impl SyncUpResult {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pulled {
    pub file: String,
    pub source_scope: String,
    pub target: PathBuf,
    pub version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpToDate {
    pub file: String,
    pub source_scope: String,
}

/// Both the local mirror and the shared copy changed since the last pull.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullConflict {
    /// Scope that pulled.
    pub scope: String,
    pub source_scope: String,
    /// Relative to the source scope's shared directory.
    pub file: String,
    pub local: PathBuf,
    pub shared: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncDownResult {
    pub pulled: Vec<Pulled>,
    pub conflicts: Vec<PullConflict>,
    pub errors: Vec<FileError>,
    pub up_to_date: Vec<UpToDate>,
}

impl SyncDownResult {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Snapshot of a scope's sync bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStatus {
    pub last_sync_up: Option<DateTime<Utc>>,
    pub last_sync_down: Option<DateTime<Utc>>,
    pub promoted_files: Vec<String>,
    pub pulled_files: Vec<String>,
}

impl SyncStatus {
    pub fn promoted_count(&self) -> usize {
        self.promoted_files.len()
    }

    pub fn pulled_count(&self) -> usize {
        self.pulled_files.len()
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Promote/pull engine over one project layout.
///
/// Every operation on a scope holds that scope's `.sync-meta.yaml` lock for
/// its whole duration.
#[derive(Debug, Clone)]
pub struct ScopeSync {
    pub(crate) layout: Layout,
    pub(crate) lock: StateLock,
    pub(crate) promotable_patterns: Vec<String>,
}

impl ScopeSync {
    pub fn new(layout: Layout) -> Self {
        Self {
            layout,
            lock: StateLock::default(),
            promotable_patterns: DEFAULT_PROMOTABLE_PATTERNS
                .iter()
                .map(|p| p.to_string())
                .collect(),
        }
    }

    pub fn with_lock_options(mut self, options: LockOptions) -> Self {
        self.lock = StateLock::new(options);
        self
    }

    pub fn with_promotable_patterns<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.promotable_patterns = patterns.into_iter().map(Into::into).collect();
        self
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn promotable_patterns(&self) -> &[String] {
        &self.promotable_patterns
    }

    /// Last sync times and tracked files. Reads without the lock.
    pub fn sync_status(&self, scope: &str) -> Result<SyncStatus, SyncError> {
        validate_scope_id(scope)?;
        let doc: Versioned<SyncMeta> = self.lock.read_yaml(&self.layout.sync_meta_path(scope))?;
        let meta = doc.data;
        Ok(SyncStatus {
            last_sync_up: meta.last_sync_up,
            last_sync_down: meta.last_sync_down,
            promoted_files: meta.promoted_files.into_keys().collect(),
            pulled_files: meta.pulled_files.into_keys().collect(),
        })
    }

    /// The scope's output directory, or `ScopeNotFound`. Reserved and
    /// malformed ids (`_shared`, `..`) are rejected before touching disk.
    pub(crate) fn existing_scope_dir(&self, scope: &str) -> Result<PathBuf, SyncError> {
        validate_scope_id(scope)?;
        let dir = self.layout.scope_dir(scope);
        if dir.is_dir() {
            Ok(dir)
        } else {
            Err(SyncError::ScopeNotFound {
                scope: scope.to_string(),
                path: dir,
            })
        }
    }

    /// Lock the scope's sync-meta, hand `op` the document, write it back.
    pub(crate) fn with_sync_meta<T, F>(&self, scope: &str, op: F) -> Result<T, SyncError>
    where
        F: FnOnce(&mut SyncMeta) -> Result<T, SyncError>,
    {
        validate_scope_id(scope)?;
        let path = self.layout.sync_meta_path(scope);
        self.lock.with_lock(&path, || -> Result<T, SyncError> {
            let mut doc: Versioned<SyncMeta> = self.lock.read_yaml(&path)?;
            let out = op(&mut doc.data)?;
            self.lock.write_yaml(&path, &mut doc)?;
            Ok(out)
        })
    }
}

pub(crate) fn file_error(file: &Path, error: impl std::fmt::Display) -> FileError {
    FileError {
        file: file.to_path_buf(),
        error: error.to_string(),
    }
}
