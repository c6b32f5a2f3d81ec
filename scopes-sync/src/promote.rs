//! Sync-up: promote scope artifacts into `<output>/_shared/<scope>/`.
//!
//! Per candidate file:
//! 1. Missing source → skipped (`file not found`).
//! 2. Shared copy exists with the same content this scope last promoted →
//!    skipped (`unchanged`); the version stays put.
//! 3. Shared copy exists, differs from the source, and is not what this
//!    scope last promoted → conflict, unless forced.
//! 4. Otherwise copy, write the `.meta` sidecar with `version + 1`, and record
//!    the promotion in the scope's sync-meta. If the sidecar cannot be
//!    written the shared copy is put back as it was, so the next sync-up
//!    retries from a consistent state.

use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};

use chrono::Utc;

use scopes_core::glob_match;

use crate::engine::{
    file_error, PromoteConflict, Promoted, ScopeSync, SkipReason, Skipped, SyncOptions,
    SyncUpResult,
};
use crate::error::{io_err, SyncError};
use crate::hash::hash_file;
use crate::meta::{rel_key, write_record, PromotedFile, PromotionRecord, SyncMeta};
use crate::writer::{copy_atomic, is_scratch};

enum Outcome {
    Promoted(Promoted),
    Skipped(SkipReason),
    Conflict(PromoteConflict),
}

impl ScopeSync {
    /// Promote `files` (relative to the scope directory, or absolute inside
    /// it), or every file matching the promotable patterns when `None`.
    pub fn sync_up(
        &self,
        scope: &str,
        files: Option<&[PathBuf]>,
        options: SyncOptions,
    ) -> Result<SyncUpResult, SyncError> {
        let scope_dir = self.existing_scope_dir(scope)?;

        let candidates: Vec<PathBuf> = match files {
            Some(list) if !list.is_empty() => list
                .iter()
                .map(|f| if f.is_absolute() { f.clone() } else { scope_dir.join(f) })
                .collect(),
            _ => self.find_promotable_files(&scope_dir),
        };

        let result = self.with_sync_meta(scope, |meta| {
            let mut result = SyncUpResult::default();
            for source in &candidates {
                match self.promote_one(scope, &scope_dir, source, options, meta) {
                    Ok(Outcome::Promoted(p)) => result.promoted.push(p),
                    Ok(Outcome::Skipped(reason)) => result.skipped.push(Skipped {
                        file: source.clone(),
                        reason,
                    }),
                    Ok(Outcome::Conflict(c)) => result.conflicts.push(c),
                    Err(e) => {
                        tracing::warn!(scope, file = %source.display(), error = %e, "promotion failed");
                        result.errors.push(file_error(source, e));
                    }
                }
            }
            meta.last_sync_up = Some(Utc::now());
            Ok(result)
        })?;

        tracing::info!(
            scope,
            promoted = result.promoted.len(),
            conflicts = result.conflicts.len(),
            skipped = result.skipped.len(),
            errors = result.errors.len(),
            "sync-up finished"
        );
        Ok(result)
    }

    /// Files directly inside each pattern's directory whose name matches the
    /// pattern's last segment. Sorted and deduplicated.
    pub fn find_promotable_files(&self, scope_dir: &Path) -> Vec<PathBuf> {
        let mut found = BTreeSet::new();
        for pattern in &self.promotable_patterns {
            let (dir, name_pattern) = match pattern.rsplit_once('/') {
                Some((dir, name)) => (scope_dir.join(dir), name),
                None => (scope_dir.to_path_buf(), pattern.as_str()),
            };
            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            for entry in entries.filter_map(Result::ok) {
                let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
                let name = entry.file_name();
                if is_file
                    && !is_scratch(&entry.path())
                    && glob_match(&name.to_string_lossy(), name_pattern)
                {
                    found.insert(entry.path());
                }
            }
        }
        found.into_iter().collect()
    }

    fn promote_one(
        &self,
        scope: &str,
        scope_dir: &Path,
        source: &Path,
        options: SyncOptions,
        meta: &mut SyncMeta,
    ) -> Result<Outcome, SyncError> {
        if !source.is_file() {
            tracing::debug!(scope, file = %source.display(), "promotion source missing");
            return Ok(Outcome::Skipped(SkipReason::NotFound));
        }

        let relative = source
            .strip_prefix(scope_dir)
            .ok()
            .filter(|rel| rel.components().all(|c| matches!(c, Component::Normal(_))))
            .ok_or_else(|| {
                io_err(
                    source,
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        "file is outside the scope directory",
                    ),
                )
            })?;
        let key = rel_key(relative);
        let target = self.layout.shared_scope_dir(scope).join(relative);
        let source_hash = hash_file(source)?;
        let recorded = meta.promoted_files.get(&key);

        if target.exists() {
            let target_hash = hash_file(&target)?;
            let last_promoted = recorded.map(|r| r.hash.as_str());
            if target_hash == source_hash && last_promoted == Some(source_hash.as_str()) {
                tracing::debug!(scope, file = %key, "unchanged, not re-promoting");
                return Ok(Outcome::Skipped(SkipReason::Unchanged));
            }
            if target_hash != source_hash
                && !options.force
                && last_promoted != Some(target_hash.as_str())
            {
                tracing::warn!(scope, file = %key, "shared copy changed elsewhere, not overwriting");
                return Ok(Outcome::Conflict(PromoteConflict {
                    file: key,
                    source: source.to_path_buf(),
                    target,
                }));
            }
        }

        let version = recorded.map_or(0, |r| r.version) + 1;
        let promoted_at = Utc::now();
        let previous = match std::fs::read(&target) {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(io_err(&target, e)),
        };
        copy_atomic(source, &target)?;
        let record = PromotionRecord {
            source_scope: scope.to_string(),
            promoted_at,
            original_path: key.clone(),
            original_hash: source_hash.clone(),
            version,
        };
        if let Err(e) = write_record(&target, &record) {
            restore_shared(&target, previous.as_deref());
            return Err(e);
        }
        meta.promoted_files.insert(
            key.clone(),
            PromotedFile {
                promoted_at,
                hash: source_hash,
                version,
            },
        );

        tracing::info!(scope, file = %key, version, "promoted");
        Ok(Outcome::Promoted(Promoted {
            file: key,
            target,
            version,
        }))
    }
}

/// Undo a copy whose sidecar could not be written.
fn restore_shared(target: &Path, previous: Option<&[u8]>) {
    let restored = match previous {
        Some(bytes) => scopes_core::write_atomic(target, bytes).map_err(SyncError::from),
        None => std::fs::remove_file(target).map_err(|e| io_err(target, e)),
    };
    match restored {
        Ok(()) => tracing::debug!(file = %target.display(), "rolled back shared copy"),
        Err(e) => {
            tracing::warn!(file = %target.display(), error = %e, "shared copy left without sidecar")
        }
    }
}
