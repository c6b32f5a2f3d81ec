//! Sync-down: mirror every shared artifact into
//! `<output>/<scope>/shared/<source_scope>/…`.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use walkdir::WalkDir;

use crate::engine::{file_error, PullConflict, Pulled, ScopeSync, SyncDownResult, SyncOptions, UpToDate};
use crate::error::{io_err, SyncError};
use crate::hash::hash_file;
use crate::meta::{is_sidecar, read_record, rel_key, PulledFile, SyncMeta};
use crate::writer::{copy_atomic, is_scratch};

enum Outcome {
    Pulled(Pulled),
    UpToDate(UpToDate),
    Conflict(PullConflict),
}

/// One file in the shared layer.
struct SharedFile<'a> {
    source_scope: &'a str,
    path: PathBuf,
    relative: String,
}

impl ScopeSync {
    pub fn sync_down(&self, scope: &str, options: SyncOptions) -> Result<SyncDownResult, SyncError> {
        self.existing_scope_dir(scope)?;
        let sources = self.shared_source_scopes();

        let result = self.with_sync_meta(scope, |meta| {
            let mut result = SyncDownResult::default();
            for source_scope in &sources {
                let (files, walk_errors) = self.shared_files(source_scope);
                result.errors.extend(walk_errors);
                for file in files {
                    match self.pull_one(scope, &file, options, meta) {
                        Ok(Outcome::Pulled(p)) => result.pulled.push(p),
                        Ok(Outcome::UpToDate(u)) => result.up_to_date.push(u),
                        Ok(Outcome::Conflict(c)) => result.conflicts.push(c),
                        Err(e) => {
                            tracing::warn!(scope, file = %file.path.display(), error = %e, "pull failed");
                            result.errors.push(file_error(&file.path, e));
                        }
                    }
                }
            }
            meta.last_sync_down = Some(Utc::now());
            Ok(result)
        })?;

        tracing::info!(
            scope,
            pulled = result.pulled.len(),
            up_to_date = result.up_to_date.len(),
            conflicts = result.conflicts.len(),
            errors = result.errors.len(),
            "sync-down finished"
        );
        Ok(result)
    }

    /// Top-level directories of the shared layer, skipping hidden ones.
    /// An unreadable or missing shared layer yields nothing.
    fn shared_source_scopes(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(self.layout.shared_dir()) else {
            return Vec::new();
        };
        let mut scopes: Vec<String> = entries
            .filter_map(Result::ok)
            .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| !name.starts_with('.'))
            .collect();
        scopes.sort();
        scopes
    }

    fn shared_files<'a>(
        &self,
        source_scope: &'a str,
    ) -> (Vec<SharedFile<'a>>, Vec<crate::engine::FileError>) {
        let root = self.layout.shared_scope_dir(source_scope);
        let mut files = Vec::new();
        let mut errors = Vec::new();
        for entry in WalkDir::new(&root).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.clone());
                    errors.push(file_error(&path, e));
                    continue;
                }
            };
            if !entry.file_type().is_file() || is_sidecar(entry.path()) || is_scratch(entry.path()) {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&root) else {
                continue;
            };
            files.push(SharedFile {
                source_scope,
                relative: rel_key(relative),
                path: entry.path().to_path_buf(),
            });
        }
        (files, errors)
    }

    fn pull_one(
        &self,
        scope: &str,
        file: &SharedFile<'_>,
        options: SyncOptions,
        meta: &mut SyncMeta,
    ) -> Result<Outcome, SyncError> {
        let key = format!("{}/{}", file.source_scope, file.relative);
        let target = self
            .layout
            .pulled_dir(scope, file.source_scope)
            .join(&file.relative);
        let record = read_record(&file.path);
        let last = meta.pulled_files.get(&key);

        if let (Some(last), Some(record)) = (last, &record) {
            if last.version == record.version {
                tracing::debug!(scope, file = %key, version = last.version, "up to date");
                return Ok(Outcome::UpToDate(UpToDate {
                    file: file.relative.clone(),
                    source_scope: file.source_scope.to_string(),
                }));
            }
        }

        if target.exists() && !options.force {
            let local_hash = hash_file(&target)?;
            let shared_hash = hash_file(&file.path)?;
            if local_hash != shared_hash {
                if let Some(last) = last {
                    if modified_at(&target)? > last.pulled_at {
                        tracing::warn!(scope, file = %key, "local copy edited since last pull");
                        return Ok(Outcome::Conflict(PullConflict {
                            scope: scope.to_string(),
                            source_scope: file.source_scope.to_string(),
                            file: file.relative.clone(),
                            local: target,
                            shared: file.path.clone(),
                        }));
                    }
                }
            }
        }

        let version = record.as_ref().map_or(1, |r| r.version);
        copy_atomic(&file.path, &target)?;
        record_pull(meta, key.clone(), &target, version)?;

        tracing::info!(scope, file = %key, version, "pulled");
        Ok(Outcome::Pulled(Pulled {
            file: file.relative.clone(),
            source_scope: file.source_scope.to_string(),
            target,
            version,
        }))
    }
}

/// Remember that `local` now holds `version` of the shared file behind `key`.
pub(crate) fn record_pull(
    meta: &mut SyncMeta,
    key: String,
    local: &Path,
    version: u64,
) -> Result<(), SyncError> {
    let hash = hash_file(local)?;
    meta.pulled_files.insert(
        key,
        PulledFile {
            pulled_at: Utc::now(),
            version,
            hash,
        },
    );
    Ok(())
}

fn modified_at(path: &Path) -> Result<DateTime<Utc>, SyncError> {
    let modified = std::fs::metadata(path)
        .and_then(|m| m.modified())
        .map_err(|e| io_err(path, e))?;
    Ok(DateTime::<Utc>::from(modified))
}
