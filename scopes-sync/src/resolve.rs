//! Resolution of pull conflicts reported by [`ScopeSync::sync_down`].

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::engine::{PullConflict, ScopeSync};
use crate::error::{io_err, SyncError};
use crate::meta::read_record;
use crate::pull::record_pull;
use crate::writer::copy_atomic;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictStrategy {
    /// Leave the local copy alone. The conflict comes back on the next pull.
    KeepLocal,
    /// Overwrite the local copy with the shared one.
    KeepShared,
    /// Copy the local file aside, then take the shared one.
    BackupAndUpdate,
}

impl fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConflictStrategy::KeepLocal => "keep-local",
            ConflictStrategy::KeepShared => "keep-shared",
            ConflictStrategy::BackupAndUpdate => "backup-and-update",
        };
        f.write_str(s)
    }
}

impl FromStr for ConflictStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "keep-local" => Ok(ConflictStrategy::KeepLocal),
            "keep-shared" => Ok(ConflictStrategy::KeepShared),
            "backup-and-update" => Ok(ConflictStrategy::BackupAndUpdate),
            other => Err(format!("unknown conflict strategy: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub strategy: ConflictStrategy,
    /// Where the local copy was saved, for [`ConflictStrategy::BackupAndUpdate`].
    pub backup: Option<PathBuf>,
}

impl ScopeSync {
    pub fn resolve_conflict(
        &self,
        conflict: &PullConflict,
        strategy: ConflictStrategy,
    ) -> Result<Resolution, SyncError> {
        if strategy == ConflictStrategy::KeepLocal {
            tracing::info!(scope = %conflict.scope, file = %conflict.file, "keeping local copy");
            return Ok(Resolution {
                strategy,
                backup: None,
            });
        }

        let key = format!("{}/{}", conflict.source_scope, conflict.file);
        let backup = self.with_sync_meta(&conflict.scope, |meta| {
            let backup = if strategy == ConflictStrategy::BackupAndUpdate && conflict.local.exists() {
                let path = backup_path(&conflict.local);
                std::fs::copy(&conflict.local, &path).map_err(|e| io_err(&path, e))?;
                tracing::info!(backup = %path.display(), "saved local copy");
                Some(path)
            } else {
                None
            };

            copy_atomic(&conflict.shared, &conflict.local)?;
            let version = read_record(&conflict.shared).map_or(1, |r| r.version);
            record_pull(meta, key.clone(), &conflict.local, version)?;
            Ok(backup)
        })?;

        tracing::info!(
            scope = %conflict.scope,
            file = %key,
            %strategy,
            "conflict resolved"
        );
        Ok(Resolution { strategy, backup })
    }
}

/// `<local>.backup-<unix millis>`
fn backup_path(local: &std::path::Path) -> PathBuf {
    let mut os = local.as_os_str().to_owned();
    os.push(format!(".backup-{}", chrono::Utc::now().timestamp_millis()));
    PathBuf::from(os)
}
