//! File copies into the shared layer and scope mirrors.
//!
//! Copies read the whole source and go through [`scopes_core::write_atomic`],
//! so a reader of the destination sees either the old or the new content.

use std::path::Path;

use scopes_core::TMP_SUFFIX;

use crate::error::{io_err, SyncError};

/// Copy `source` over `target`, creating parent directories.
pub fn copy_atomic(source: &Path, target: &Path) -> Result<(), SyncError> {
    let bytes = std::fs::read(source).map_err(|e| io_err(source, e))?;
    scopes_core::write_atomic(target, &bytes)?;
    tracing::debug!(from = %source.display(), to = %target.display(), "copied");
    Ok(())
}

/// Scratch file left behind by an interrupted atomic write. Never an
/// artifact.
pub fn is_scratch(path: &Path) -> bool {
    path.to_string_lossy().ends_with(TMP_SUFFIX)
}
