//! Recursive copy, removal and size accounting for scope and backup trees.

use std::fs;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::{scope_io_err, ScopeError};

/// Files under a directory, relative and `/`-joined, plus their total size.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct TreeStats {
    pub files: Vec<String>,
    pub size: u64,
}

/// Copy `src` (file or directory) to `dst`, creating parents. Returns the
/// number of files copied.
pub(crate) fn copy_tree(src: &Path, dst: &Path) -> Result<usize, ScopeError> {
    if src.is_file() {
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).map_err(|e| scope_io_err(parent, e))?;
        }
        fs::copy(src, dst).map_err(|e| scope_io_err(dst, e))?;
        return Ok(1);
    }

    let mut copied = 0;
    for entry in WalkDir::new(src) {
        let entry = entry.map_err(|e| walk_err(src, e))?;
        let Ok(relative) = entry.path().strip_prefix(src) else {
            continue;
        };
        let target = dst.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).map_err(|e| scope_io_err(&target, e))?;
        } else if entry.file_type().is_file() {
            fs::copy(entry.path(), &target).map_err(|e| scope_io_err(&target, e))?;
            copied += 1;
        }
    }
    Ok(copied)
}

/// Delete a file or a whole directory tree. Already gone is fine.
pub(crate) fn remove_path(path: &Path) -> Result<(), ScopeError> {
    let removed = if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match removed {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(scope_io_err(path, e)),
    }
}

/// Every file under `root`. Unreadable entries are skipped.
pub(crate) fn tree_stats(root: &Path) -> TreeStats {
    let mut stats = TreeStats::default();
    for entry in WalkDir::new(root).sort_by_file_name().into_iter().filter_map(Result::ok) {
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        stats.files.push(
            relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/"),
        );
        stats.size += entry.metadata().map(|m| m.len()).unwrap_or(0);
    }
    stats
}

/// Names of the direct children of `dir`, sorted.
pub(crate) fn child_names(dir: &Path) -> Result<Vec<String>, ScopeError> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .map_err(|e| scope_io_err(dir, e))?
        .filter_map(Result::ok)
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    Ok(names)
}

fn walk_err(root: &Path, err: walkdir::Error) -> ScopeError {
    let path: PathBuf = err.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf());
    let source = err
        .into_io_error()
        .unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "filesystem loop"));
    scope_io_err(path, source)
}
