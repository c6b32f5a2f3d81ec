//! Error types for scopes-sync.

use std::path::PathBuf;

use thiserror::Error;

use scopes_core::{StateError, ValidationError};

/// Errors that abort a whole sync operation.
///
/// Per-file failures inside a batch are reported in the result instead.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Lock or sync-meta persistence failure.
    #[error("state error: {0}")]
    State(#[from] StateError),

    /// The scope id is malformed or reserved, and cannot name a scope
    /// directory.
    #[error("invalid scope: {0}")]
    Validation(#[from] ValidationError),

    /// The scope has no output directory.
    #[error("scope '{scope}' does not exist (no directory at {path})")]
    ScopeNotFound { scope: String, path: PathBuf },

    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A promotion sidecar could not be serialized.
    #[error("sidecar YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Convenience constructor for [`SyncError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> SyncError {
    SyncError::Io {
        path: path.into(),
        source,
    }
}
