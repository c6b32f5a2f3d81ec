//! Error types for scopes-core.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::ScopeId;

/// Failures of the lock and versioned-document layer.
#[derive(Debug, Error)]
pub enum StateError {
    /// Underlying I/O failure, annotated with the file involved.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The bounded retry/backoff budget ran out while the lock was held elsewhere.
    #[error("failed to acquire lock on {path} after {attempts} attempts")]
    LockAcquisition { path: PathBuf, attempts: u32 },

    /// A state file exists but does not parse (strict reads only).
    #[error("failed to parse state file at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// YAML serialization error (write path).
    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization error (lock token).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// One or more reasons a scope id, scope record, or registry is invalid.
///
/// Validation is all-or-nothing: nothing is written when this is returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}", .errors.join("; "))]
pub struct ValidationError {
    pub errors: Vec<String>,
}

impl ValidationError {
    pub fn new(errors: Vec<String>) -> Self {
        Self { errors }
    }

    pub fn single(error: impl Into<String>) -> Self {
        Self {
            errors: vec![error.into()],
        }
    }
}

/// All errors that can arise from registry and scope operations.
#[derive(Debug, Error)]
pub enum ScopeError {
    #[error("state error: {0}")]
    State(#[from] StateError),

    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("scope '{id}' does not exist")]
    NotFound { id: ScopeId },

    #[error("scope '{id}' already exists")]
    AlreadyExists { id: ScopeId },

    #[error(
        "cannot remove scope '{id}': depended on by {}; use force to remove anyway",
        join_ids(.dependents)
    )]
    HasDependents { id: ScopeId, dependents: Vec<ScopeId> },

    /// `scopes.yaml` is missing; `initialize` has not run.
    #[error("scope registry not found at {path}; run initialize first")]
    NotInitialized { path: PathBuf },

    /// A scope or backup directory that an operation needs is absent.
    #[error("directory {path} does not exist")]
    MissingDirectory { path: PathBuf },

    #[error("write denied for {path}: {reason}")]
    AccessDenied { path: PathBuf, reason: String },

    /// Optimistic updates kept losing to concurrent writers.
    #[error("gave up updating {path} after {attempts} concurrent modifications")]
    ConcurrentModification { path: PathBuf, attempts: u32 },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn join_ids(ids: &[ScopeId]) -> String {
    ids.iter().map(ScopeId::as_str).collect::<Vec<_>>().join(", ")
}

/// Convenience constructor for [`StateError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> StateError {
    StateError::Io {
        path: path.into(),
        source,
    }
}

/// Convenience constructor for [`ScopeError::Io`].
pub(crate) fn scope_io_err(path: impl Into<PathBuf>, source: std::io::Error) -> ScopeError {
    ScopeError::Io {
        path: path.into(),
        source,
    }
}
