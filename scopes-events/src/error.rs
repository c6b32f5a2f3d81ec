//! Error types for scopes-events.

use std::path::PathBuf;

use thiserror::Error;

use scopes_core::StateError;

#[derive(Debug, Error)]
pub enum EventError {
    /// Lock or document persistence failure on the event log or
    /// subscriptions file.
    #[error("state error: {0}")]
    State(#[from] StateError),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> EventError {
    EventError::Io {
        path: path.into(),
        source,
    }
}
