//! # scopes-sync
//!
//! Moves artifacts between scopes through the shared layer.
//!
//! [`ScopeSync::sync_up`] promotes a scope's artifacts into
//! `<output>/_shared/<scope>/`, writing a versioned `.meta` sidecar beside
//! each one. [`ScopeSync::sync_down`] mirrors every other scope's shared
//! artifacts into `<output>/<scope>/shared/`, and
//! [`ScopeSync::resolve_conflict`] settles files edited on both sides.

pub mod engine;
pub mod error;
pub mod hash;
pub mod meta;
mod promote;
mod pull;
pub mod resolve;
pub mod writer;

pub use engine::{
    FileError, PromoteConflict, Promoted, PullConflict, Pulled, ScopeSync, SkipReason, Skipped,
    SyncDownResult, SyncOptions, SyncStatus, SyncUpResult, UpToDate, DEFAULT_PROMOTABLE_PATTERNS,
};
pub use error::SyncError;
pub use meta::{PromotionRecord, SyncMeta};
pub use resolve::{ConflictStrategy, Resolution};
