//! Scope registry core: domain types, validation, file locking, access
//! control and the registry manager.
//!
//! - [`types`]: scope, registry and settings structs
//! - [`error`]: [`StateError`], [`ValidationError`], [`ScopeError`]
//! - [`validator`]: pure checks on ids, scopes and registries
//! - [`state_lock`]: `<file>.lock` mutual exclusion and versioned YAML
//! - [`pattern`]: bounded glob matching
//! - [`resolver`]: read-any / write-own decisions
//! - [`layout`]: on-disk path conventions
//! - [`context`]: active scope resolution and project context rendering
//! - [`scaffold`]: scope directory creation and removal
//! - [`manager`]: registry CRUD
//! - [`migrator`]: legacy layout migration, backups and rollback

pub mod context;
pub mod error;
pub mod layout;
pub mod manager;
pub mod migrator;
pub mod pattern;
pub mod resolver;
pub mod scaffold;
pub mod state_lock;
mod tree;
pub mod types;
pub mod validator;

pub use context::{ProjectContext, ScopeContext, ScopeVariables, Session, ACTIVE_SCOPE_ENV};
pub use error::{ScopeError, StateError, ValidationError};
pub use layout::Layout;
pub use manager::{
    DependencyInfo, DependencyTree, NewScope, RegistryCache, RemoveOptions, ScopeManager,
    ScopeUpdate, SettingsUpdate,
};
pub use migrator::{
    BackupInfo, BackupKind, MigrateOptions, MigrationAnalysis, MigrationReport, RestoreFailure,
    RollbackOptions, RollbackReport, ScopeMigrator, DEFAULT_MIGRATION_SCOPE,
};
pub use pattern::{glob_find, glob_match, MatchMode};
pub use resolver::{AccessDecision, ArtifactResolver, ReadablePaths, WritablePaths};
pub use scaffold::{DirScaffold, ScopeScaffold};
pub use state_lock::{
    write_atomic, CorruptionPolicy, LockGuard, LockOptions, LockToken, OptimisticUpdate,
    StateLock, Versioned, LOCK_SUFFIX, TMP_SUFFIX,
};
pub use types::{
    IsolationMode, RegistrySettings, Scope, ScopeId, ScopeMeta, ScopePaths, ScopeRegistry,
    ScopeStatus,
};
