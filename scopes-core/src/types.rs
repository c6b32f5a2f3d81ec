//! Domain types for the scope registry.
//!
//! Absolute and resolved locations are `PathBuf`. Directory names stored in
//! the registry relative to the project root (`default_output_base`,
//! `default_shared_path`) stay plain strings, as written in the YAML.
//! All types are serializable/deserializable via serde + serde_yaml.

use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Directory under the output base that holds promoted artifacts.
pub const SHARED_DIR: &str = "_shared";

/// Default output base, relative to the project root.
pub const DEFAULT_OUTPUT_BASE: &str = "_scopes-output";

/// Schema version written into fresh registries.
pub const REGISTRY_SCHEMA_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// A strongly-typed scope identifier (`auth`, `payments-v2`, …).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ScopeId(pub String);

impl ScopeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for ScopeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ScopeId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl Borrow<str> for ScopeId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for ScopeId {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for ScopeId {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Lifecycle status of a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ScopeStatus {
    #[default]
    Active,
    Archived,
}

impl fmt::Display for ScopeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeStatus::Active => write!(f, "active"),
            ScopeStatus::Archived => write!(f, "archived"),
        }
    }
}

/// Policy for writes that leave the current scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IsolationMode {
    #[default]
    Strict,
    Warn,
    Permissive,
}

impl fmt::Display for IsolationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IsolationMode::Strict => write!(f, "strict"),
            IsolationMode::Warn => write!(f, "warn"),
            IsolationMode::Permissive => write!(f, "permissive"),
        }
    }
}

impl std::str::FromStr for IsolationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "strict" => Ok(Self::Strict),
            "warn" => Ok(Self::Warn),
            "permissive" => Ok(Self::Permissive),
            other => Err(format!(
                "invalid isolation mode '{other}'; expected: strict, warn, permissive"
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Domain structs
// ---------------------------------------------------------------------------

/// Bookkeeping attached to every scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeMeta {
    pub last_activity: DateTime<Utc>,
    #[serde(default)]
    pub artifact_count: u64,
}

/// An isolated unit of work with its own artifact tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scope {
    pub id: ScopeId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: ScopeStatus,
    /// Ordered; every entry must name another registered scope.
    #[serde(default)]
    pub dependencies: Vec<ScopeId>,
    pub created: DateTime<Utc>,
    pub meta: ScopeMeta,
}

impl Scope {
    /// A fresh, active scope with no dependencies and zero artifacts.
    pub fn new(id: impl Into<ScopeId>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            status: ScopeStatus::Active,
            dependencies: vec![],
            created: now,
            meta: ScopeMeta {
                last_activity: now,
                artifact_count: 0,
            },
        }
    }

    pub fn depends_on(&self, other: &str) -> bool {
        self.dependencies.iter().any(|d| d == other)
    }
}

/// Registry-wide settings block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrySettings {
    #[serde(default)]
    pub isolation_mode: IsolationMode,
    #[serde(default = "default_true")]
    pub allow_adhoc_scopes: bool,
    #[serde(default = "default_output_base")]
    pub default_output_base: String,
    #[serde(default = "default_shared_path")]
    pub default_shared_path: String,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            isolation_mode: IsolationMode::Strict,
            allow_adhoc_scopes: true,
            default_output_base: default_output_base(),
            default_shared_path: default_shared_path(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_output_base() -> String {
    DEFAULT_OUTPUT_BASE.to_string()
}

fn default_shared_path() -> String {
    format!("{DEFAULT_OUTPUT_BASE}/{SHARED_DIR}")
}

/// Root of `scopes.yaml`.
///
/// Map keys must equal the `id` of the scope they point at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ScopeRegistry {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub settings: RegistrySettings,
    #[serde(default)]
    pub scopes: BTreeMap<ScopeId, Scope>,
}

/// Directory layout of a single scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopePaths {
    pub root: PathBuf,
    pub planning: PathBuf,
    pub implementation: PathBuf,
    pub tests: PathBuf,
    pub meta: PathBuf,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
