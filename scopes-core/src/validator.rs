//! Pure validation of scope ids, scope records, and whole registries.
//!
//! Nothing here touches the filesystem. Every check collects human-readable
//! reasons into a [`ValidationError`] instead of stopping at the first one.

use std::collections::{BTreeMap, HashSet};

use crate::error::ValidationError;
use crate::types::{RegistrySettings, Scope, ScopeId, ScopeRegistry, REGISTRY_SCHEMA_VERSION};

/// Ids that can never name a scope.
pub const RESERVED_IDS: [&str; 5] = ["_shared", "_events", "_config", "_backup", "global"];

pub const MIN_ID_LEN: usize = 2;
pub const MAX_ID_LEN: usize = 50;

/// Result of a dependency-cycle walk.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CycleReport {
    pub has_circular: bool,
    /// Full path of the cycle, ending in the repeated node. Empty when acyclic.
    pub chain: Vec<ScopeId>,
}

/// Validate a scope id: `^[a-z][a-z0-9-]*[a-z0-9]$`, 2–50 chars, not reserved.
pub fn validate_scope_id(id: &str) -> Result<(), ValidationError> {
    if id.is_empty() {
        return Err(ValidationError::single("scope id is required"));
    }

    let len = id.chars().count();
    if !(MIN_ID_LEN..=MAX_ID_LEN).contains(&len) {
        return Err(ValidationError::single(format!(
            "scope id must be between {MIN_ID_LEN} and {MAX_ID_LEN} characters (got {len})"
        )));
    }

    if RESERVED_IDS.contains(&id) {
        return Err(ValidationError::single(format!(
            "scope id '{id}' is reserved and cannot be used"
        )));
    }

    let bytes = id.as_bytes();
    let body_ok = bytes
        .iter()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-');
    let first_ok = bytes[0].is_ascii_lowercase();
    let last = bytes[bytes.len() - 1];
    let last_ok = last.is_ascii_lowercase() || last.is_ascii_digit();
    if !(body_ok && first_ok && last_ok) {
        return Err(ValidationError::single(format!(
            "scope id '{id}' must start with a lowercase letter, contain only lowercase letters, \
             digits and hyphens, and end with a letter or digit"
        )));
    }

    Ok(())
}

/// Validate one scope record against the full scope map.
///
/// Checks the id, name, dependency existence, self-dependency and
/// (transitively) circular dependencies. `all_scopes` may or may not already
/// contain `scope` itself.
pub fn validate_scope(
    scope: &Scope,
    all_scopes: &BTreeMap<ScopeId, Scope>,
) -> Result<(), ValidationError> {
    let mut errors = Vec::new();

    if let Err(e) = validate_scope_id(scope.id.as_str()) {
        errors.extend(e.errors);
    }

    if scope.name.trim().is_empty() {
        errors.push("scope name is required and must be non-empty".to_string());
    }

    for dep in &scope.dependencies {
        if dep == &scope.id {
            errors.push("scope cannot depend on itself".to_string());
        } else if !all_scopes.contains_key(dep) {
            errors.push(format!("dependency '{dep}' does not exist"));
        }
    }

    let report = detect_circular_dependencies(&scope.id, &scope.dependencies, all_scopes);
    if report.has_circular {
        let chain: Vec<&str> = report.chain.iter().map(ScopeId::as_str).collect();
        errors.push(format!("circular dependency detected: {}", chain.join(" -> ")));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ValidationError::new(errors))
    }
}

/// Depth-first walk from `scope_id` along `dependencies`.
///
/// Each branch carries its own copy of the visited set and chain, so two
/// siblings that share a dependency (a diamond) are not reported as a cycle.
pub fn detect_circular_dependencies(
    scope_id: &ScopeId,
    dependencies: &[ScopeId],
    all_scopes: &BTreeMap<ScopeId, Scope>,
) -> CycleReport {
    walk(scope_id, dependencies, all_scopes, HashSet::new(), Vec::new())
}

fn walk(
    scope_id: &ScopeId,
    dependencies: &[ScopeId],
    all_scopes: &BTreeMap<ScopeId, Scope>,
    mut visited: HashSet<ScopeId>,
    mut chain: Vec<ScopeId>,
) -> CycleReport {
    visited.insert(scope_id.clone());
    chain.push(scope_id.clone());

    for dep in dependencies {
        if visited.contains(dep) {
            let mut cycle = chain;
            cycle.push(dep.clone());
            return CycleReport {
                has_circular: true,
                chain: cycle,
            };
        }

        if let Some(dep_scope) = all_scopes.get(dep) {
            if !dep_scope.dependencies.is_empty() {
                let report = walk(
                    dep,
                    &dep_scope.dependencies,
                    all_scopes,
                    visited.clone(),
                    chain.clone(),
                );
                if report.has_circular {
                    return report;
                }
            }
        }
    }

    CycleReport::default()
}

/// Validate a whole registry: schema version, settings, key/id agreement and
/// every scope against the full map.
pub fn validate_config(registry: &ScopeRegistry) -> Result<(), ValidationError> {
    let mut errors = Vec::new();

    if registry.version == 0 {
        errors.push("registry version is required and must be a positive number".to_string());
    }

    errors.extend(settings_errors(&registry.settings));

    for (key, scope) in &registry.scopes {
        if key != &scope.id {
            errors.push(format!(
                "scope key '{key}' does not match scope.id '{}'",
                scope.id
            ));
        }
        if let Err(e) = validate_scope(scope, &registry.scopes) {
            errors.push(format!("scope '{key}': {e}"));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ValidationError::new(errors))
    }
}

fn settings_errors(settings: &RegistrySettings) -> Vec<String> {
    let mut errors = Vec::new();
    if settings.default_output_base.trim().is_empty() {
        errors.push("default_output_base must be a non-empty path".to_string());
    }
    if settings.default_shared_path.trim().is_empty() {
        errors.push("default_shared_path must be a non-empty path".to_string());
    }
    errors
}

/// Parse and validate raw `scopes.yaml` content.
pub fn validate_yaml_content(content: &str) -> Result<ScopeRegistry, ValidationError> {
    let registry: ScopeRegistry = serde_yaml::from_str(content)
        .map_err(|e| ValidationError::single(format!("failed to parse YAML: {e}")))?;
    validate_config(&registry)?;
    Ok(registry)
}

/// The zero-state registry: schema version 1, default settings, no scopes.
pub fn create_default_config() -> ScopeRegistry {
    ScopeRegistry {
        version: REGISTRY_SCHEMA_VERSION,
        settings: RegistrySettings::default(),
        scopes: BTreeMap::new(),
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
