//! Scope registry CRUD.
//!
//! Every mutation runs the same cycle under the registry's lock: strict read,
//! modify, validate the whole registry, versioned write, then drop the
//! in-memory cache. Nothing is written when validation fails.

use std::fs;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use chrono::Utc;

use crate::error::{scope_io_err, ScopeError, ValidationError};
use crate::layout::Layout;
use crate::resolver::ArtifactResolver;
use crate::scaffold::{DirScaffold, ScopeScaffold};
use crate::state_lock::{LockOptions, OptimisticUpdate, StateLock, Versioned};
use crate::types::{
    IsolationMode, RegistrySettings, Scope, ScopeId, ScopePaths, ScopeRegistry, ScopeStatus,
};
use crate::validator::{create_default_config, validate_config, validate_scope, validate_scope_id};

/// How often `update_settings` retries after losing an optimistic race.
const SETTINGS_RETRIES: u32 = 5;

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

/// Fields for a new scope. `name` defaults to the id.
#[derive(Debug, Clone, Default)]
pub struct NewScope {
    pub name: Option<String>,
    pub description: String,
    pub status: ScopeStatus,
    pub dependencies: Vec<ScopeId>,
}

impl NewScope {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ScopeId>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }
}

/// Partial update; `None` leaves a field unchanged. The id is immutable.
#[derive(Debug, Clone, Default)]
pub struct ScopeUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub status: Option<ScopeStatus>,
    pub dependencies: Option<Vec<ScopeId>>,
    pub artifact_count: Option<u64>,
}

/// Partial settings update.
#[derive(Debug, Clone, Default)]
pub struct SettingsUpdate {
    pub isolation_mode: Option<IsolationMode>,
    pub allow_adhoc_scopes: Option<bool>,
    pub default_output_base: Option<String>,
    pub default_shared_path: Option<String>,
}

/// How [`ScopeManager::remove_scope`] treats dependents and directories.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoveOptions {
    /// Remove even when other scopes depend on this one, stripping it from
    /// their dependency lists.
    pub force: bool,
    /// Also delete the scope's output directory.
    pub delete_files: bool,
    /// Copy the directory to `_backup_<id>_<millis>` before deleting it.
    pub backup: bool,
}

impl RemoveOptions {
    pub fn forced() -> Self {
        Self {
            force: true,
            ..Self::default()
        }
    }

    /// Delete the directory too, keeping a backup when `backup` is set.
    pub fn with_files(mut self, backup: bool) -> Self {
        self.delete_files = true;
        self.backup = backup;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyInfo {
    pub scope: ScopeId,
    pub name: String,
    pub status: ScopeStatus,
}

/// Direct dependencies and direct dependents of one scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyTree {
    pub scope: ScopeId,
    pub dependencies: Vec<DependencyInfo>,
    pub dependents: Vec<ScopeId>,
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

/// Per-manager copy of the last registry read from disk.
///
/// Never authoritative: mutations always re-read under the lock.
#[derive(Debug, Default)]
pub struct RegistryCache {
    inner: Mutex<Option<ScopeRegistry>>,
}

impl RegistryCache {
    pub fn get(&self) -> Option<ScopeRegistry> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn store(&self, registry: ScopeRegistry) {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner) = Some(registry);
    }

    pub fn invalidate(&self) {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

pub struct ScopeManager {
    layout: Layout,
    lock: StateLock,
    cache: RegistryCache,
    scaffold: Box<dyn ScopeScaffold>,
}

impl ScopeManager {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            layout: Layout::new(project_root),
            lock: StateLock::default(),
            cache: RegistryCache::default(),
            scaffold: Box::new(DirScaffold),
        }
    }

    pub fn with_lock_options(mut self, options: LockOptions) -> Self {
        self.lock = StateLock::new(options);
        self
    }

    pub fn with_scaffold(mut self, scaffold: Box<dyn ScopeScaffold>) -> Self {
        self.scaffold = scaffold;
        self
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn registry_path(&self) -> PathBuf {
        self.layout.registry_path()
    }

    /// Create `scopes.yaml` with the default configuration if absent and make
    /// sure the shared layer and events directory exist.
    pub fn initialize(&self) -> Result<ScopeRegistry, ScopeError> {
        let path = self.registry_path();
        let config_dir = self.layout.config_dir();
        fs::create_dir_all(&config_dir).map_err(|e| scope_io_err(&config_dir, e))?;

        if !path.exists() {
            self.lock.with_lock(&path, || -> Result<(), ScopeError> {
                if path.exists() {
                    return Ok(());
                }
                let mut doc = Versioned::new(create_default_config());
                self.lock.write_yaml(&path, &mut doc)?;
                tracing::info!(path = %path.display(), "created scope registry");
                Ok(())
            })?;
        }

        let registry = self.load_registry(true)?;
        self.scaffold
            .initialize_system(&self.output_layout(&registry.settings))?;
        Ok(registry)
    }

    /// The registry, from cache unless `force_reload`.
    pub fn load_registry(&self, force_reload: bool) -> Result<ScopeRegistry, ScopeError> {
        if !force_reload {
            if let Some(cached) = self.cache.get() {
                return Ok(cached);
            }
        }
        let path = self.registry_path();
        if !path.exists() {
            return Err(ScopeError::NotInitialized { path });
        }
        let doc: Versioned<ScopeRegistry> = self.lock.read_yaml_strict(&path)?;
        validate_config(&doc.data)?;
        self.cache.store(doc.data.clone());
        Ok(doc.data)
    }

    // -- queries ------------------------------------------------------------

    /// All scopes, newest first, optionally filtered by status.
    pub fn list_scopes(&self, status: Option<ScopeStatus>) -> Result<Vec<Scope>, ScopeError> {
        let registry = self.load_registry(false)?;
        let mut scopes: Vec<Scope> = registry
            .scopes
            .into_values()
            .filter(|s| status.map_or(true, |wanted| s.status == wanted))
            .collect();
        scopes.sort_by(|a, b| b.created.cmp(&a.created));
        Ok(scopes)
    }

    pub fn get_scope(&self, id: &str) -> Result<Option<Scope>, ScopeError> {
        Ok(self.load_registry(false)?.scopes.remove(id))
    }

    /// `false` on any error, including an uninitialized registry.
    pub fn scope_exists(&self, id: &str) -> bool {
        matches!(self.get_scope(id), Ok(Some(_)))
    }

    pub fn dependency_tree(&self, id: &str) -> Result<DependencyTree, ScopeError> {
        let registry = self.load_registry(false)?;
        let scope = registry.scopes.get(id).ok_or_else(|| not_found(id))?;
        let dependencies = scope
            .dependencies
            .iter()
            .filter_map(|dep| registry.scopes.get(dep))
            .map(|dep| DependencyInfo {
                scope: dep.id.clone(),
                name: dep.name.clone(),
                status: dep.status,
            })
            .collect();
        Ok(DependencyTree {
            scope: scope.id.clone(),
            dependencies,
            dependents: dependents_of(id, &registry),
        })
    }

    pub fn find_dependent_scopes(&self, id: &str) -> Result<Vec<ScopeId>, ScopeError> {
        Ok(dependents_of(id, &self.load_registry(false)?))
    }

    pub fn scope_paths(&self, id: &str) -> Result<ScopePaths, ScopeError> {
        let registry = self.load_registry(false)?;
        if !registry.scopes.contains_key(id) {
            return Err(not_found(id));
        }
        Ok(self.output_layout(&registry.settings).scope_paths(id))
    }

    /// Substitute `{scope}` and `{output_folder}` in a path template.
    pub fn resolve_path(&self, template: &str, scope: &str) -> String {
        let output_base = self
            .cache
            .get()
            .map(|r| r.settings.default_output_base)
            .unwrap_or_else(|| self.layout.output_base().to_string());
        template
            .replace("{scope}", scope)
            .replace("{output_folder}", &output_base)
    }

    pub fn settings(&self) -> Result<RegistrySettings, ScopeError> {
        Ok(self.load_registry(false)?.settings)
    }

    /// A resolver configured from the registry's isolation mode and output
    /// base, with `current` as the active scope.
    pub fn artifact_resolver(
        &self,
        current: Option<ScopeId>,
    ) -> Result<ArtifactResolver, ScopeError> {
        let settings = self.settings()?;
        Ok(ArtifactResolver::new(
            current,
            settings.isolation_mode,
            settings.default_output_base,
        ))
    }

    // -- mutations ----------------------------------------------------------

    pub fn create_scope(&self, id: &str, new: NewScope) -> Result<Scope, ScopeError> {
        validate_scope_id(id)?;

        let (scope, settings) = self.mutate(|registry| {
            if registry.scopes.contains_key(id) {
                return Err(ScopeError::AlreadyExists { id: id.into() });
            }
            let mut scope = Scope::new(id, new.name.unwrap_or_else(|| id.to_string()));
            scope.description = new.description;
            scope.status = new.status;
            scope.dependencies = new.dependencies;
            validate_scope(&scope, &registry.scopes)?;
            registry.scopes.insert(scope.id.clone(), scope.clone());
            Ok((scope, registry.settings.clone()))
        })?;

        self.scaffold
            .initialize_scope(&self.output_layout(&settings), &scope)?;
        tracing::info!(scope = %scope.id, "created scope");
        Ok(scope)
    }

    /// Merge `update` into the scope. Always refreshes `last_activity`.
    pub fn update_scope(&self, id: &str, update: ScopeUpdate) -> Result<Scope, ScopeError> {
        let scope = self.mutate(|registry| {
            let mut scope = registry
                .scopes
                .get(id)
                .cloned()
                .ok_or_else(|| not_found(id))?;
            if let Some(name) = update.name {
                scope.name = name;
            }
            if let Some(description) = update.description {
                scope.description = description;
            }
            if let Some(status) = update.status {
                scope.status = status;
            }
            if let Some(dependencies) = update.dependencies {
                scope.dependencies = dependencies;
            }
            if let Some(count) = update.artifact_count {
                scope.meta.artifact_count = count;
            }
            scope.meta.last_activity = Utc::now();
            validate_scope(&scope, &registry.scopes)?;
            registry.scopes.insert(scope.id.clone(), scope.clone());
            Ok(scope)
        })?;
        tracing::info!(scope = %scope.id, status = %scope.status, "updated scope");
        Ok(scope)
    }

    /// Remove a scope from the registry and, with
    /// [`delete_files`](RemoveOptions::delete_files), its output directory.
    /// Returns the backup location when one was taken.
    ///
    /// Refuses while other scopes depend on it unless `force`, in which case
    /// the id is stripped from every dependent's dependency list. The registry
    /// entry goes first; a scope without a directory is not an error.
    pub fn remove_scope(
        &self,
        id: &str,
        options: RemoveOptions,
    ) -> Result<Option<PathBuf>, ScopeError> {
        let (stripped, settings) = self.mutate(|registry| {
            if !registry.scopes.contains_key(id) {
                return Err(not_found(id));
            }
            let dependents = dependents_of(id, registry);
            if !dependents.is_empty() && !options.force {
                return Err(ScopeError::HasDependents {
                    id: id.into(),
                    dependents,
                });
            }
            registry.scopes.remove(id);
            for dependent in &dependents {
                if let Some(scope) = registry.scopes.get_mut(dependent) {
                    scope.dependencies.retain(|d| d != id);
                }
            }
            Ok((dependents, registry.settings.clone()))
        })?;
        if stripped.is_empty() {
            tracing::info!(scope = id, "removed scope");
        } else {
            tracing::info!(scope = id, dependents = ?stripped, "force-removed scope");
        }

        if !options.delete_files {
            return Ok(None);
        }
        let layout = self.output_layout(&settings);
        if !layout.scope_dir(id).is_dir() {
            tracing::debug!(scope = id, "no scope directory to delete");
            return Ok(None);
        }
        self.scaffold.remove_scope(&layout, id, options.backup)
    }

    pub fn archive_scope(&self, id: &str) -> Result<Scope, ScopeError> {
        self.update_scope(
            id,
            ScopeUpdate {
                status: Some(ScopeStatus::Archived),
                ..Default::default()
            },
        )
    }

    pub fn activate_scope(&self, id: &str) -> Result<Scope, ScopeError> {
        self.update_scope(
            id,
            ScopeUpdate {
                status: Some(ScopeStatus::Active),
                ..Default::default()
            },
        )
    }

    pub fn touch_scope(&self, id: &str) -> Result<Scope, ScopeError> {
        self.update_scope(id, ScopeUpdate::default())
    }

    /// Add `delta` (may be negative) to the artifact count, atomically with
    /// respect to other writers. The count never drops below zero.
    pub fn increment_artifact_count(&self, id: &str, delta: i64) -> Result<Scope, ScopeError> {
        self.mutate(|registry| {
            let scope = registry.scopes.get_mut(id).ok_or_else(|| not_found(id))?;
            let current = i64::try_from(scope.meta.artifact_count).unwrap_or(i64::MAX);
            let next = current.saturating_add(delta);
            let next = u64::try_from(next).map_err(|_| {
                ValidationError::single(format!(
                    "artifact_count for '{id}' cannot become negative ({current} + {delta})"
                ))
            })?;
            scope.meta.artifact_count = next;
            scope.meta.last_activity = Utc::now();
            Ok(scope.clone())
        })
    }

    /// Merge `update` into the settings with a compare-and-swap write,
    /// retrying when another writer got there first.
    pub fn update_settings(&self, update: SettingsUpdate) -> Result<RegistrySettings, ScopeError> {
        let path = self.registry_path();
        if !path.exists() {
            return Err(ScopeError::NotInitialized { path });
        }

        for attempt in 0..SETTINGS_RETRIES {
            let current: Versioned<ScopeRegistry> = self.lock.read_yaml_strict(&path)?;
            let mut registry = current.data;
            apply_settings(&mut registry.settings, &update);
            validate_config(&registry)?;
            let settings = registry.settings.clone();

            match self.lock.optimistic_update(&path, current.version, registry)? {
                OptimisticUpdate::Applied { version } => {
                    self.cache.invalidate();
                    tracing::info!(version, "updated registry settings");
                    return Ok(settings);
                }
                OptimisticUpdate::Conflict { current } => {
                    tracing::debug!(attempt, found = current.version, "settings update raced, retrying");
                }
            }
        }

        Err(ScopeError::ConcurrentModification {
            path,
            attempts: SETTINGS_RETRIES,
        })
    }

    // -- internals ----------------------------------------------------------

    /// Lock, strict-read, apply `op`, validate, write, invalidate the cache.
    fn mutate<T, F>(&self, op: F) -> Result<T, ScopeError>
    where
        F: FnOnce(&mut ScopeRegistry) -> Result<T, ScopeError>,
    {
        let path = self.registry_path();
        if !path.exists() {
            return Err(ScopeError::NotInitialized { path });
        }
        let result = self.lock.with_lock(&path, || -> Result<T, ScopeError> {
            let mut doc: Versioned<ScopeRegistry> = self.lock.read_yaml_strict(&path)?;
            let out = op(&mut doc.data)?;
            validate_config(&doc.data)?;
            self.lock.write_yaml(&path, &mut doc)?;
            Ok(out)
        });
        if result.is_ok() {
            self.cache.invalidate();
        }
        result
    }

    fn output_layout(&self, settings: &RegistrySettings) -> Layout {
        self.layout
            .clone()
            .with_output_base(settings.default_output_base.clone())
    }
}

fn apply_settings(settings: &mut RegistrySettings, update: &SettingsUpdate) {
    if let Some(mode) = update.isolation_mode {
        settings.isolation_mode = mode;
    }
    if let Some(adhoc) = update.allow_adhoc_scopes {
        settings.allow_adhoc_scopes = adhoc;
    }
    if let Some(base) = &update.default_output_base {
        settings.default_output_base = base.clone();
    }
    if let Some(shared) = &update.default_shared_path {
        settings.default_shared_path = shared.clone();
    }
}

fn dependents_of(id: &str, registry: &ScopeRegistry) -> Vec<ScopeId> {
    registry
        .scopes
        .values()
        .filter(|s| s.depends_on(id))
        .map(|s| s.id.clone())
        .collect()
}

fn not_found(id: &str) -> ScopeError {
    ScopeError::NotFound { id: id.into() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;

    fn manager() -> (TempDir, ScopeManager) {
        let dir = TempDir::new().unwrap();
        let mgr = ScopeManager::new(dir.path()).with_lock_options(
            LockOptions::default().with_backoff(Duration::from_millis(1), Duration::from_millis(5)),
        );
        mgr.initialize().unwrap();
        (dir, mgr)
    }

    #[test]
    fn uninitialized_registry_is_reported() {
        let dir = TempDir::new().unwrap();
        let mgr = ScopeManager::new(dir.path());
        assert!(matches!(
            mgr.load_registry(false),
            Err(ScopeError::NotInitialized { .. })
        ));
        assert!(!mgr.scope_exists("auth"));
    }

    #[test]
    fn initialize_is_idempotent() {
        let (_dir, mgr) = manager();
        mgr.create_scope("auth", NewScope::default()).unwrap();
        let registry = mgr.initialize().unwrap();
        assert!(registry.scopes.contains_key("auth"));
    }

    #[test]
    fn duplicate_and_invalid_ids_are_rejected() {
        let (_dir, mgr) = manager();
        mgr.create_scope("auth", NewScope::default()).unwrap();
        assert!(matches!(
            mgr.create_scope("auth", NewScope::default()),
            Err(ScopeError::AlreadyExists { .. })
        ));
        assert!(matches!(
            mgr.create_scope("_shared", NewScope::default()),
            Err(ScopeError::Validation(_))
        ));
    }

    #[test]
    fn unknown_dependency_writes_nothing() {
        let (_dir, mgr) = manager();
        let err = mgr
            .create_scope("payments", NewScope::default().with_dependencies(["auth"]))
            .unwrap_err();
        assert!(err.to_string().contains("'auth' does not exist"));
        assert!(mgr.list_scopes(None).unwrap().is_empty());
    }

    #[test]
    fn update_cannot_introduce_cycle() {
        let (_dir, mgr) = manager();
        mgr.create_scope("auth", NewScope::default()).unwrap();
        mgr.create_scope("payments", NewScope::default().with_dependencies(["auth"]))
            .unwrap();
        let err = mgr
            .update_scope(
                "auth",
                ScopeUpdate {
                    dependencies: Some(vec!["payments".into()]),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(err.to_string().contains("circular"), "got: {err}");
    }

    #[test]
    fn archive_activate_and_filter() {
        let (_dir, mgr) = manager();
        mgr.create_scope("auth", NewScope::named("Authentication")).unwrap();
        mgr.create_scope("payments", NewScope::default()).unwrap();

        let archived = mgr.archive_scope("auth").unwrap();
        assert_eq!(archived.status, ScopeStatus::Archived);
        assert_eq!(archived.name, "Authentication");

        let active = mgr.list_scopes(Some(ScopeStatus::Active)).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "payments");

        mgr.activate_scope("auth").unwrap();
        assert_eq!(mgr.list_scopes(Some(ScopeStatus::Active)).unwrap().len(), 2);
    }

    #[test]
    fn artifact_count_never_negative() {
        let (_dir, mgr) = manager();
        mgr.create_scope("auth", NewScope::default()).unwrap();
        assert_eq!(mgr.increment_artifact_count("auth", 3).unwrap().meta.artifact_count, 3);
        assert_eq!(mgr.increment_artifact_count("auth", -2).unwrap().meta.artifact_count, 1);
        assert!(matches!(
            mgr.increment_artifact_count("auth", -5),
            Err(ScopeError::Validation(_))
        ));
        assert_eq!(mgr.get_scope("auth").unwrap().unwrap().meta.artifact_count, 1);
    }

    #[test]
    fn cache_is_invalidated_on_write() {
        let (_dir, mgr) = manager();
        mgr.create_scope("auth", NewScope::default()).unwrap();
        assert!(mgr.scope_exists("auth"));
        mgr.remove_scope("auth", RemoveOptions::default()).unwrap();
        assert!(!mgr.scope_exists("auth"));
    }

    #[test]
    fn settings_update_validates_and_persists() {
        let (_dir, mgr) = manager();
        let settings = mgr
            .update_settings(SettingsUpdate {
                isolation_mode: Some(IsolationMode::Warn),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(settings.isolation_mode, IsolationMode::Warn);
        assert_eq!(mgr.settings().unwrap().isolation_mode, IsolationMode::Warn);

        let err = mgr
            .update_settings(SettingsUpdate {
                default_output_base: Some("  ".into()),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, ScopeError::Validation(_)));
    }

    #[test]
    fn dependency_tree_and_paths() {
        let (dir, mgr) = manager();
        mgr.create_scope("auth", NewScope::default()).unwrap();
        mgr.create_scope("payments", NewScope::default().with_dependencies(["auth"]))
            .unwrap();

        let tree = mgr.dependency_tree("auth").unwrap();
        assert!(tree.dependencies.is_empty());
        assert_eq!(tree.dependents, vec![ScopeId::from("payments")]);

        let tree = mgr.dependency_tree("payments").unwrap();
        assert_eq!(tree.dependencies[0].scope, "auth");

        let paths = mgr.scope_paths("payments").unwrap();
        assert_eq!(paths.root, dir.path().join("_scopes-output").join("payments"));
        assert!(paths.planning.is_dir());
        assert!(matches!(mgr.scope_paths("nope"), Err(ScopeError::NotFound { .. })));
    }

    #[test]
    fn resolve_path_substitutes_placeholders() {
        let (_dir, mgr) = manager();
        mgr.load_registry(false).unwrap();
        assert_eq!(
            mgr.resolve_path("{output_folder}/{scope}/prd.md", "auth"),
            "_scopes-output/auth/prd.md"
        );
    }

    #[test]
    fn resolver_uses_registry_settings() {
        let (_dir, mgr) = manager();
        mgr.update_settings(SettingsUpdate {
            isolation_mode: Some(IsolationMode::Permissive),
            ..Default::default()
        })
        .unwrap();
        let resolver = mgr.artifact_resolver(Some("auth".into())).unwrap();
        assert_eq!(resolver.isolation_mode(), IsolationMode::Permissive);
        assert!(resolver
            .can_write(Path::new("_scopes-output/payments/x.md"))
            .allowed);
    }
}
