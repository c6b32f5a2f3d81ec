//! Read-any / write-own access decisions for artifact paths.
//!
//! [`ArtifactResolver`] holds only the current scope, the isolation mode and
//! the output base. Every decision is recomputed from those and the path; no
//! filesystem access happens here.

use std::path::{Component, Path, PathBuf};

use crate::error::ScopeError;
use crate::types::{IsolationMode, ScopeId, DEFAULT_OUTPUT_BASE, SHARED_DIR};

/// First-level directories under the output base that are not scopes.
pub const RESERVED_PATHS: &[&str] = &[SHARED_DIR, "_events", "_config", "_backup"];

/// Outcome of an access check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessDecision {
    pub allowed: bool,
    pub reason: String,
    /// Set when the write is allowed but crosses a scope boundary.
    pub warning: Option<String>,
}

impl AccessDecision {
    fn allow(reason: impl Into<String>) -> Self {
        Self {
            allowed: true,
            reason: reason.into(),
            warning: None,
        }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
            warning: None,
        }
    }

    fn allow_with_warning(reason: impl Into<String>, warning: impl Into<String>) -> Self {
        Self {
            allowed: true,
            reason: reason.into(),
            warning: Some(warning.into()),
        }
    }
}

/// Paths a scope may read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadablePaths {
    pub current_scope: Option<PathBuf>,
    pub shared: PathBuf,
    /// Glob covering every scope directory.
    pub all_scopes: String,
}

/// Paths a scope may write to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WritablePaths {
    /// No scope active: the whole output base is writable.
    All(PathBuf),
    Scope(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactResolver {
    current_scope: Option<ScopeId>,
    isolation_mode: IsolationMode,
    output_base: PathBuf,
}

impl Default for ArtifactResolver {
    fn default() -> Self {
        Self::new(None, IsolationMode::default(), DEFAULT_OUTPUT_BASE)
    }
}

impl ArtifactResolver {
    pub fn new(
        current_scope: Option<ScopeId>,
        isolation_mode: IsolationMode,
        output_base: impl Into<PathBuf>,
    ) -> Self {
        Self {
            current_scope,
            isolation_mode,
            output_base: output_base.into(),
        }
    }

    pub fn current_scope(&self) -> Option<&ScopeId> {
        self.current_scope.as_ref()
    }

    pub fn set_current_scope(&mut self, scope: Option<ScopeId>) {
        self.current_scope = scope;
    }

    pub fn isolation_mode(&self) -> IsolationMode {
        self.isolation_mode
    }

    pub fn set_isolation_mode(&mut self, mode: IsolationMode) {
        self.isolation_mode = mode;
    }

    pub fn output_base(&self) -> &Path {
        &self.output_base
    }

    /// The first path component after the output base, if the path lies
    /// under it. Reserved directory names are returned as-is.
    ///
    /// The output base may appear anywhere in the path, so both
    /// `/abs/project/_scopes-output/auth/x.md` and `_scopes-output/auth/x.md`
    /// resolve to `auth`.
    pub fn extract_scope_from_path(&self, path: &Path) -> Option<String> {
        let base = normalized(&self.output_base);
        let target = normalized(path);
        if base.is_empty() || target.len() <= base.len() {
            return None;
        }
        target
            .windows(base.len())
            .position(|window| window == base.as_slice())
            .and_then(|idx| target.get(idx + base.len()))
            .cloned()
    }

    pub fn is_shared_path(&self, path: &Path) -> bool {
        self.extract_scope_from_path(path).as_deref() == Some(SHARED_DIR)
    }

    pub fn is_reserved_path(&self, path: &Path) -> bool {
        self.extract_scope_from_path(path)
            .is_some_and(|segment| RESERVED_PATHS.contains(&segment.as_str()))
    }

    /// Reads are never restricted.
    pub fn can_read(&self, _path: &Path) -> AccessDecision {
        AccessDecision::allow("read access is always allowed")
    }

    pub fn can_write(&self, path: &Path) -> AccessDecision {
        let Some(current) = &self.current_scope else {
            return AccessDecision::allow("no scope active, operating in legacy mode");
        };

        let Some(target) = self.extract_scope_from_path(path) else {
            return AccessDecision::allow("path is outside the scope system");
        };

        if target == SHARED_DIR {
            return AccessDecision::deny(format!(
                "cannot write directly to '{SHARED_DIR}'; promote with sync-up instead"
            ));
        }

        if RESERVED_PATHS.contains(&target.as_str()) && *current != target.as_str() {
            return AccessDecision::deny(format!("cannot write to reserved path '{target}'"));
        }

        if *current == target.as_str() {
            return AccessDecision::allow(format!("write allowed to current scope '{current}'"));
        }

        match self.isolation_mode {
            IsolationMode::Strict => AccessDecision::deny(format!(
                "cannot write to scope '{target}' while in scope '{current}'"
            )),
            IsolationMode::Warn => AccessDecision::allow_with_warning(
                "write allowed with warning in warn mode",
                format!("writing to scope '{target}' from scope '{current}'"),
            ),
            IsolationMode::Permissive => AccessDecision::allow("write allowed in permissive mode"),
        }
    }

    /// [`can_write`](Self::can_write), turned into an error on deny. Warnings
    /// are logged and the decision is returned.
    pub fn validate_write(&self, path: &Path) -> Result<AccessDecision, ScopeError> {
        let decision = self.can_write(path);
        if !decision.allowed {
            return Err(ScopeError::AccessDenied {
                path: path.to_path_buf(),
                reason: decision.reason,
            });
        }
        if let Some(warning) = &decision.warning {
            tracing::warn!(path = %path.display(), "{warning}");
        }
        Ok(decision)
    }

    /// `relative` inside `scope`, or inside the current scope when `None`.
    /// Without any scope the path is rooted at the output base.
    pub fn resolve_scope_path(&self, relative: impl AsRef<Path>, scope: Option<&str>) -> PathBuf {
        match scope.or(self.current_scope.as_ref().map(ScopeId::as_str)) {
            Some(scope) => self.output_base.join(scope).join(relative),
            None => self.output_base.join(relative),
        }
    }

    pub fn resolve_shared_path(&self, relative: impl AsRef<Path>) -> PathBuf {
        self.output_base.join(SHARED_DIR).join(relative)
    }

    pub fn readable_paths(&self) -> ReadablePaths {
        ReadablePaths {
            current_scope: self
                .current_scope
                .as_ref()
                .map(|s| self.output_base.join(s.as_str())),
            shared: self.output_base.join(SHARED_DIR),
            all_scopes: format!("{}/*", self.output_base.display()),
        }
    }

    pub fn writable_paths(&self) -> WritablePaths {
        match &self.current_scope {
            Some(scope) => WritablePaths::Scope(self.output_base.join(scope.as_str())),
            None => WritablePaths::All(self.output_base.clone()),
        }
    }

    /// A closure resolving relative paths inside `scope`.
    pub fn scoped_resolver(&self, scope: &str) -> impl Fn(&str) -> PathBuf {
        let root = self.output_base.join(scope);
        move |relative| root.join(relative)
    }
}

/// Lexically normalized normal components (`.` dropped, `..` pops).
fn normalized(path: &Path) -> Vec<String> {
    let mut parts: Vec<String> = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::ParentDir => {
                parts.pop();
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }
    parts
}
