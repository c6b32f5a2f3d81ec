//! Session-sticky active scope.
//!
//! Resolution precedence is explicit value, then the `.active-scope` session
//! file, then the `SCOPES_ACTIVE` environment variable.
//!
//! Also renders what an agent or shell needs to work inside a scope: the
//! merged project context, a Markdown snippet and `export` lines.

use std::fs;
use std::io::ErrorKind;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{scope_io_err, ScopeError, StateError};
use crate::layout::{Layout, IMPLEMENTATION_DIR, PLANNING_DIR, PROJECT_CONTEXT_FILE, TESTS_DIR};
use crate::state_lock::write_atomic;
use crate::types::ScopeId;
use crate::validator::validate_scope_id;

/// Environment variable consulted when neither an explicit scope nor a
/// session file is present.
pub const ACTIVE_SCOPE_ENV: &str = "SCOPES_ACTIVE";

/// Heading that separates global from scope context in
/// [`ProjectContext::merged`].
const SCOPE_CONTEXT_HEADING: &str = "## Scope-Specific Context";

/// Content of the session file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub active_scope: ScopeId,
    pub set_at: DateTime<Utc>,
    #[serde(default)]
    pub set_by: String,
}

/// Template variables describing a scope's directories, relative to the
/// project root. All empty when no scope is active.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScopeVariables {
    pub scope: String,
    pub scope_path: PathBuf,
    pub scope_planning: PathBuf,
    pub scope_implementation: PathBuf,
    pub scope_tests: PathBuf,
}

/// `project-context.md` from the shared layer and from one scope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProjectContext {
    pub global: Option<String>,
    pub scope: Option<String>,
    /// Scope context appended to the global one under its own heading, or
    /// whichever of the two exists. Empty when neither does.
    pub merged: String,
}

impl ProjectContext {
    fn merge(global: Option<String>, scope: Option<String>) -> Self {
        let merged = match (&global, &scope) {
            (Some(g), Some(s)) => format!("{g}\n\n---\n\n{SCOPE_CONTEXT_HEADING}\n\n{s}"),
            (Some(g), None) => g.clone(),
            (None, Some(s)) => s.clone(),
            (None, None) => String::new(),
        };
        Self {
            global,
            scope,
            merged,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScopeContext {
    layout: Layout,
}

impl ScopeContext {
    pub fn new(layout: Layout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// The session record, or `None` when absent or unreadable.
    pub fn session(&self) -> Option<Session> {
        let path = self.layout.session_path();
        let contents = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "session file unreadable");
                return None;
            }
        };
        match serde_yaml::from_str(&contents) {
            Ok(session) => Some(session),
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "ignoring malformed session file");
                None
            }
        }
    }

    pub fn current_scope(&self) -> Option<ScopeId> {
        self.session().map(|s| s.active_scope)
    }

    pub fn has_scope(&self) -> bool {
        self.current_scope().is_some()
    }

    /// Persist `scope` as the session's active scope.
    pub fn set_scope(&self, scope: &str) -> Result<Session, ScopeError> {
        validate_scope_id(scope)?;
        let session = Session {
            active_scope: ScopeId::from(scope),
            set_at: Utc::now(),
            set_by: std::env::var("USER").unwrap_or_else(|_| "unknown".to_string()),
        };
        let yaml = serde_yaml::to_string(&session).map_err(StateError::from)?;
        write_atomic(&self.layout.session_path(), yaml.as_bytes())?;
        tracing::info!(scope = %session.active_scope, "active scope set");
        Ok(session)
    }

    /// Remove the session file. Absent counts as cleared.
    pub fn clear_scope(&self) -> Result<(), ScopeError> {
        let path = self.layout.session_path();
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(scope_io_err(path, e)),
        }
    }

    /// Resolve using the process environment for the last fallback.
    pub fn resolve_scope(&self, explicit: Option<&str>) -> Option<ScopeId> {
        let env = std::env::var(ACTIVE_SCOPE_ENV).ok();
        self.resolve_scope_with_env(explicit, env.as_deref())
    }

    /// Resolve with an explicit environment value instead of reading
    /// `SCOPES_ACTIVE`. Empty strings count as unset.
    pub fn resolve_scope_with_env(
        &self,
        explicit: Option<&str>,
        env: Option<&str>,
    ) -> Option<ScopeId> {
        if let Some(scope) = explicit.filter(|s| !s.is_empty()) {
            return Some(ScopeId::from(scope));
        }
        if let Some(scope) = self.current_scope() {
            return Some(scope);
        }
        if let Some(scope) = env.filter(|s| !s.is_empty()) {
            return Some(ScopeId::from(scope));
        }
        tracing::debug!("no active scope; writes fall back to the output base");
        None
    }

    /// Variables for `scope`, or for the session's scope when `None`.
    pub fn scope_variables(&self, scope: Option<&str>) -> ScopeVariables {
        let scope = match scope {
            Some(s) => ScopeId::from(s),
            None => match self.current_scope() {
                Some(s) => s,
                None => return ScopeVariables::default(),
            },
        };
        let base = PathBuf::from(self.layout.output_base()).join(scope.as_str());
        ScopeVariables {
            scope: scope.0,
            scope_planning: base.join(PLANNING_DIR),
            scope_implementation: base.join(IMPLEMENTATION_DIR),
            scope_tests: base.join(TESTS_DIR),
            scope_path: base,
        }
    }
}

impl ScopeContext {
    /// Global and scope project context for `scope`, or the session's scope
    /// when `None`. Missing files are simply absent.
    pub fn load_project_context(&self, scope: Option<&str>) -> Result<ProjectContext, ScopeError> {
        let global = read_optional(&self.layout.shared_dir().join(PROJECT_CONTEXT_FILE))?;
        let scope_text = match self.pick_scope(scope)? {
            Some(id) => {
                read_optional(&self.layout.scope_dir(id.as_str()).join(PROJECT_CONTEXT_FILE))?
            }
            None => None,
        };
        Ok(ProjectContext::merge(global, scope_text))
    }

    /// Markdown block describing the active scope, for prepending to a
    /// prompt or document.
    pub fn context_snippet(&self, scope: Option<&str>) -> Result<String, ScopeError> {
        let Some(id) = self.pick_scope(scope)? else {
            return Ok("<!-- No scope context active -->".to_string());
        };
        let vars = self.scope_variables(Some(id.as_str()));
        let context = self.load_project_context(Some(id.as_str()))?;
        let body = if context.merged.is_empty() {
            "No project context loaded."
        } else {
            context.merged.as_str()
        };

        let mut out = String::new();
        let _ = writeln!(out, "<!-- SCOPE CONTEXT START -->");
        let _ = writeln!(out, "## Active Scope: {id}\n");
        let _ = writeln!(out, "### Scope Paths");
        let _ = writeln!(out, "- Planning: `{}`", vars.scope_planning.display());
        let _ = writeln!(out, "- Implementation: `{}`", vars.scope_implementation.display());
        let _ = writeln!(out, "- Tests: `{}`\n", vars.scope_tests.display());
        let _ = writeln!(out, "### Project Context");
        let _ = writeln!(out, "{body}");
        out.push_str("<!-- SCOPE CONTEXT END -->\n");
        Ok(out)
    }

    /// POSIX `export` lines for the scope variables. `SCOPES_ACTIVE` is the
    /// variable [`resolve_scope`](Self::resolve_scope) falls back to.
    pub fn export_for_shell(&self, scope: Option<&str>) -> Result<String, ScopeError> {
        let Some(id) = self.pick_scope(scope)? else {
            return Ok("# No scope set".to_string());
        };
        let vars = self.scope_variables(Some(id.as_str()));
        let lines = [
            (ACTIVE_SCOPE_ENV, vars.scope.clone()),
            ("SCOPES_PATH", path_str(&vars.scope_path)),
            ("SCOPES_PLANNING", path_str(&vars.scope_planning)),
            ("SCOPES_IMPLEMENTATION", path_str(&vars.scope_implementation)),
            ("SCOPES_TESTS", path_str(&vars.scope_tests)),
        ];
        Ok(lines
            .iter()
            .map(|(name, value)| format!("export {name}={}", shell_quote(value)))
            .collect::<Vec<_>>()
            .join("\n"))
    }

    /// Explicit scope (validated) or the session's.
    fn pick_scope(&self, explicit: Option<&str>) -> Result<Option<ScopeId>, ScopeError> {
        match explicit.filter(|s| !s.is_empty()) {
            Some(scope) => {
                validate_scope_id(scope)?;
                Ok(Some(ScopeId::from(scope)))
            }
            None => Ok(self.current_scope()),
        }
    }
}

fn read_optional(path: &Path) -> Result<Option<String>, ScopeError> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(scope_io_err(path, e)),
    }
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Single-quote for `sh`; embedded quotes become `'\''`.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn context() -> (TempDir, ScopeContext) {
        let dir = TempDir::new().unwrap();
        let ctx = ScopeContext::new(Layout::new(dir.path()));
        (dir, ctx)
    }

    #[test]
    fn set_get_clear_roundtrip() {
        let (_dir, ctx) = context();
        assert!(!ctx.has_scope());

        ctx.set_scope("auth").unwrap();
        assert_eq!(ctx.current_scope(), Some(ScopeId::from("auth")));

        ctx.clear_scope().unwrap();
        assert_eq!(ctx.current_scope(), None);
        ctx.clear_scope().unwrap();
    }

    #[test]
    fn set_rejects_invalid_id() {
        let (_dir, ctx) = context();
        assert!(matches!(
            ctx.set_scope("Bad Id"),
            Err(ScopeError::Validation(_))
        ));
    }

    #[test]
    fn malformed_session_is_ignored() {
        let (dir, ctx) = context();
        fs::write(dir.path().join(".active-scope"), "[[[").unwrap();
        assert_eq!(ctx.current_scope(), None);
    }

    #[test]
    fn precedence_explicit_then_session_then_env() {
        let (_dir, ctx) = context();
        assert_eq!(ctx.resolve_scope_with_env(None, Some("env-scope")), Some("env-scope".into()));

        ctx.set_scope("auth").unwrap();
        assert_eq!(ctx.resolve_scope_with_env(None, Some("env-scope")), Some("auth".into()));
        assert_eq!(
            ctx.resolve_scope_with_env(Some("payments"), Some("env-scope")),
            Some("payments".into())
        );

        ctx.clear_scope().unwrap();
        assert_eq!(ctx.resolve_scope_with_env(Some(""), None), None);
    }

    #[test]
    fn variables_point_into_scope() {
        let (_dir, ctx) = context();
        assert_eq!(ctx.scope_variables(None), ScopeVariables::default());

        let vars = ctx.scope_variables(Some("auth"));
        assert_eq!(vars.scope, "auth");
        assert_eq!(vars.scope_path, PathBuf::from("_scopes-output/auth"));
        assert_eq!(
            vars.scope_planning,
            PathBuf::from("_scopes-output/auth/planning-artifacts")
        );
    }

    #[test]
    fn project_context_merges_global_and_scope() {
        let (dir, ctx) = context();
        assert_eq!(ctx.load_project_context(Some("auth")).unwrap(), ProjectContext::default());

        let shared = dir.path().join("_scopes-output/_shared");
        fs::create_dir_all(&shared).unwrap();
        fs::write(shared.join("project-context.md"), "# Global").unwrap();
        let only_global = ctx.load_project_context(Some("auth")).unwrap();
        assert_eq!(only_global.merged, "# Global");
        assert_eq!(only_global.scope, None);

        let scope_dir = dir.path().join("_scopes-output/auth");
        fs::create_dir_all(&scope_dir).unwrap();
        fs::write(scope_dir.join("project-context.md"), "Auth rules").unwrap();
        let both = ctx.load_project_context(Some("auth")).unwrap();
        assert_eq!(
            both.merged,
            "# Global\n\n---\n\n## Scope-Specific Context\n\nAuth rules"
        );

        fs::remove_file(shared.join("project-context.md")).unwrap();
        assert_eq!(ctx.load_project_context(Some("auth")).unwrap().merged, "Auth rules");
    }

    #[test]
    fn project_context_uses_session_scope_and_rejects_bad_ids() {
        let (dir, ctx) = context();
        let scope_dir = dir.path().join("_scopes-output/payments");
        fs::create_dir_all(&scope_dir).unwrap();
        fs::write(scope_dir.join("project-context.md"), "Payments").unwrap();

        assert_eq!(ctx.load_project_context(None).unwrap().scope, None);
        ctx.set_scope("payments").unwrap();
        assert_eq!(ctx.load_project_context(None).unwrap().merged, "Payments");
        assert!(matches!(
            ctx.load_project_context(Some("../payments")),
            Err(ScopeError::Validation(_))
        ));
    }

    #[test]
    fn snippet_lists_paths_and_context() {
        let (dir, ctx) = context();
        assert_eq!(ctx.context_snippet(None).unwrap(), "<!-- No scope context active -->");

        let snippet = ctx.context_snippet(Some("auth")).unwrap();
        assert!(snippet.starts_with("<!-- SCOPE CONTEXT START -->\n## Active Scope: auth\n"));
        assert!(snippet.contains("- Planning: `_scopes-output/auth/planning-artifacts`"));
        assert!(snippet.contains("### Project Context\nNo project context loaded.\n"));
        assert!(snippet.ends_with("<!-- SCOPE CONTEXT END -->\n"));

        let scope_dir = dir.path().join("_scopes-output/auth");
        fs::create_dir_all(&scope_dir).unwrap();
        fs::write(scope_dir.join("project-context.md"), "Auth rules").unwrap();
        assert!(ctx
            .context_snippet(Some("auth"))
            .unwrap()
            .contains("### Project Context\nAuth rules\n"));
    }

    #[test]
    fn shell_export_quotes_values() {
        let (_dir, ctx) = context();
        assert_eq!(ctx.export_for_shell(None).unwrap(), "# No scope set");

        let exports = ctx.export_for_shell(Some("auth")).unwrap();
        let lines: Vec<&str> = exports.lines().collect();
        assert_eq!(lines.len(), 5);
        assert_eq!(lines[0], "export SCOPES_ACTIVE='auth'");
        assert_eq!(lines[1], "export SCOPES_PATH='_scopes-output/auth'");
        assert_eq!(lines[4], "export SCOPES_TESTS='_scopes-output/auth/tests'");

        assert_eq!(shell_quote("it's"), "'it'\\''s'");
    }
}
