//! Scope policy: which touched paths a task is allowed to leave behind.
//!
//! Rules are evaluated per path in a fixed order and the first violated rule
//! wins:
//!
//! 1. runner-owned paths are always forbidden,
//! 2. task or global `forbidden_globs` deny,
//! 3. a non-empty `allowed_globs` must match,
//! 4. lockfiles require `allow_lockfile_changes`,
//! 5. new files require `allow_new_files`.

use anyhow::{Context, Result};
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};

use crate::core::blast::TouchedFiles;
use crate::core::codes::ReportCode;
use crate::core::types::TaskScope;

/// Repository-wide scope policy from configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalScope {
    /// Denied for every task regardless of its own scope.
    pub forbidden_globs: Vec<String>,
    /// File names treated as dependency lockfiles.
    pub lockfile_names: Vec<String>,
}

impl Default for GlobalScope {
    fn default() -> Self {
        Self {
            forbidden_globs: vec![".git/**".to_string()],
            lockfile_names: [
                "Cargo.lock",
                "package-lock.json",
                "npm-shrinkwrap.json",
                "pnpm-lock.yaml",
                "yarn.lock",
                "bun.lockb",
                "poetry.lock",
                "uv.lock",
                "Pipfile.lock",
                "Gemfile.lock",
                "composer.lock",
                "go.sum",
            ]
            .into_iter()
            .map(str::to_string)
            .collect(),
        }
    }
}

impl GlobalScope {
    pub fn is_lockfile(&self, path: &str) -> bool {
        let name = path.rsplit('/').next().unwrap_or(path);
        self.lockfile_names.iter().any(|lock| lock == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeViolationKind {
    RunnerOwned,
    Forbidden,
    OutsideAllowed,
    LockfileForbidden,
    NewFileForbidden,
}

impl ScopeViolationKind {
    pub fn stop_code(self) -> ReportCode {
        match self {
            ScopeViolationKind::RunnerOwned => ReportCode::StopScopeViolationRunnerOwned,
            ScopeViolationKind::Forbidden => ReportCode::StopScopeViolationForbidden,
            ScopeViolationKind::OutsideAllowed => ReportCode::StopScopeViolationOutsideAllowed,
            ScopeViolationKind::LockfileForbidden => ReportCode::StopLockfileChangeForbidden,
            ScopeViolationKind::NewFileForbidden => ReportCode::StopNewFileForbidden,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeViolation {
    pub path: String,
    pub kind: ScopeViolationKind,
}

/// Outcome of a scope check. `stop_code` comes from the first violation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeCheck {
    pub ok: bool,
    pub violations: Vec<ScopeViolation>,
    pub stop_code: Option<ReportCode>,
}

/// Compiled matcher for a list of glob patterns.
///
/// `*` does not cross `/`; use `**` for recursive matches.
#[derive(Debug, Clone)]
pub struct GlobList {
    set: GlobSet,
    len: usize,
}

impl GlobList {
    pub fn compile<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        let mut len = 0;
        for pattern in patterns {
            let pattern = pattern.as_ref().trim();
            if pattern.is_empty() {
                continue;
            }
            let glob = GlobBuilder::new(pattern)
                .literal_separator(true)
                .build()
                .with_context(|| format!("invalid glob: {pattern:?}"))?;
            builder.add(glob);
            len += 1;
        }
        Ok(Self {
            set: builder.build().context("build glob set")?,
            len,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_match(&self, path: &str) -> bool {
        self.set.is_match(path)
    }
}

/// Per-path verdict against a compiled scope, used by both the judge and the
/// patch-mode pre-apply check.
pub struct ScopeMatcher<'a> {
    runner_owned: GlobList,
    forbidden: GlobList,
    allowed: GlobList,
    task_scope: &'a TaskScope,
    global: &'a GlobalScope,
}

impl<'a> ScopeMatcher<'a> {
    pub fn new(
        task_scope: &'a TaskScope,
        global: &'a GlobalScope,
        runner_owned_globs: &[String],
    ) -> Result<Self> {
        let forbidden: Vec<&String> = task_scope
            .forbidden_globs
            .iter()
            .chain(global.forbidden_globs.iter())
            .collect();
        Ok(Self {
            runner_owned: GlobList::compile(runner_owned_globs)?,
            forbidden: GlobList::compile(&forbidden)?,
            allowed: GlobList::compile(&task_scope.allowed_globs)?,
            task_scope,
            global,
        })
    }

    /// First violated rule for `path`, or `None` when the path is in scope.
    pub fn violation(&self, path: &str, is_new: bool) -> Option<ScopeViolationKind> {
        if self.runner_owned.is_match(path) {
            return Some(ScopeViolationKind::RunnerOwned);
        }
        if self.forbidden.is_match(path) {
            return Some(ScopeViolationKind::Forbidden);
        }
        if !self.allowed.is_empty() && !self.allowed.is_match(path) {
            return Some(ScopeViolationKind::OutsideAllowed);
        }
        if !self.task_scope.allow_lockfile_changes && self.global.is_lockfile(path) {
            return Some(ScopeViolationKind::LockfileForbidden);
        }
        if is_new && !self.task_scope.allow_new_files {
            return Some(ScopeViolationKind::NewFileForbidden);
        }
        None
    }
}

/// Check every touched path against runner-owned, task and global scope.
pub fn check_scope_violations(
    touched: &TouchedFiles,
    task_scope: &TaskScope,
    global: &GlobalScope,
    runner_owned_globs: &[String],
) -> Result<ScopeCheck> {
    let matcher = ScopeMatcher::new(task_scope, global, runner_owned_globs)?;
    let violations: Vec<ScopeViolation> = touched
        .all
        .iter()
        .filter_map(|path| {
            matcher
                .violation(path, touched.is_new(path))
                .map(|kind| ScopeViolation {
                    path: path.clone(),
                    kind,
                })
        })
        .collect();
    let stop_code = violations.first().map(|v| v.kind.stop_code());
    Ok(ScopeCheck {
        ok: violations.is_empty(),
        violations,
        stop_code,
    })
}

/// Literal prefix of a glob, up to the first wildcard or class character.
pub fn literal_prefix(pattern: &str) -> &str {
    let end = pattern
        .find(['*', '?', '[', '{'])
        .unwrap_or(pattern.len());
    &pattern[..end]
}

/// Conservative overlap test between two globs: one literal prefix extends the other.
pub fn globs_may_overlap(a: &str, b: &str) -> bool {
    let (pa, pb) = (literal_prefix(a.trim()), literal_prefix(b.trim()));
    pa.starts_with(pb) || pb.starts_with(pa)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touched(paths: &[&str], new: &[&str]) -> TouchedFiles {
        TouchedFiles::new(
            paths.iter().map(|p| p.to_string()).collect(),
            Vec::new(),
            new.iter().map(|p| p.to_string()).collect(),
        )
    }

    fn scope(allowed: &[&str]) -> TaskScope {
        TaskScope {
            allowed_globs: allowed.iter().map(|p| p.to_string()).collect(),
            forbidden_globs: Vec::new(),
            allow_new_files: true,
            allow_lockfile_changes: false,
        }
    }

    fn runner_owned() -> Vec<String> {
        vec![".governor/**".to_string(), "governor.toml".to_string()]
    }

    #[test]
    fn outside_allowed_is_reported() {
        let check = check_scope_violations(
            &touched(&["package.json"], &[]),
            &scope(&["src/**"]),
            &GlobalScope::default(),
            &runner_owned(),
        )
        .expect("check");
        assert!(!check.ok);
        assert_eq!(check.violations[0].kind, ScopeViolationKind::OutsideAllowed);
        assert_eq!(
            check.stop_code,
            Some(ReportCode::StopScopeViolationOutsideAllowed)
        );
    }

    #[test]
    fn inside_allowed_is_ok() {
        let check = check_scope_violations(
            &touched(&["src/utils.ts"], &[]),
            &scope(&["src/**"]),
            &GlobalScope::default(),
            &runner_owned(),
        )
        .expect("check");
        assert!(check.ok);
        assert!(check.violations.is_empty());
        assert_eq!(check.stop_code, None);
    }

    #[test]
    fn lockfile_is_forbidden_even_when_allowed() {
        let check = check_scope_violations(
            &touched(&["pnpm-lock.yaml"], &[]),
            &scope(&["pnpm-lock.yaml", "src/**"]),
            &GlobalScope::default(),
            &runner_owned(),
        )
        .expect("check");
        assert_eq!(check.violations[0].kind, ScopeViolationKind::LockfileForbidden);
        assert_eq!(check.stop_code, Some(ReportCode::StopLockfileChangeForbidden));

        let mut permissive = scope(&["pnpm-lock.yaml"]);
        permissive.allow_lockfile_changes = true;
        let check = check_scope_violations(
            &touched(&["pnpm-lock.yaml"], &[]),
            &permissive,
            &GlobalScope::default(),
            &runner_owned(),
        )
        .expect("check");
        assert!(check.ok);
    }

    #[test]
    fn runner_owned_wins_over_task_allow() {
        let check = check_scope_violations(
            &touched(&[".governor/STATE.json"], &[]),
            &scope(&["**"]),
            &GlobalScope::default(),
            &runner_owned(),
        )
        .expect("check");
        assert_eq!(check.violations[0].kind, ScopeViolationKind::RunnerOwned);
    }

    #[test]
    fn forbidden_wins_over_allowed() {
        let mut task_scope = scope(&["src/**"]);
        task_scope.forbidden_globs = vec!["src/secrets/**".to_string()];
        let check = check_scope_violations(
            &touched(&["src/secrets/key.rs", "src/lib.rs"], &[]),
            &task_scope,
            &GlobalScope::default(),
            &runner_owned(),
        )
        .expect("check");
        assert_eq!(check.violations.len(), 1);
        assert_eq!(check.violations[0].path, "src/secrets/key.rs");
        assert_eq!(check.stop_code, Some(ReportCode::StopScopeViolationForbidden));
    }

    #[test]
    fn global_forbidden_applies_to_every_task() {
        let global = GlobalScope {
            forbidden_globs: vec!["deploy/**".to_string()],
            ..GlobalScope::default()
        };
        let check = check_scope_violations(
            &touched(&["deploy/prod.yaml"], &[]),
            &scope(&[]),
            &global,
            &runner_owned(),
        )
        .expect("check");
        assert_eq!(check.stop_code, Some(ReportCode::StopScopeViolationForbidden));
    }

    #[test]
    fn new_files_require_permission() {
        let mut task_scope = scope(&["src/**"]);
        task_scope.allow_new_files = false;
        let check = check_scope_violations(
            &touched(&["src/new.rs", "src/old.rs"], &["src/new.rs"]),
            &task_scope,
            &GlobalScope::default(),
            &runner_owned(),
        )
        .expect("check");
        assert_eq!(check.violations.len(), 1);
        assert_eq!(check.stop_code, Some(ReportCode::StopNewFileForbidden));
    }

    #[test]
    fn single_star_does_not_cross_directories() {
        let check = check_scope_violations(
            &touched(&["src/nested/mod.rs"], &[]),
            &scope(&["src/*"]),
            &GlobalScope::default(),
            &runner_owned(),
        )
        .expect("check");
        assert_eq!(
            check.stop_code,
            Some(ReportCode::StopScopeViolationOutsideAllowed)
        );
    }

    #[test]
    fn invalid_glob_is_an_error() {
        let err = check_scope_violations(
            &touched(&["a"], &[]),
            &scope(&["src/[unclosed"]),
            &GlobalScope::default(),
            &runner_owned(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("invalid glob"));
    }

    #[test]
    fn glob_overlap_uses_literal_prefixes() {
        assert!(globs_may_overlap("src/**", "src/auth/**"));
        assert!(globs_may_overlap("**/*.rs", ".github/**"));
        assert!(!globs_may_overlap("src/**", ".github/workflows/*"));
        assert_eq!(literal_prefix("src/*.rs"), "src/");
    }
}
