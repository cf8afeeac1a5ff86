//! Patch mode: apply a unified diff supplied by the planner.
//!
//! Every header path is checked before anything touches the working tree:
//! lexical safety, containment in the repository, symlinks along the path,
//! and the task's scope.

use std::fs;
use std::io::Write;
use std::path::{Component, Path};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use super::BuildContext;
use crate::core::builder_outcome::BuilderInvocationResult;
use crate::core::codes::ReportCode;
use crate::core::path::{normalize_relative, validate_relative_path};
use crate::core::scope::ScopeMatcher;
use crate::core::types::{BuilderResult, BuilderStatus, PatchBuild, Task};
use crate::io::invoker::AgentInvoker;

const MODE: &str = "patch";

/// A file named by a `---`/`+++` header pair. `None` is `/dev/null`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchFile {
    pub old: Option<String>,
    pub new: Option<String>,
}

impl PatchFile {
    fn paths(&self) -> impl Iterator<Item = &String> {
        self.old.iter().chain(self.new.iter())
    }

    fn is_creation(&self) -> bool {
        self.old.is_none() && self.new.is_some()
    }
}

/// Header pairs in the order they appear. Paths are raw, only the `a/`/`b/`
/// prefix and any timestamp are stripped.
pub fn parse_patch_files(patch: &str) -> Vec<PatchFile> {
    let mut files = Vec::new();
    let mut pending_old: Option<Option<String>> = None;
    for line in patch.lines() {
        if let Some(rest) = line.strip_prefix("--- ") {
            pending_old = Some(header_path(rest, "a/"));
        } else if let Some(rest) = line.strip_prefix("+++ ") {
            let new = header_path(rest, "b/");
            files.push(PatchFile {
                old: pending_old.take().unwrap_or_else(|| new.clone()),
                new,
            });
        }
    }
    files
}

fn header_path(rest: &str, prefix: &str) -> Option<String> {
    let raw = rest.split('\t').next().unwrap_or(rest).trim_end_matches(['\r', ' ']);
    if raw == "/dev/null" {
        return None;
    }
    Some(raw.strip_prefix(prefix).unwrap_or(raw).to_string())
}

/// Why a patch was refused before applying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchRejection {
    pub code: ReportCode,
    pub reason: String,
}

impl PatchRejection {
    fn new(code: ReportCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

/// Run every pre-apply check against `root` and the task's scope.
pub fn check_patch_paths(
    root: &Path,
    files: &[PatchFile],
    scope: &ScopeMatcher<'_>,
) -> Result<(), PatchRejection> {
    if files.is_empty() {
        return Err(PatchRejection::new(
            ReportCode::StopPatchInvalidPath,
            "patch names no files",
        ));
    }
    let canonical_root = root.canonicalize().map_err(|err| {
        PatchRejection::new(
            ReportCode::StopPatchInvalidPath,
            format!("resolve repository root: {err}"),
        )
    })?;

    for file in files {
        for raw in file.paths() {
            validate_relative_path(raw).map_err(|reason| {
                PatchRejection::new(ReportCode::StopPatchInvalidPath, format!("{raw:?}: {reason}"))
            })?;
            let path = normalize_relative(raw);
            check_symlinks_and_containment(&canonical_root, &path)?;
            let is_new = file.is_creation() && file.new.as_deref() == Some(raw.as_str());
            if let Some(kind) = scope.violation(&path, is_new) {
                return Err(PatchRejection::new(
                    ReportCode::StopPatchScopeViolation,
                    format!("{path}: {kind:?}"),
                ));
            }
        }
    }
    Ok(())
}

/// Walk `path` component by component without following symlinks. Components
/// past the first missing one do not exist yet and cannot be links.
fn check_symlinks_and_containment(root: &Path, path: &str) -> Result<(), PatchRejection> {
    let mut current = root.to_path_buf();
    for component in Path::new(path).components() {
        let Component::Normal(part) = component else {
            return Err(PatchRejection::new(
                ReportCode::StopPatchInvalidPath,
                format!("{path:?}: unexpected path component"),
            ));
        };
        current.push(part);
        match fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(PatchRejection::new(
                    ReportCode::StopPatchSymlink,
                    format!("{path:?}: {} is a symlink", current.display()),
                ));
            }
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => break,
            Err(err) => {
                return Err(PatchRejection::new(
                    ReportCode::StopPatchInvalidPath,
                    format!("{path:?}: {err}"),
                ));
            }
        }
    }
    if !current.starts_with(root) {
        return Err(PatchRejection::new(
            ReportCode::StopPatchInvalidPath,
            format!("{path:?} escapes the repository"),
        ));
    }
    Ok(())
}

pub(super) fn run<I: AgentInvoker>(
    ctx: &BuildContext<'_, I>,
    task: &Task,
    build: &PatchBuild,
) -> Result<BuilderInvocationResult> {
    let files = parse_patch_files(&build.patch);
    let scope = ScopeMatcher::new(
        &task.scope,
        &ctx.config.scope,
        &ctx.config.owned_globs(),
    )?;
    if let Err(rejection) = check_patch_paths(ctx.git.workdir(), &files, &scope) {
        warn!(code = %rejection.code, reason = %rejection.reason, "patch rejected");
        return Ok(BuilderInvocationResult::failed(
            MODE,
            Some(rejection.code),
            rejection.reason,
        ));
    }

    let mut patch_file = tempfile::Builder::new()
        .prefix("governor-")
        .suffix(".patch")
        .tempfile()
        .context("create temp patch file")?;
    patch_file
        .write_all(build.patch.as_bytes())
        .context("write temp patch file")?;
    patch_file.flush().context("flush temp patch file")?;

    // The temp file is removed when `patch_file` drops, on every path.
    if let Err(err) = ctx.git.apply(patch_file.path()) {
        warn!(err = %err, "git apply failed");
        return Ok(BuilderInvocationResult::failed(
            MODE,
            Some(ReportCode::StopPatchApplyFailed),
            format!("{err:#}"),
        ));
    }

    let changed: Vec<String> = files
        .iter()
        .filter_map(|f| f.new.as_ref().or(f.old.as_ref()))
        .map(|p| normalize_relative(p))
        .collect();
    debug!(files = changed.len(), "patch applied");
    Ok(BuilderInvocationResult::succeeded(
        MODE,
        Some(BuilderResult {
            status: BuilderStatus::Done,
            summary: format!("applied patch touching {} file(s)", changed.len()),
            files_changed: changed,
            stop_code: None,
        }),
        None,
    ))
}
