//! Environment checks run after the lock is held and before any agent call.

use tracing::{debug, info, instrument, warn};

use crate::core::codes::ReportCode;
use crate::io::config::GovernorConfig;
use crate::io::git::Git;
use crate::io::init::ensure_state_dir;
use crate::io::paths::GovernorPaths;
use crate::io::workspace_state::WorkspaceState;

/// Result of preflight. Every failure is a blocked outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Preflight {
    /// Safe to proceed from `base_commit`.
    Ready { base_commit: String },
    Blocked { code: ReportCode, reason: String },
}

impl Preflight {
    fn blocked(code: ReportCode, reason: impl Into<String>) -> Self {
        Preflight::Blocked {
            code,
            reason: reason.into(),
        }
    }
}

/// Run every check in order, stopping at the first failure.
///
/// `recovering` is set when the lock was reclaimed from a crashed tick, which
/// turns a dirty tree into a crash-recovery block.
#[instrument(skip_all, fields(recovering = recovering))]
pub fn run_preflight(
    git: &Git,
    paths: &GovernorPaths,
    config: &GovernorConfig,
    state: &WorkspaceState,
    recovering: bool,
) -> Preflight {
    if let Err(err) = ensure_state_dir(paths) {
        return Preflight::blocked(ReportCode::BlockedPreflightFailed, format!("{err:#}"));
    }
    if let Err(err) = git.head_sha() {
        return Preflight::blocked(
            ReportCode::BlockedPreflightFailed,
            format!("HEAD does not resolve: {err:#}"),
        );
    }
    if let Err(err) = git.ensure_clean() {
        let code = if recovering {
            ReportCode::BlockedCrashRecoveryRequired
        } else {
            ReportCode::BlockedDirtyWorktree
        };
        warn!(%code, "preflight found a dirty worktree");
        return Preflight::blocked(code, format!("{err:#}"));
    }
    if let Some(branch) = config.git.work_branch.as_deref()
        && let Err(err) = switch_to_work_branch(git, branch)
    {
        return Preflight::blocked(
            ReportCode::BlockedBranchFailed,
            format!("work branch {branch}: {err:#}"),
        );
    }
    if let Some(reason) = config.budget.exhausted(&state.budget) {
        return Preflight::blocked(ReportCode::BlockedBudgetExhausted, reason);
    }
    match git.head_sha() {
        Ok(base_commit) => {
            debug!(%base_commit, "preflight passed");
            Preflight::Ready { base_commit }
        }
        Err(err) => Preflight::blocked(ReportCode::BlockedPreflightFailed, format!("{err:#}")),
    }
}

fn switch_to_work_branch(git: &Git, branch: &str) -> anyhow::Result<()> {
    if git.current_branch().ok().as_deref() == Some(branch) {
        return Ok(());
    }
    if git.branch_exists(branch)? {
        git.checkout_branch(branch)
    } else {
        info!(branch, "creating work branch");
        git.checkout_new_branch(branch)
    }
}
