//! Restore the worktree to the tick's base commit.

use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::core::codes::ReportCode;
use crate::io::git::Git;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RollbackOutcome {
    pub ok: bool,
    pub error: Option<String>,
}

/// Why a rollback needs an operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RollbackBlock {
    pub code: ReportCode,
    pub reason: String,
}

/// Reset tracked files to `commit` and delete `untracked_paths`.
#[instrument(skip_all, fields(commit, untracked = untracked_paths.len()))]
pub fn rollback_to_commit(git: &Git, commit: &str, untracked_paths: &[String]) -> RollbackOutcome {
    let result = git
        .reset_hard(commit)
        .and_then(|()| git.clean_paths(untracked_paths));
    match result {
        Ok(()) => RollbackOutcome {
            ok: true,
            error: None,
        },
        Err(err) => {
            warn!(err = %err, "rollback failed");
            RollbackOutcome {
                ok: false,
                error: Some(format!("{err:#}")),
            }
        }
    }
}

/// Roll back, then require a clean worktree. Returns `None` when the
/// workspace is back at `commit` and clean. Never retries.
pub fn perform_rollback_with_clean_check(
    git: &Git,
    commit: &str,
    untracked_paths: &[String],
) -> Option<RollbackBlock> {
    let outcome = rollback_to_commit(git, commit, untracked_paths);
    if !outcome.ok {
        return Some(RollbackBlock {
            code: ReportCode::BlockedRollbackFailed,
            reason: outcome
                .error
                .unwrap_or_else(|| "rollback failed".to_string()),
        });
    }
    if let Err(err) = git.ensure_clean() {
        warn!(err = %err, "worktree dirty after rollback");
        return Some(RollbackBlock {
            code: ReportCode::BlockedRollbackDirty,
            reason: format!("{err:#}"),
        });
    }
    info!(commit, "rolled back to base commit");
    None
}
