//! Stable machine-readable report codes.
//!
//! Every code maps to exactly one [`Verdict`]. The string form is the wire
//! format used in REPORT.json, BLOCKED.json and STATE.json.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::core::types::Verdict;

macro_rules! report_codes {
    ($($variant:ident => $text:literal, $verdict:ident;)+) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum ReportCode {
            $($variant,)+
        }

        impl ReportCode {
            pub const ALL: &'static [ReportCode] = &[$(ReportCode::$variant,)+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $(ReportCode::$variant => $text,)+
                }
            }

            pub fn verdict(self) -> Verdict {
                match self {
                    $(ReportCode::$variant => Verdict::$verdict,)+
                }
            }
        }
    };
}

report_codes! {
    Success => "SUCCESS", Success;
    SuccessOrchestratorStop => "SUCCESS_ORCHESTRATOR_STOP", Success;

    StopOrchestratorAskQuestion => "STOP_ORCHESTRATOR_ASK_QUESTION", Stop;
    StopQuestionSideEffects => "STOP_QUESTION_SIDE_EFFECTS", Stop;
    StopVerifyOnlySideEffects => "STOP_VERIFY_ONLY_SIDE_EFFECTS", Stop;
    StopScopeViolationRunnerOwned => "STOP_SCOPE_VIOLATION_RUNNER_OWNED", Stop;
    StopScopeViolationForbidden => "STOP_SCOPE_VIOLATION_FORBIDDEN", Stop;
    StopScopeViolationOutsideAllowed => "STOP_SCOPE_VIOLATION_OUTSIDE_ALLOWED", Stop;
    StopLockfileChangeForbidden => "STOP_LOCKFILE_CHANGE_FORBIDDEN", Stop;
    StopNewFileForbidden => "STOP_NEW_FILE_FORBIDDEN", Stop;
    StopDiffTooLarge => "STOP_DIFF_TOO_LARGE", Stop;
    StopHeadMoved => "STOP_HEAD_MOVED", Stop;
    StopVerifyFailedFast => "STOP_VERIFY_FAILED_FAST", Stop;
    StopVerifyFailedSlow => "STOP_VERIFY_FAILED_SLOW", Stop;
    StopVerifyFlakyOrTimeout => "STOP_VERIFY_FLAKY_OR_TIMEOUT", Stop;
    StopVerifyTainted => "STOP_VERIFY_TAINTED", Stop;
    StopVerifyConfigInvalid => "STOP_VERIFY_CONFIG_INVALID", Stop;
    StopBuilderTimeout => "STOP_BUILDER_TIMEOUT", Stop;
    StopBuilderFailed => "STOP_BUILDER_FAILED", Stop;
    StopBuilderOutputInvalid => "STOP_BUILDER_OUTPUT_INVALID", Stop;
    StopBuilderSchemaInvalid => "STOP_BUILDER_SCHEMA_INVALID", Stop;
    StopBuilderReportedFailure => "STOP_BUILDER_REPORTED_FAILURE", Stop;
    StopBuilderDriverUnavailable => "STOP_BUILDER_DRIVER_UNAVAILABLE", Stop;
    StopBuilderDriverOutputMissing => "STOP_BUILDER_DRIVER_OUTPUT_MISSING", Stop;
    StopPatchInvalidPath => "STOP_PATCH_INVALID_PATH", Stop;
    StopPatchScopeViolation => "STOP_PATCH_SCOPE_VIOLATION", Stop;
    StopPatchSymlink => "STOP_PATCH_SYMLINK", Stop;
    StopPatchApplyFailed => "STOP_PATCH_APPLY_FAILED", Stop;
    StopReviewerForcedPatch => "STOP_REVIEWER_FORCED_PATCH", Stop;
    StopReviewerAskQuestion => "STOP_REVIEWER_ASK_QUESTION", Stop;
    StopInterrupted => "STOP_INTERRUPTED", Stop;

    BlockedLockHeld => "BLOCKED_LOCK_HELD", Blocked;
    BlockedLockCorrupt => "BLOCKED_LOCK_CORRUPT", Blocked;
    BlockedStateCorrupt => "BLOCKED_STATE_CORRUPT", Blocked;
    BlockedCrashRecoveryRequired => "BLOCKED_CRASH_RECOVERY_REQUIRED", Blocked;
    BlockedDirtyWorktree => "BLOCKED_DIRTY_WORKTREE", Blocked;
    BlockedPreflightFailed => "BLOCKED_PREFLIGHT_FAILED", Blocked;
    BlockedBudgetExhausted => "BLOCKED_BUDGET_EXHAUSTED", Blocked;
    BlockedBranchFailed => "BLOCKED_BRANCH_FAILED", Blocked;
    BlockedRollbackFailed => "BLOCKED_ROLLBACK_FAILED", Blocked;
    BlockedRollbackDirty => "BLOCKED_ROLLBACK_DIRTY", Blocked;
    BlockedOrchestratorOutputInvalid => "BLOCKED_ORCHESTRATOR_OUTPUT_INVALID", Blocked;
    BlockedOrchestratorFailed => "BLOCKED_ORCHESTRATOR_FAILED", Blocked;
    BlockedTransportStalled => "BLOCKED_TRANSPORT_STALLED", Blocked;
    BlockedReviewerOutputInvalid => "BLOCKED_REVIEWER_OUTPUT_INVALID", Blocked;
    BlockedReviewerFailed => "BLOCKED_REVIEWER_FAILED", Blocked;
    BlockedHumanEscalation => "BLOCKED_HUMAN_ESCALATION", Blocked;
    BlockedCommitFailed => "BLOCKED_COMMIT_FAILED", Blocked;
    BlockedInterrupted => "BLOCKED_INTERRUPTED", Blocked;
}

impl ReportCode {
    /// Parse a code claimed by a builder. Builders may only claim builder or
    /// patch stop codes; anything else is ignored by the caller.
    pub fn from_builder_claim(raw: &str) -> Option<ReportCode> {
        let code = ReportCode::from_str(raw.trim()).ok()?;
        let text = code.as_str();
        if text.starts_with("STOP_BUILDER_") || text.starts_with("STOP_PATCH_") {
            Some(code)
        } else {
            None
        }
    }

    /// Whether this outcome extends the consecutive-failure streak.
    ///
    /// Questions and interruptions are not failures of the build loop.
    pub fn counts_as_failure(self) -> bool {
        if self.verdict() == Verdict::Success {
            return false;
        }
        !matches!(
            self,
            ReportCode::StopOrchestratorAskQuestion
                | ReportCode::StopReviewerAskQuestion
                | ReportCode::StopInterrupted
        )
    }

    /// Whether this code records a failed verification run.
    pub fn is_verify_failure(self) -> bool {
        matches!(
            self,
            ReportCode::StopVerifyFailedFast
                | ReportCode::StopVerifyFailedSlow
                | ReportCode::StopVerifyFlakyOrTimeout
        )
    }

    /// Operator-facing remediation for blocked outcomes.
    pub fn remediation(self) -> Option<&'static str> {
        let text = match self {
            ReportCode::BlockedLockHeld => {
                "Another tick holds the workspace lock. Wait for it to finish; if its process is gone, run `governor unlock`."
            }
            ReportCode::BlockedLockCorrupt => {
                "The lock file could not be validated. Inspect it, then delete it manually (or run `governor unlock`)."
            }
            ReportCode::BlockedStateCorrupt => {
                "STATE.json could not be read. Repair it, or move it aside to restart counters and escalation history."
            }
            ReportCode::BlockedCrashRecoveryRequired => {
                "A previous tick crashed and left uncommitted changes. Inspect `git status`, restore a clean tree, then run `governor ack`."
            }
            ReportCode::BlockedDirtyWorktree => {
                "The working tree has uncommitted changes. Commit or discard them before the next tick."
            }
            ReportCode::BlockedPreflightFailed => {
                "Environment preflight failed. Fix the reported condition and rerun."
            }
            ReportCode::BlockedBudgetExhausted => {
                "A configured budget is exhausted. Raise the limit in governor.toml or reset STATE.json counters."
            }
            ReportCode::BlockedBranchFailed => {
                "The configured work branch could not be checked out. Resolve the git error and rerun."
            }
            ReportCode::BlockedRollbackFailed => {
                "Rolling back an unsafe change failed; the working tree is NOT guaranteed clean. Restore it manually, then run `governor ack`."
            }
            ReportCode::BlockedRollbackDirty => {
                "Rollback completed but residue remains in the working tree. Clean it manually, then run `governor ack`."
            }
            ReportCode::BlockedOrchestratorOutputInvalid => {
                "The planning agent repeatedly returned malformed tasks. Check the planner prompt and agent configuration."
            }
            ReportCode::BlockedOrchestratorFailed => {
                "The planning agent invocation failed. Check the agent CLI and its credentials."
            }
            ReportCode::BlockedTransportStalled => {
                "The agent transport stalled. Retry later; quote the request id when reporting the failure."
            }
            ReportCode::BlockedReviewerOutputInvalid => {
                "The reviewing agent returned an unusable verdict. Check the reviewer configuration."
            }
            ReportCode::BlockedReviewerFailed => {
                "The reviewing agent invocation failed. Check the reviewer CLI and its credentials."
            }
            ReportCode::BlockedHumanEscalation => {
                "Risk policy requires a human decision. Review recent reports, then run `governor ack` to resume."
            }
            ReportCode::BlockedCommitFailed => {
                "Accepted changes could not be committed. Resolve the git error; the changes are still in the working tree."
            }
            ReportCode::BlockedInterrupted => {
                "The tick aborted on an internal error. Inspect REPORT.json and the working tree before rerunning."
            }
            _ => return None,
        };
        Some(text)
    }
}

impl fmt::Display for ReportCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReportCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ReportCode::ALL
            .iter()
            .copied()
            .find(|code| code.as_str() == s)
            .ok_or_else(|| format!("unknown report code '{s}'"))
    }
}

impl Serialize for ReportCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ReportCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        ReportCode::from_str(&raw).map_err(serde::de::Error::custom)
    }
}
