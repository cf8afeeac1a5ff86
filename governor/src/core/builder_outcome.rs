//! Mode-agnostic builder result contract and failure policy.
//!
//! Every builder mode (agent, patch, external driver) funnels into
//! [`BuilderInvocationResult`], so the orchestrator handles outcomes without
//! knowing which mode produced them.

use serde::{Deserialize, Serialize};

use crate::core::codes::ReportCode;
use crate::core::types::{BuilderResult, BuilderStatus, TaskKind};

/// Why a builder's textual output could not be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseErrorKind {
    /// Output was empty or whitespace.
    Empty,
    /// No JSON object could be extracted.
    NoJson,
    /// JSON was found but did not match the result schema.
    SchemaMismatch,
}

impl ParseErrorKind {
    pub fn stop_code(self) -> ReportCode {
        match self {
            ParseErrorKind::Empty | ParseErrorKind::NoJson => ReportCode::StopBuilderOutputInvalid,
            ParseErrorKind::SchemaMismatch => ReportCode::StopBuilderSchemaInvalid,
        }
    }
}

/// How unusable builder output is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Unusable output fails the build.
    FailClosed,
    /// Unusable output is recorded and the tick goes on to judge the diff.
    FailOpen,
}

/// Single decision point for lenient vs strict output handling.
pub fn resolve_failure_policy(task_kind: TaskKind, strict_output: bool) -> FailurePolicy {
    if strict_output || task_kind == TaskKind::Question {
        FailurePolicy::FailClosed
    } else {
        FailurePolicy::FailOpen
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuilderInvocationResult {
    pub mode: String,
    pub success: bool,
    pub result: Option<BuilderResult>,
    pub raw_response: Option<String>,
    pub builder_output_valid: bool,
    pub validation_errors: Vec<String>,
    pub parse_error_kind: Option<ParseErrorKind>,
    /// Code assigned by the dispatcher for a failure it recognised.
    pub stop_code: Option<ReportCode>,
    pub error: Option<String>,
}

impl BuilderInvocationResult {
    pub fn succeeded(mode: &str, result: Option<BuilderResult>, raw_response: Option<String>) -> Self {
        Self {
            mode: mode.to_string(),
            success: true,
            builder_output_valid: true,
            result,
            raw_response,
            validation_errors: Vec::new(),
            parse_error_kind: None,
            stop_code: None,
            error: None,
        }
    }

    pub fn failed(mode: &str, stop_code: Option<ReportCode>, error: impl Into<String>) -> Self {
        Self {
            mode: mode.to_string(),
            success: false,
            builder_output_valid: false,
            result: None,
            raw_response: None,
            validation_errors: Vec::new(),
            parse_error_kind: None,
            stop_code,
            error: Some(error.into()),
        }
    }

    /// Unusable output, resolved through `policy`.
    pub fn unusable_output(
        mode: &str,
        policy: FailurePolicy,
        raw_response: String,
        kind: ParseErrorKind,
        validation_errors: Vec<String>,
    ) -> Self {
        Self {
            mode: mode.to_string(),
            success: policy == FailurePolicy::FailOpen,
            builder_output_valid: false,
            result: None,
            raw_response: Some(raw_response),
            validation_errors,
            parse_error_kind: Some(kind),
            stop_code: None,
            error: match policy {
                FailurePolicy::FailOpen => None,
                FailurePolicy::FailClosed => Some(format!("builder output unusable ({kind:?})")),
            },
        }
    }
}

/// Pick the most specific code for a failed invocation: the dispatcher's
/// explicit code, then a code claimed by the builder itself, then the parse
/// error kind, then the builder's own failure status.
pub fn resolve_builder_failure_code(result: &BuilderInvocationResult) -> ReportCode {
    if let Some(code) = result.stop_code {
        return code;
    }
    if let Some(claimed) = result
        .result
        .as_ref()
        .and_then(|r| r.stop_code.as_deref())
        .and_then(ReportCode::from_builder_claim)
    {
        return claimed;
    }
    if let Some(kind) = result.parse_error_kind {
        return kind.stop_code();
    }
    if result
        .result
        .as_ref()
        .is_some_and(|r| r.status == BuilderStatus::Failed)
    {
        return ReportCode::StopBuilderReportedFailure;
    }
    ReportCode::StopBuilderFailed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn questions_and_strict_mode_fail_closed() {
        assert_eq!(
            resolve_failure_policy(TaskKind::Question, false),
            FailurePolicy::FailClosed
        );
        assert_eq!(
            resolve_failure_policy(TaskKind::Execute, true),
            FailurePolicy::FailClosed
        );
        assert_eq!(
            resolve_failure_policy(TaskKind::Execute, false),
            FailurePolicy::FailOpen
        );
    }

    #[test]
    fn fail_open_keeps_the_tick_going() {
        let result = BuilderInvocationResult::unusable_output(
            "agent",
            FailurePolicy::FailOpen,
            "not json".to_string(),
            ParseErrorKind::NoJson,
            vec!["no json object found".to_string()],
        );
        assert!(result.success);
        assert!(!result.builder_output_valid);
        assert_eq!(result.error, None);
    }

    #[test]
    fn explicit_code_beats_parse_kind() {
        let mut result = BuilderInvocationResult::unusable_output(
            "external_driver",
            FailurePolicy::FailClosed,
            String::new(),
            ParseErrorKind::SchemaMismatch,
            Vec::new(),
        );
        assert_eq!(
            resolve_builder_failure_code(&result),
            ReportCode::StopBuilderSchemaInvalid
        );
        result.stop_code = Some(ReportCode::StopBuilderTimeout);
        assert_eq!(
            resolve_builder_failure_code(&result),
            ReportCode::StopBuilderTimeout
        );
    }

    #[test]
    fn builder_claimed_code_is_used_when_allowed() {
        let mut result = BuilderInvocationResult::failed("agent", None, "builder reported failure");
        result.result = Some(BuilderResult {
            status: BuilderStatus::Failed,
            summary: "gave up".to_string(),
            files_changed: Vec::new(),
            stop_code: Some("BLOCKED_LOCK_HELD".to_string()),
        });
        assert_eq!(
            resolve_builder_failure_code(&result),
            ReportCode::StopBuilderReportedFailure
        );

        if let Some(r) = result.result.as_mut() {
            r.stop_code = Some("STOP_PATCH_APPLY_FAILED".to_string());
        }
        assert_eq!(
            resolve_builder_failure_code(&result),
            ReportCode::StopPatchApplyFailed
        );
    }

    #[test]
    fn generic_failure_is_the_last_resort() {
        let result = BuilderInvocationResult::failed("agent", None, "boom");
        assert_eq!(
            resolve_builder_failure_code(&result),
            ReportCode::StopBuilderFailed
        );
    }
}
