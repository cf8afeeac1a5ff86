//! Builder dispatcher.
//!
//! One entry point, [`run_builder`], dispatches on the task's
//! [`BuilderDirective`]. Every mode returns the same
//! [`BuilderInvocationResult`] so the tick handles outcomes without knowing
//! which strategy ran.

pub mod agent;
pub mod external;
pub mod patch;

use std::path::Path;

use anyhow::Result;
use tracing::{info, instrument};

use crate::core::budget::{TickUsage, TokenPricing};
use crate::core::builder_outcome::{
    BuilderInvocationResult, FailurePolicy, ParseErrorKind, resolve_failure_policy,
};
use crate::core::cancel::CancelToken;
use crate::core::codes::ReportCode;
use crate::core::json_extract::extract_json_object;
use crate::core::types::{BuilderDirective, BuilderResult, BuilderStatus, Task};
use crate::io::config::GovernorConfig;
use crate::io::git::Git;
use crate::io::invoker::AgentInvoker;
use crate::io::paths::GovernorPaths;
use crate::io::prompt::PromptBuilder;
use crate::io::schema::{SchemaKind, schema_errors};

/// Everything a builder mode may need.
pub struct BuildContext<'a, I: AgentInvoker> {
    pub invoker: &'a I,
    pub prompts: &'a PromptBuilder,
    pub git: &'a Git,
    pub paths: &'a GovernorPaths,
    pub config: &'a GovernorConfig,
    pub log_dir: &'a Path,
    pub pricing: &'a TokenPricing,
    pub cancel: &'a CancelToken,
}

/// Run the builder for `task`.
///
/// Policy failures come back as an unsuccessful result. `Err` is reserved for
/// cancellation and faults in the governor itself.
#[instrument(skip_all, fields(task_id = %task.task_id))]
pub fn run_builder<I: AgentInvoker>(
    ctx: &BuildContext<'_, I>,
    task: &Task,
    usage: &mut TickUsage,
) -> Result<BuilderInvocationResult> {
    ctx.cancel.check()?;
    let Some(directive) = &task.builder else {
        return Ok(BuilderInvocationResult::failed(
            "none",
            Some(ReportCode::StopBuilderFailed),
            "task has no builder directive",
        ));
    };
    usage.record_builder_call();
    let policy = resolve_failure_policy(task.task_kind, ctx.config.builder.strict_output);
    info!(mode = directive.mode(), ?policy, "running builder");
    match directive {
        BuilderDirective::Agent(build) => agent::run(ctx, task, build, policy, usage),
        BuilderDirective::Patch(build) => patch::run(ctx, task, build),
        BuilderDirective::ExternalDriver(build) => external::run(ctx, task, build, policy),
    }
}

/// `min(requested, configured)`, never below one turn.
pub fn clamp_max_turns(requested: Option<u32>, configured: u32) -> u32 {
    requested.map_or(configured, |turns| turns.min(configured)).max(1)
}

/// Parse builder text into a result, applying `policy` when it is unusable.
pub(crate) fn parse_builder_output(
    mode: &str,
    text: &str,
    policy: FailurePolicy,
) -> Result<BuilderInvocationResult> {
    let value = match extract_json_object(text) {
        Ok((value, _)) => value,
        Err(kind) => {
            return Ok(BuilderInvocationResult::unusable_output(
                mode,
                policy,
                text.to_string(),
                kind,
                vec![format!("no JSON object in builder output ({kind:?})")],
            ));
        }
    };
    let errors = schema_errors(SchemaKind::BuilderResult, &value)?;
    if !errors.is_empty() {
        return Ok(BuilderInvocationResult::unusable_output(
            mode,
            policy,
            text.to_string(),
            ParseErrorKind::SchemaMismatch,
            errors,
        ));
    }
    let result: BuilderResult = match serde_json::from_value(value) {
        Ok(result) => result,
        Err(err) => {
            return Ok(BuilderInvocationResult::unusable_output(
                mode,
                policy,
                text.to_string(),
                ParseErrorKind::SchemaMismatch,
                vec![err.to_string()],
            ));
        }
    };
    Ok(from_reported(mode, result, text.to_string()))
}

/// A builder that reports `failed` did not succeed, whatever its exit status.
fn from_reported(mode: &str, result: BuilderResult, raw: String) -> BuilderInvocationResult {
    if result.status == BuilderStatus::Failed {
        let mut failed = BuilderInvocationResult::failed(mode, None, result.summary.clone());
        failed.builder_output_valid = true;
        failed.raw_response = Some(raw);
        failed.result = Some(result);
        return failed;
    }
    BuilderInvocationResult::succeeded(mode, Some(result), Some(raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::builder_outcome::resolve_builder_failure_code;

    #[test]
    fn clamps_requested_turns() {
        assert_eq!(clamp_max_turns(Some(100), 40), 40);
        assert_eq!(clamp_max_turns(Some(5), 40), 5);
        assert_eq!(clamp_max_turns(None, 40), 40);
        assert_eq!(clamp_max_turns(Some(0), 40), 1);
    }

    #[test]
    fn valid_output_succeeds() {
        let result = parse_builder_output(
            "agent",
            r#"done: {"status": "done", "summary": "added parser"}"#,
            FailurePolicy::FailClosed,
        )
        .expect("parse");
        assert!(result.success);
        assert!(result.builder_output_valid);
    }

    /// Verifies the lenient policy keeps the tick going on unusable output.
    #[test]
    fn unusable_output_follows_policy() {
        let open = parse_builder_output("agent", "all done!", FailurePolicy::FailOpen).expect("parse");
        assert!(open.success);
        assert!(!open.builder_output_valid);

        let closed =
            parse_builder_output("agent", "all done!", FailurePolicy::FailClosed).expect("parse");
        assert!(!closed.success);
        assert_eq!(
            resolve_builder_failure_code(&closed),
            ReportCode::StopBuilderOutputInvalid
        );

        let mismatch = parse_builder_output(
            "agent",
            r#"{"status": "maybe", "summary": "?"}"#,
            FailurePolicy::FailClosed,
        )
        .expect("parse");
        assert_eq!(
            resolve_builder_failure_code(&mismatch),
            ReportCode::StopBuilderSchemaInvalid
        );
    }

    #[test]
    fn reported_failure_uses_claimed_code() {
        let result = parse_builder_output(
            "agent",
            r#"{"status": "failed", "summary": "timed out", "stop_code": "STOP_BUILDER_TIMEOUT"}"#,
            FailurePolicy::FailOpen,
        )
        .expect("parse");
        assert!(!result.success);
        assert_eq!(
            resolve_builder_failure_code(&result),
            ReportCode::StopBuilderTimeout
        );
    }
}
