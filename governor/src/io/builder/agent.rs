//! Agent mode: a code-writing agent edits the working tree directly.

use anyhow::Result;
use tracing::{debug, warn};

use super::{BuildContext, clamp_max_turns, parse_builder_output};
use crate::core::budget::TickUsage;
use crate::core::builder_outcome::{BuilderInvocationResult, FailurePolicy};
use crate::core::cancel::Cancelled;
use crate::core::codes::ReportCode;
use crate::core::types::{AgentBuild, Task};
use crate::io::invoker::{AgentInvoker, AgentRole, InvokeError, InvokeRequest};

const MODE: &str = "agent";

pub(super) fn run<I: AgentInvoker>(
    ctx: &BuildContext<'_, I>,
    task: &Task,
    build: &AgentBuild,
    policy: FailurePolicy,
    usage: &mut TickUsage,
) -> Result<BuilderInvocationResult> {
    let limits = task.diff_limits.unwrap_or(ctx.config.diff_limits);
    let max_turns = clamp_max_turns(build.max_turns, ctx.config.builder.max_turns);
    let prompt = ctx.prompts.builder(task, build, &limits)?;
    debug!(max_turns, prompt_len = prompt.len(), "invoking builder agent");

    let request = InvokeRequest {
        role: AgentRole::Builder,
        workdir: ctx.git.workdir().to_path_buf(),
        prompt,
        max_turns: Some(max_turns),
        log_path: Some(ctx.log_dir.join("builder.log")),
    };
    let response = match ctx.invoker.invoke(&request, ctx.cancel) {
        Ok(response) => response,
        Err(err) => {
            usage.record_agent_call(None, ctx.pricing);
            warn!(err = %err, "builder agent failed");
            return match err {
                InvokeError::Cancelled => Err(Cancelled.into()),
                InvokeError::Timeout(_) => Ok(BuilderInvocationResult::failed(
                    MODE,
                    Some(ReportCode::StopBuilderTimeout),
                    err.to_string(),
                )),
                InvokeError::Failed { message } => Ok(BuilderInvocationResult::failed(
                    MODE,
                    Some(ReportCode::StopBuilderFailed),
                    message,
                )),
            };
        }
    };
    usage.record_agent_call(response.usage, ctx.pricing);
    parse_builder_output(MODE, &response.text, policy)
}
