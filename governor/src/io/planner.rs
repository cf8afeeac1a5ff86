//! Planning agent: obtains one validated [`Task`] per tick.

use std::path::Path;

use tracing::{info, instrument, warn};

use crate::core::budget::{TickUsage, TokenPricing};
use crate::core::cancel::CancelToken;
use crate::core::json_extract::extract_json_object;
use crate::core::stall::{StallClassification, classify_stall};
use crate::core::types::Task;
use crate::io::invoker::{AgentInvoker, AgentRole, InvokeError, InvokeRequest};
use crate::io::prompt::{PlannerPromptInputs, PromptBuilder};
use crate::io::schema::{SchemaKind, schema_errors};

/// Why no task could be obtained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanFailure {
    /// Every attempt returned something that is not a valid task.
    Invalid { attempts: u32, errors: Vec<String> },
    /// The invocation itself failed.
    Failed {
        message: String,
        stall: StallClassification,
    },
    Cancelled,
}

/// One planner session within a tick.
pub struct Planner<'a, I: AgentInvoker> {
    pub invoker: &'a I,
    pub prompts: &'a PromptBuilder,
    pub workdir: &'a Path,
    pub log_dir: &'a Path,
    /// Extra calls allowed after malformed output.
    pub max_retries: u32,
    pub pricing: &'a TokenPricing,
}

impl<I: AgentInvoker> Planner<'_, I> {
    /// Ask for a task, re-prompting with the rejection reasons on malformed output.
    #[instrument(skip_all, fields(max_retries = self.max_retries))]
    pub fn request_task(
        &self,
        inputs: &PlannerPromptInputs,
        usage: &mut TickUsage,
        cancel: &CancelToken,
    ) -> Result<Task, PlanFailure> {
        let mut inputs = inputs.clone();
        let mut errors = Vec::new();
        for attempt in 1..=self.max_retries + 1 {
            if cancel.is_cancelled() {
                return Err(PlanFailure::Cancelled);
            }
            inputs.feedback = errors.clone();
            let prompt = self
                .prompts
                .planner(&inputs)
                .map_err(|err| PlanFailure::Failed {
                    message: format!("render planner prompt: {err:#}"),
                    stall: StallClassification::default(),
                })?;
            let request = InvokeRequest {
                role: AgentRole::Planner,
                workdir: self.workdir.to_path_buf(),
                prompt,
                max_turns: None,
                log_path: Some(self.log_dir.join(format!("planner-{attempt}.log"))),
            };
            let response = match self.invoker.invoke(&request, cancel) {
                Ok(response) => response,
                Err(err) => {
                    usage.record_agent_call(None, self.pricing);
                    return Err(invoke_failure(err));
                }
            };
            usage.record_agent_call(response.usage, self.pricing);

            match parse_task(&response.text) {
                Ok(task) => {
                    info!(task_id = %task.task_id, kind = task.task_kind.as_str(), attempt, "planner produced task");
                    return Ok(task);
                }
                Err(rejected) => {
                    warn!(attempt, errors = ?rejected, "planner output rejected");
                    errors = rejected;
                }
            }
        }
        Err(PlanFailure::Invalid {
            attempts: self.max_retries + 1,
            errors,
        })
    }
}

fn invoke_failure(err: InvokeError) -> PlanFailure {
    match err {
        InvokeError::Cancelled => PlanFailure::Cancelled,
        InvokeError::Timeout(after) => PlanFailure::Failed {
            message: format!("planner timed out after {after:?}"),
            stall: StallClassification {
                stalled: true,
                request_id: None,
                pattern: Some("agent_timeout".to_string()),
            },
        },
        InvokeError::Failed { message } => PlanFailure::Failed {
            stall: classify_stall(&message),
            message,
        },
    }
}

/// Extract, schema-check and semantically validate a task from agent text.
pub fn parse_task(text: &str) -> Result<Task, Vec<String>> {
    let (value, _) = extract_json_object(text)
        .map_err(|kind| vec![format!("no JSON task object in reply ({kind:?})")])?;
    let errors = schema_errors(SchemaKind::Task, &value).map_err(|err| vec![format!("{err:#}")])?;
    if !errors.is_empty() {
        return Err(errors);
    }
    let task: Task = serde_json::from_value(value)
        .map_err(|err| vec![format!("task does not deserialize: {err}")])?;
    let errors = task.validate();
    if !errors.is_empty() {
        return Err(errors);
    }
    Ok(task)
}
