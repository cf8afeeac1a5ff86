//! Reviewing agent consulted before BUILD when risk warrants it.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::core::budget::{TickUsage, TokenPricing};
use crate::core::cancel::CancelToken;
use crate::core::json_extract::extract_json_object;
use crate::core::types::{Question, Task};
use crate::io::invoker::{AgentInvoker, AgentRole, InvokeError, InvokeRequest};
use crate::io::prompt::{PromptBuilder, ReviewerPromptInputs};
use crate::io::schema::{SchemaKind, schema_errors};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    Proceed,
    ForcePatch,
    AskQuestion,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewerVerdict {
    pub decision: ReviewDecision,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question: Option<Question>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviewFailure {
    Invalid(Vec<String>),
    Failed(String),
    Cancelled,
}

pub struct Reviewer<'a, I: AgentInvoker> {
    pub invoker: &'a I,
    pub prompts: &'a PromptBuilder,
    pub workdir: &'a Path,
    pub log_dir: &'a Path,
    pub pricing: &'a TokenPricing,
}

impl<I: AgentInvoker> Reviewer<'_, I> {
    #[instrument(skip_all, fields(task_id = %task.task_id))]
    pub fn review(
        &self,
        task: &Task,
        reason: &str,
        flags: Vec<String>,
        usage: &mut TickUsage,
        cancel: &CancelToken,
    ) -> Result<ReviewerVerdict, ReviewFailure> {
        let prompt = self
            .prompts
            .reviewer(&ReviewerPromptInputs {
                task,
                reason,
                flags,
            })
            .map_err(|err| ReviewFailure::Failed(format!("render reviewer prompt: {err:#}")))?;
        let request = InvokeRequest {
            role: AgentRole::Reviewer,
            workdir: self.workdir.to_path_buf(),
            prompt,
            max_turns: None,
            log_path: Some(self.log_dir.join("reviewer.log")),
        };
        let response = match self.invoker.invoke(&request, cancel) {
            Ok(response) => response,
            Err(InvokeError::Cancelled) => {
                usage.record_agent_call(None, self.pricing);
                return Err(ReviewFailure::Cancelled);
            }
            Err(err) => {
                usage.record_agent_call(None, self.pricing);
                warn!(err = %err, "reviewer call failed");
                return Err(ReviewFailure::Failed(err.to_string()));
            }
        };
        usage.record_agent_call(response.usage, self.pricing);

        let verdict = parse_verdict(&response.text).map_err(ReviewFailure::Invalid)?;
        info!(decision = ?verdict.decision, "reviewer decided");
        Ok(verdict)
    }
}

pub fn parse_verdict(text: &str) -> Result<ReviewerVerdict, Vec<String>> {
    let (value, _) = extract_json_object(text)
        .map_err(|kind| vec![format!("no JSON verdict in reply ({kind:?})")])?;
    let errors =
        schema_errors(SchemaKind::ReviewerVerdict, &value).map_err(|err| vec![format!("{err:#}")])?;
    if !errors.is_empty() {
        return Err(errors);
    }
    let verdict: ReviewerVerdict = serde_json::from_value(value)
        .map_err(|err| vec![format!("verdict does not deserialize: {err}")])?;
    if verdict.decision == ReviewDecision::AskQuestion && verdict.question.is_none() {
        return Err(vec!["ask_question requires a question".to_string()]);
    }
    Ok(verdict)
}
