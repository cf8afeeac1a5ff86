//! Agent invoker abstraction.
//!
//! The [`AgentInvoker`] trait decouples the tick from the agent backend.
//! [`CommandInvoker`] spawns a configured CLI per role; tests use scripted
//! invokers that return predetermined text without spawning processes.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::Context;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::core::budget::TokenUsage;
use crate::core::cancel::CancelToken;
use crate::io::config::{AgentCommand, AgentsConfig};
use crate::io::process::{CommandOutput, RunLimits, run_command};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentRole {
    Planner,
    Builder,
    Reviewer,
}

impl AgentRole {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentRole::Planner => "planner",
            AgentRole::Builder => "builder",
            AgentRole::Reviewer => "reviewer",
        }
    }
}

/// Parameters for one agent call.
#[derive(Debug, Clone)]
pub struct InvokeRequest {
    pub role: AgentRole,
    /// Working directory for the agent process.
    pub workdir: PathBuf,
    /// Prompt text, piped on stdin.
    pub prompt: String,
    /// Turn budget, already clamped by the caller.
    pub max_turns: Option<u32>,
    /// Where to write the agent's stdout/stderr log.
    pub log_path: Option<PathBuf>,
}

/// Text produced by the agent plus whatever metadata its envelope carried.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvokeResponse {
    pub text: String,
    pub usage: Option<TokenUsage>,
    pub request_id: Option<String>,
}

#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("agent call cancelled")]
    Cancelled,
    #[error("agent timed out after {0:?}")]
    Timeout(Duration),
    /// Spawn failure or non-zero exit. The message carries the stderr tail so
    /// transport stalls can be classified from it.
    #[error("{message}")]
    Failed { message: String },
}

impl InvokeError {
    pub fn failed(message: impl Into<String>) -> Self {
        InvokeError::Failed {
            message: message.into(),
        }
    }
}

/// Abstraction over agent execution backends.
pub trait AgentInvoker {
    fn invoke(
        &self,
        request: &InvokeRequest,
        cancel: &CancelToken,
    ) -> Result<InvokeResponse, InvokeError>;
}

/// Invoker that spawns the configured command for each role.
pub struct CommandInvoker {
    agents: AgentsConfig,
    kill_grace: Duration,
}

impl CommandInvoker {
    pub fn new(agents: AgentsConfig, kill_grace: Duration) -> Self {
        Self { agents, kill_grace }
    }

    fn command_for(&self, role: AgentRole) -> &AgentCommand {
        match role {
            AgentRole::Planner => &self.agents.planner,
            AgentRole::Builder => &self.agents.builder,
            AgentRole::Reviewer => &self.agents.reviewer,
        }
    }
}

impl AgentInvoker for CommandInvoker {
    #[instrument(skip_all, fields(role = request.role.as_str()))]
    fn invoke(
        &self,
        request: &InvokeRequest,
        cancel: &CancelToken,
    ) -> Result<InvokeResponse, InvokeError> {
        let spec = self.command_for(request.role);
        let Some((program, args)) = spec.command.split_first() else {
            return Err(InvokeError::failed(format!(
                "no command configured for {}",
                request.role.as_str()
            )));
        };
        info!(program = %program, workdir = %request.workdir.display(), "starting agent");

        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&request.workdir);
        if let (Some(flag), Some(turns)) = (&spec.max_turns_flag, request.max_turns) {
            cmd.arg(flag).arg(turns.to_string());
        }

        let output = run_command(
            cmd,
            Some(request.prompt.clone().into_bytes()),
            &RunLimits {
                timeout: spec.timeout(),
                kill_grace: self.kill_grace,
                output_limit_bytes: spec.output_limit_bytes,
                cancel: Some(cancel),
            },
        )
        .map_err(|err| InvokeError::failed(format!("spawn {program}: {err:#}")))?;

        if let Some(path) = &request.log_path
            && let Err(err) = write_agent_log(path, &output)
        {
            warn!(err = %err, "failed to write agent log");
        }

        if output.cancelled {
            return Err(InvokeError::Cancelled);
        }
        if output.timed_out {
            warn!(timeout_secs = spec.timeout_secs, "agent timed out");
            return Err(InvokeError::Timeout(spec.timeout()));
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "agent failed");
            return Err(InvokeError::failed(format!(
                "{program} exited with status {:?}: {}",
                output.status.code(),
                output.stderr_lossy().trim()
            )));
        }

        let response = parse_envelope(&output.stdout_lossy());
        debug!(
            text_len = response.text.len(),
            has_usage = response.usage.is_some(),
            "agent completed"
        );
        Ok(response)
    }
}

/// Pull the final text, token usage and request id out of agent stdout.
///
/// Handles a single JSON envelope (`{"result": ..., "usage": ...}`) and
/// JSON-lines event streams, where the last event carrying a result wins and
/// usage is summed. Anything else is returned verbatim as text.
pub fn parse_envelope(stdout: &str) -> InvokeResponse {
    let trimmed = stdout.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed)
        && let Some(text) = envelope_text(&value)
    {
        return InvokeResponse {
            text,
            usage: envelope_usage(&value),
            request_id: envelope_request_id(&value),
        };
    }

    let events: Vec<Value> = trimmed
        .lines()
        .filter_map(|line| serde_json::from_str::<Value>(line.trim()).ok())
        .filter(Value::is_object)
        .collect();
    let Some(text) = events.iter().rev().find_map(envelope_text) else {
        return InvokeResponse {
            text: stdout.to_string(),
            usage: None,
            request_id: None,
        };
    };
    let usage = events
        .iter()
        .filter_map(envelope_usage)
        .reduce(|a, b| TokenUsage {
            input_tokens: a.input_tokens + b.input_tokens,
            output_tokens: a.output_tokens + b.output_tokens,
        });
    InvokeResponse {
        text,
        usage,
        request_id: events.iter().rev().find_map(envelope_request_id),
    }
}

fn envelope_text(value: &Value) -> Option<String> {
    ["result", "last_message", "text"]
        .iter()
        .find_map(|key| value.get(*key).and_then(Value::as_str))
        .map(str::to_string)
}

fn envelope_usage(value: &Value) -> Option<TokenUsage> {
    let usage = value.get("usage")?;
    let field = |key: &str| usage.get(key).and_then(Value::as_u64).unwrap_or(0);
    Some(TokenUsage {
        input_tokens: field("input_tokens"),
        output_tokens: field("output_tokens"),
    })
}

fn envelope_request_id(value: &Value) -> Option<String> {
    value
        .get("request_id")
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn write_agent_log(path: &Path, output: &CommandOutput) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create agent log dir {}", parent.display()))?;
    }
    let mut buf = String::new();
    buf.push_str("=== stdout ===\n");
    buf.push_str(&output.stdout_truncated_notice("agent"));
    buf.push_str(&output.stdout_lossy());
    buf.push_str("\n=== stderr ===\n");
    buf.push_str(&output.stderr_truncated_notice("agent"));
    buf.push_str(&output.stderr_lossy());
    if output.timed_out {
        buf.push_str("\n[agent timed out]\n");
    }
    fs::write(path, buf).with_context(|| format!("write agent log {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agents_with(command: &[&str]) -> AgentsConfig {
        let cmd = AgentCommand {
            command: command.iter().map(|s| s.to_string()).collect(),
            timeout_secs: 10,
            ..AgentCommand::default()
        };
        AgentsConfig {
            planner: cmd.clone(),
            builder: cmd.clone(),
            reviewer: cmd,
            ..AgentsConfig::default()
        }
    }

    fn request(workdir: &Path, prompt: &str) -> InvokeRequest {
        InvokeRequest {
            role: AgentRole::Planner,
            workdir: workdir.to_path_buf(),
            prompt: prompt.to_string(),
            max_turns: None,
            log_path: Some(workdir.join("logs").join("planner.log")),
        }
    }

    /// Verifies a single result envelope yields text, usage and request id.
    #[test]
    fn parses_single_envelope() {
        let response = parse_envelope(
            r#"{"result":"{\"task_id\":\"t1\"}","usage":{"input_tokens":10,"output_tokens":5},"request_id":"req_1"}"#,
        );
        assert_eq!(response.text, r#"{"task_id":"t1"}"#);
        assert_eq!(
            response.usage,
            Some(TokenUsage {
                input_tokens: 10,
                output_tokens: 5
            })
        );
        assert_eq!(response.request_id.as_deref(), Some("req_1"));
    }

    /// Verifies JSON-lines streams sum usage and keep the last result.
    #[test]
    fn parses_event_stream() {
        let stdout = [
            r#"{"type":"turn","usage":{"input_tokens":3,"output_tokens":1}}"#,
            "not json",
            r#"{"type":"final","result":"done","usage":{"input_tokens":4,"output_tokens":2}}"#,
        ]
        .join("\n");
        let response = parse_envelope(&stdout);
        assert_eq!(response.text, "done");
        assert_eq!(
            response.usage,
            Some(TokenUsage {
                input_tokens: 7,
                output_tokens: 3
            })
        );
    }

    #[test]
    fn plain_text_passes_through() {
        let response = parse_envelope("here is the task:\n```json\n{}\n```\n");
        assert!(response.text.contains("```json"));
        assert_eq!(response.usage, None);
    }

    /// Verifies the prompt reaches the agent on stdin and the log is written.
    #[cfg(unix)]
    #[test]
    fn command_invoker_pipes_prompt() {
        let temp = tempfile::tempdir().expect("tempdir");
        let invoker = CommandInvoker::new(agents_with(&["cat"]), Duration::from_millis(200));
        let response = invoker
            .invoke(&request(temp.path(), "plan something"), &CancelToken::new())
            .expect("invoke");
        assert_eq!(response.text, "plan something");
        assert!(temp.path().join("logs").join("planner.log").exists());
    }

    #[cfg(unix)]
    #[test]
    fn command_invoker_reports_failure_with_stderr() {
        let temp = tempfile::tempdir().expect("tempdir");
        let invoker = CommandInvoker::new(
            agents_with(&["sh", "-c", "echo 'stream disconnected before completion' >&2; exit 1"]),
            Duration::from_millis(200),
        );
        let err = invoker
            .invoke(&request(temp.path(), ""), &CancelToken::new())
            .expect_err("fails");
        assert!(matches!(err, InvokeError::Failed { .. }));
        assert!(err.to_string().contains("stream disconnected"));
    }

    #[cfg(unix)]
    #[test]
    fn command_invoker_honours_cancellation() {
        let temp = tempfile::tempdir().expect("tempdir");
        let invoker = CommandInvoker::new(agents_with(&["sleep", "30"]), Duration::from_millis(200));
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = invoker
            .invoke(&request(temp.path(), ""), &cancel)
            .expect_err("cancelled");
        assert!(matches!(err, InvokeError::Cancelled));
    }
}
