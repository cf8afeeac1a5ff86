//! Shared deterministic types for governor core logic.
//!
//! These types define stable contracts between the planner, the builder
//! dispatcher and the judge. They should not depend on external state or I/O
//! and must remain deterministic across runs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::scope::GlobList;

/// Kind of work proposed by the planner. Decides which payload drives the tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Execute,
    Question,
    VerifyOnly,
}

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::Execute => "execute",
            TaskKind::Question => "question",
            TaskKind::VerifyOnly => "verify_only",
        }
    }

    /// Kinds that must leave the working tree untouched.
    pub fn forbids_side_effects(self) -> bool {
        matches!(self, TaskKind::Question | TaskKind::VerifyOnly)
    }
}

/// Unit of work produced once per tick by the planning agent. Read-only after parsing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub milestone_id: Option<String>,
    pub task_kind: TaskKind,
    #[serde(default)]
    pub intent: String,
    #[serde(default)]
    pub scope: TaskScope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff_limits: Option<DiffLimits>,
    #[serde(default)]
    pub verification: VerificationPlan,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub builder: Option<BuilderDirective>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control: Option<ControlSignal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question: Option<Question>,
}

/// The payload that drives the phases after ORCHESTRATE.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TaskDrive<'a> {
    Control(&'a ControlSignal),
    Question(&'a Question),
    Build(&'a BuilderDirective),
    VerifyOnly,
}

impl Task {
    /// Resolve which payload drives this task. A control signal always wins;
    /// otherwise the task kind selects the payload.
    ///
    /// Returns `None` when the payload required by the kind is missing.
    pub fn drive(&self) -> Option<TaskDrive<'_>> {
        if let Some(control) = &self.control {
            return Some(TaskDrive::Control(control));
        }
        match self.task_kind {
            TaskKind::Execute => self.builder.as_ref().map(TaskDrive::Build),
            TaskKind::Question => self.question.as_ref().map(TaskDrive::Question),
            TaskKind::VerifyOnly => Some(TaskDrive::VerifyOnly),
        }
    }

    /// Semantic checks the JSON schema cannot express.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.task_id.trim().is_empty() {
            errors.push("task_id must be non-empty".to_string());
        }
        if self.drive().is_none() {
            match self.task_kind {
                TaskKind::Execute => {
                    errors.push("execute task requires a builder directive".to_string());
                }
                TaskKind::Question => {
                    errors.push("question task requires a question payload".to_string());
                }
                TaskKind::VerifyOnly => {}
            }
        }
        if let Some(question) = &self.question
            && self.task_kind == TaskKind::Question
            && question.text.trim().is_empty()
        {
            errors.push("question.text must be non-empty".to_string());
        }
        if let Some(limits) = &self.diff_limits
            && (limits.max_files_touched == 0 || limits.max_lines_changed == 0)
        {
            errors.push("diff_limits must be > 0".to_string());
        }
        for (field, globs) in [
            ("scope.allowed_globs", &self.scope.allowed_globs),
            ("scope.forbidden_globs", &self.scope.forbidden_globs),
        ] {
            if let Err(err) = GlobList::compile(globs) {
                errors.push(format!("{field}: {err:#}"));
            }
        }
        errors
    }
}

/// Paths a task may modify.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskScope {
    pub allowed_globs: Vec<String>,
    pub forbidden_globs: Vec<String>,
    pub allow_new_files: bool,
    pub allow_lockfile_changes: bool,
}

/// Upper bounds on the size of a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffLimits {
    pub max_files_touched: u32,
    pub max_lines_changed: u32,
}

impl Default for DiffLimits {
    fn default() -> Self {
        Self {
            max_files_touched: 20,
            max_lines_changed: 800,
        }
    }
}

/// Ordered verification template ids plus interpolation parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationPlan {
    pub fast: Vec<String>,
    pub slow: Vec<String>,
    pub params: BTreeMap<String, String>,
}

impl VerificationPlan {
    pub fn is_empty(&self) -> bool {
        self.fast.is_empty() && self.slow.is_empty()
    }
}

/// Builder strategy requested by the planner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum BuilderDirective {
    Agent(AgentBuild),
    Patch(PatchBuild),
    ExternalDriver(ExternalDriverBuild),
}

impl BuilderDirective {
    pub fn mode(&self) -> &'static str {
        match self {
            BuilderDirective::Agent(_) => "agent",
            BuilderDirective::Patch(_) => "patch",
            BuilderDirective::ExternalDriver(_) => "external_driver",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentBuild {
    /// Extra instructions appended to the rendered builder prompt.
    pub instructions: String,
    /// Requested turn budget; clamped to the configured maximum.
    pub max_turns: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchBuild {
    /// Unified diff applied with `git apply`.
    pub patch: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalDriverBuild {
    /// Opaque driver identifier exported to the driver process.
    pub driver_kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlKind {
    Stop,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlSignal {
    pub signal: ControlKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

/// Terminal outcome of a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Success,
    Stop,
    Blocked,
}

impl Verdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Verdict::Success => "success",
            Verdict::Stop => "stop",
            Verdict::Blocked => "blocked",
        }
    }
}

/// `(tick_number, verdict)` retained across ticks for repeated-failure detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopHistoryEntry {
    pub tick: u64,
    pub verdict: Verdict,
}

/// Status declared by a builder in its structured result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuilderStatus {
    Done,
    Partial,
    Failed,
}

/// Structured output produced by an agent or external-driver builder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuilderResult {
    pub status: BuilderStatus,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files_changed: Vec<String>,
    /// Optional explicit stop code claimed by the builder.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_code: Option<String>,
}
