//! Immutable in-flight record of one tick.
//!
//! Every transition consumes the state and returns a new value, so whatever
//! the orchestrator last held is always a coherent snapshot to report from.

use serde::Serialize;

use crate::core::builder_outcome::BuilderInvocationResult;
use crate::core::types::Task;

/// Phases in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Lock,
    Preflight,
    Orchestrate,
    Build,
    Judge,
    Report,
    End,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Lock => "LOCK",
            Phase::Preflight => "PREFLIGHT",
            Phase::Orchestrate => "ORCHESTRATE",
            Phase::Build => "BUILD",
            Phase::Judge => "JUDGE",
            Phase::Report => "REPORT",
            Phase::End => "END",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TickState {
    phase: Phase,
    run_id: String,
    started_at: String,
    base_commit: Option<String>,
    task: Option<Task>,
    builder_result: Option<BuilderInvocationResult>,
    errors: Vec<String>,
}

impl TickState {
    pub fn new(run_id: impl Into<String>, started_at: impl Into<String>) -> Self {
        Self {
            phase: Phase::Lock,
            run_id: run_id.into(),
            started_at: started_at.into(),
            base_commit: None,
            task: None,
            builder_result: None,
            errors: Vec::new(),
        }
    }

    /// Move to `phase`. Phases may be skipped but never revisited.
    #[must_use]
    pub fn enter(self, phase: Phase) -> Self {
        debug_assert!(phase >= self.phase, "{:?} -> {:?}", self.phase, phase);
        Self { phase, ..self }
    }

    #[must_use]
    pub fn with_base_commit(self, commit: impl Into<String>) -> Self {
        Self {
            base_commit: Some(commit.into()),
            ..self
        }
    }

    #[must_use]
    pub fn with_task(self, task: Task) -> Self {
        Self {
            task: Some(task),
            ..self
        }
    }

    #[must_use]
    pub fn with_builder_result(self, result: BuilderInvocationResult) -> Self {
        Self {
            builder_result: Some(result),
            ..self
        }
    }

    #[must_use]
    pub fn with_error(self, error: impl Into<String>) -> Self {
        let mut errors = self.errors;
        errors.push(error.into());
        Self { errors, ..self }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn started_at(&self) -> &str {
        &self.started_at
    }

    pub fn base_commit(&self) -> Option<&str> {
        self.base_commit.as_deref()
    }

    pub fn task(&self) -> Option<&Task> {
        self.task.as_ref()
    }

    pub fn builder_result(&self) -> Option<&BuilderInvocationResult> {
        self.builder_result.as_ref()
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }
}
