//! Test-only helpers: a real temp git repo, scripted agents and checks, and
//! task builders.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tempfile::TempDir;

use crate::core::cancel::CancelToken;
use crate::core::types::{
    AgentBuild, BuilderDirective, ControlKind, ControlSignal, PatchBuild, Question, Task,
    TaskKind, TaskScope, VerificationPlan,
};
use crate::io::config::{GovernorConfig, VerifyTemplate};
use crate::io::git::Git;
use crate::io::invoker::{AgentInvoker, AgentRole, InvokeError, InvokeRequest, InvokeResponse};
use crate::io::paths::{DEFAULT_STATE_DIR, GovernorPaths};
use crate::io::report::{Report, ReportRenderer};
use crate::io::verify::{CheckExecution, CheckRunner};

/// A temporary git repository with one commit containing `README.md`.
pub struct TestRepo {
    dir: TempDir,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create tempdir")?;
        let repo = Self { dir };
        repo.git_cmd(&["init", "-q"])?;
        repo.git_cmd(&["config", "user.email", "test@example.com"])?;
        repo.git_cmd(&["config", "user.name", "test"])?;
        repo.write("README.md", "hi\n")?;
        repo.commit_all("init")?;
        Ok(repo)
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn git(&self) -> Git {
        Git::new(self.path())
    }

    pub fn paths(&self) -> GovernorPaths {
        GovernorPaths::new(self.path(), DEFAULT_STATE_DIR)
    }

    pub fn head(&self) -> Result<String> {
        self.git().head_sha()
    }

    /// Write `contents` to `rel`, creating parent directories.
    pub fn write(&self, rel: &str, contents: &str) -> Result<()> {
        write_under(self.path(), rel, contents)
    }

    pub fn read(&self, rel: &str) -> Result<String> {
        let path = self.path().join(rel);
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))
    }

    pub fn commit_all(&self, message: &str) -> Result<()> {
        self.git_cmd(&["add", "-A"])?;
        self.git_cmd(&["commit", "-q", "--allow-empty", "-m", message])
    }

    /// Number of commits reachable from HEAD.
    pub fn commit_count(&self) -> Result<u32> {
        let output = Command::new("git")
            .args(["rev-list", "--count", "HEAD"])
            .current_dir(self.path())
            .output()
            .context("spawn git rev-list")?;
        String::from_utf8_lossy(&output.stdout)
            .trim()
            .parse()
            .context("parse commit count")
    }

    fn git_cmd(&self, args: &[&str]) -> Result<()> {
        let status = Command::new("git")
            .args(args)
            .current_dir(self.path())
            .status()
            .with_context(|| format!("spawn git {}", args.join(" ")))?;
        if !status.success() {
            return Err(anyhow!("git {} failed", args.join(" ")));
        }
        Ok(())
    }
}

fn write_under(root: &Path, rel: &str, contents: &str) -> Result<()> {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    fs::write(&path, contents).with_context(|| format!("write {}", path.display()))
}

fn run_in(workdir: &Path, argv: &[String]) -> Result<()> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| anyhow!("empty scripted command"))?;
    let status = Command::new(program)
        .args(args)
        .current_dir(workdir)
        .status()
        .with_context(|| format!("spawn {}", argv.join(" ")))?;
    if !status.success() {
        return Err(anyhow!("{} failed", argv.join(" ")));
    }
    Ok(())
}

/// What a scripted agent call returns.
#[derive(Debug, Clone)]
pub enum Reply {
    Text(String),
    Fail(String),
    Timeout,
    /// Cancels the tick's token, as a signal arriving mid-call would.
    Cancel,
}

/// One expected agent call.
#[derive(Debug, Clone)]
pub struct ScriptedCall {
    pub role: AgentRole,
    pub reply: Reply,
    /// Commands run in the workdir before replying, as an agent's tools would.
    pub commands: Vec<Vec<String>>,
    /// Files written into the workdir before replying, as `(path, contents)`.
    pub writes: Vec<(String, String)>,
}

impl ScriptedCall {
    pub fn new(role: AgentRole, reply: Reply) -> Self {
        Self {
            role,
            reply,
            commands: Vec::new(),
            writes: Vec::new(),
        }
    }

    /// Planner returning `task` as JSON.
    pub fn planner(task: &Task) -> Self {
        let text = serde_json::to_string(task).unwrap_or_default();
        Self::new(AgentRole::Planner, Reply::Text(text))
    }

    /// Builder reporting success with `summary`.
    pub fn builder_done(summary: &str) -> Self {
        let text = serde_json::json!({"status": "done", "summary": summary}).to_string();
        Self::new(AgentRole::Builder, Reply::Text(text))
    }

    /// Reviewer returning `decision` with `reason`.
    pub fn reviewer(decision: &str, reason: &str) -> Self {
        let text = serde_json::json!({"decision": decision, "reason": reason}).to_string();
        Self::new(AgentRole::Reviewer, Reply::Text(text))
    }

    #[must_use]
    pub fn writing(mut self, rel: &str, contents: &str) -> Self {
        self.writes.push((rel.to_string(), contents.to_string()));
        self
    }

    #[must_use]
    pub fn running(mut self, argv: &[&str]) -> Self {
        self.commands
            .push(argv.iter().map(|arg| (*arg).to_string()).collect());
        self
    }
}

/// Agent invoker that replays a fixed script and records the roles called.
#[derive(Debug, Default)]
pub struct ScriptedInvoker {
    calls: RefCell<VecDeque<ScriptedCall>>,
    seen: RefCell<Vec<AgentRole>>,
    prompts: RefCell<Vec<String>>,
}

impl ScriptedInvoker {
    pub fn new(calls: Vec<ScriptedCall>) -> Self {
        Self {
            calls: RefCell::new(calls.into()),
            ..Self::default()
        }
    }

    /// Roles called so far, in order.
    pub fn seen(&self) -> Vec<AgentRole> {
        self.seen.borrow().clone()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.borrow().clone()
    }

    pub fn remaining(&self) -> usize {
        self.calls.borrow().len()
    }
}

impl AgentInvoker for ScriptedInvoker {
    fn invoke(
        &self,
        request: &InvokeRequest,
        cancel: &CancelToken,
    ) -> Result<InvokeResponse, InvokeError> {
        self.seen.borrow_mut().push(request.role);
        self.prompts.borrow_mut().push(request.prompt.clone());
        let Some(call) = self.calls.borrow_mut().pop_front() else {
            return Err(InvokeError::failed(format!(
                "script exhausted at {} call",
                request.role.as_str()
            )));
        };
        if call.role != request.role {
            return Err(InvokeError::failed(format!(
                "script expected {} call, got {}",
                call.role.as_str(),
                request.role.as_str()
            )));
        }
        for argv in &call.commands {
            run_in(&request.workdir, argv).map_err(|err| InvokeError::failed(format!("{err:#}")))?;
        }
        for (rel, contents) in &call.writes {
            write_under(&request.workdir, rel, contents)
                .map_err(|err| InvokeError::failed(format!("{err:#}")))?;
        }
        match call.reply {
            Reply::Text(text) => Ok(InvokeResponse {
                text,
                ..InvokeResponse::default()
            }),
            Reply::Fail(message) => Err(InvokeError::failed(message)),
            Reply::Timeout => Err(InvokeError::Timeout(Duration::from_secs(1))),
            Reply::Cancel => {
                cancel.cancel();
                Err(InvokeError::Cancelled)
            }
        }
    }
}

/// Check runner with scripted pass/fail results; passes once the script runs out.
#[derive(Debug, Default)]
pub struct ScriptedChecks {
    results: RefCell<VecDeque<bool>>,
    seen: RefCell<Vec<Vec<String>>>,
    writes: Vec<(String, String)>,
}

impl ScriptedChecks {
    pub fn new(results: Vec<bool>) -> Self {
        Self {
            results: RefCell::new(results.into()),
            ..Self::default()
        }
    }

    pub fn passing() -> Self {
        Self::default()
    }

    /// Every check also writes these files, like a test run leaving output behind.
    #[must_use]
    pub fn writing(mut self, rel: &str, contents: &str) -> Self {
        self.writes.push((rel.to_string(), contents.to_string()));
        self
    }

    pub fn seen(&self) -> Vec<Vec<String>> {
        self.seen.borrow().clone()
    }
}

impl CheckRunner for ScriptedChecks {
    fn run(
        &self,
        argv: &[String],
        workdir: &Path,
        _timeout: Duration,
        _cancel: &CancelToken,
    ) -> Result<CheckExecution> {
        self.seen.borrow_mut().push(argv.to_vec());
        for (rel, contents) in &self.writes {
            write_under(workdir, rel, contents)?;
        }
        let success = self.results.borrow_mut().pop_front().unwrap_or(true);
        Ok(CheckExecution {
            success,
            exit_code: Some(if success { 0 } else { 1 }),
            timed_out: false,
            cancelled: false,
            output: if success { "ok".to_string() } else { "boom".to_string() },
        })
    }
}

/// Renderer that always fails, for checking REPORT.json survives it.
pub struct FailingRenderer;

impl ReportRenderer for FailingRenderer {
    fn render(&self, _report: &Report) -> Result<String> {
        Err(anyhow!("renderer exploded"))
    }
}

/// Defaults plus a `unit` verification template.
pub fn test_config() -> GovernorConfig {
    let mut templates = BTreeMap::new();
    templates.insert(
        "unit".to_string(),
        VerifyTemplate {
            argv: vec!["cargo".to_string(), "test".to_string()],
            timeout_secs: None,
            reruns_on_failure: 0,
        },
    );
    let mut config = GovernorConfig::default();
    config.verification.templates = templates;
    config
}

/// Execute task built by an agent, allowed to add files anywhere.
pub fn execute_task(id: &str) -> Task {
    Task {
        task_id: id.to_string(),
        milestone_id: None,
        task_kind: TaskKind::Execute,
        intent: format!("{id} intent"),
        scope: TaskScope {
            allow_new_files: true,
            ..TaskScope::default()
        },
        diff_limits: None,
        verification: VerificationPlan {
            fast: vec!["unit".to_string()],
            ..VerificationPlan::default()
        },
        builder: Some(BuilderDirective::Agent(AgentBuild::default())),
        control: None,
        question: None,
    }
}

/// Execute task applying `patch` instead of calling a builder agent.
pub fn patch_task(id: &str, patch: &str) -> Task {
    Task {
        builder: Some(BuilderDirective::Patch(PatchBuild {
            patch: patch.to_string(),
        })),
        ..execute_task(id)
    }
}

pub fn question_task(id: &str, text: &str) -> Task {
    Task {
        task_kind: TaskKind::Question,
        builder: None,
        verification: VerificationPlan::default(),
        question: Some(Question {
            text: text.to_string(),
            options: Vec::new(),
            context: None,
        }),
        ..execute_task(id)
    }
}

pub fn verify_only_task(id: &str) -> Task {
    Task {
        task_kind: TaskKind::VerifyOnly,
        builder: None,
        ..execute_task(id)
    }
}

pub fn stop_task(reason: &str) -> Task {
    Task {
        control: Some(ControlSignal {
            signal: ControlKind::Stop,
            reason: Some(reason.to_string()),
        }),
        ..execute_task("stop")
    }
}

/// Path of `rel` inside the state dir of `repo`.
pub fn state_file(repo: &TestRepo, rel: &str) -> PathBuf {
    repo.paths().state_dir.join(rel)
}
