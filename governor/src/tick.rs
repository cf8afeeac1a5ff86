//! Orchestration for a single governed tick.
//!
//! Phases run in order: LOCK, PREFLIGHT, ORCHESTRATE, BUILD, JUDGE, REPORT,
//! END. Every path out of a tick, including faults and cancellation, writes
//! REPORT.json before the lock is released.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::core::blast::{TouchedFiles, check_diff_limits};
use crate::core::budget::TickUsage;
use crate::core::builder_outcome::resolve_builder_failure_code;
use crate::core::cancel::{CancelToken, Cancelled, is_cancellation};
use crate::core::codes::ReportCode;
use crate::core::fingerprint::fingerprint;
use crate::core::risk::{
    DiffAnalysis, EscalationMode, EscalationState, RiskInputs, RiskTrigger, compute_risk_flags,
    should_escalate,
};
use crate::core::scope::{ScopeMatcher, check_scope_violations};
use crate::core::tick_state::{Phase, TickState};
use crate::core::types::{Question, Task, TaskDrive, TaskKind};
use crate::io::builder::{BuildContext, run_builder};
use crate::io::config::GovernorConfig;
use crate::io::git::Git;
use crate::io::invoker::AgentInvoker;
use crate::io::judge::{check_head_moved, compute_blast_radius, get_touched_files};
use crate::io::lock::{self, LockError, LockHandle};
use crate::io::paths::GovernorPaths;
use crate::io::planner::{PlanFailure, Planner};
use crate::io::preflight::{Preflight, run_preflight};
use crate::io::prompt::{PlannerPromptInputs, PromptBuilder};
use crate::io::report::{
    BudgetSnapshot, Report, ReportRenderer, append_question, load_report, persist_report,
};
use crate::io::reviewer::{ReviewDecision, ReviewFailure, Reviewer};
use crate::io::rollback::perform_rollback_with_clean_check;
use crate::io::verify::{CheckRunner, VerifyContext, resolve_checks, run_verifications};
use crate::io::workspace_state::{
    TickRecord, WorkspaceState, load_workspace_state, write_workspace_state,
};

/// Collaborators a tick talks to. Tests substitute scripted fakes.
pub struct TickDeps<'a, I: AgentInvoker, R: CheckRunner> {
    pub invoker: &'a I,
    pub check_runner: &'a R,
    pub renderer: &'a dyn ReportRenderer,
    pub cancel: &'a CancelToken,
}

/// Result of one tick: the persisted report and the usage it consumed.
#[derive(Debug, Clone)]
pub struct TickOutcome {
    pub report: Report,
    pub usage: TickUsage,
}

/// How the locked part of a tick ended.
#[derive(Debug, Clone)]
struct Ending {
    code: ReportCode,
    reason: Option<String>,
}

impl Ending {
    fn new(code: ReportCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: Some(reason.into()),
        }
    }

    fn bare(code: ReportCode) -> Self {
        Self { code, reason: None }
    }
}

/// Run one tick against the repository at `root`.
///
/// Policy outcomes come back as `Ok`. `Err` means a genuine fault; the
/// report for it has already been written.
#[instrument(skip_all, fields(root = %root.display()))]
pub fn run_tick<I: AgentInvoker, R: CheckRunner>(
    root: &Path,
    config: &GovernorConfig,
    deps: &TickDeps<'_, I, R>,
) -> Result<TickOutcome> {
    let paths = GovernorPaths::new(root, &config.state_dir);
    let started_at = now_rfc3339();
    let run_id = new_run_id();

    let handle = match lock::acquire(&paths.lock_path, &started_at) {
        Ok(handle) => handle,
        Err(LockError::Io(err)) => return Err(err.context("acquire workspace lock")),
        Err(err) => {
            let code = match err {
                LockError::Held(_) => ReportCode::BlockedLockHeld,
                _ => ReportCode::BlockedLockCorrupt,
            };
            warn!(%code, err = %err, "lock not acquired");
            let state = load_workspace_state(&paths.state_path).unwrap_or_default();
            let ending = Ending::new(code, err.to_string());
            return blocked_without_state(&paths, config, deps, &run_id, &started_at, &state, ending);
        }
    };

    let state = match load_workspace_state(&paths.state_path) {
        Ok(state) => state,
        Err(err) => {
            warn!(err = %format!("{err:#}"), "workspace state unreadable");
            let ending = Ending::new(ReportCode::BlockedStateCorrupt, format!("{err:#}"));
            let outcome = blocked_without_state(
                &paths,
                config,
                deps,
                &run_id,
                &started_at,
                &WorkspaceState::default(),
                ending,
            )?;
            handle.release()?;
            return Ok(outcome);
        }
    };
    let tick = state.next_tick();
    info!(run_id = %run_id, tick, "tick started");
    let mut run = TickRun {
        git: Git::new(root),
        prompts: PromptBuilder::new(config.agents.prompt_budget_bytes),
        log_dir: paths.run_dir(&run_id),
        report: Report::new(&run_id, tick, &started_at, ReportCode::Success),
        tick_state: TickState::new(&run_id, &started_at),
        usage: TickUsage::default(),
        fingerprint: None,
        paths,
        config,
        deps,
        state,
        tick,
    };
    let recovering = handle.reclaimed().is_some();
    let result = run.execute(recovering);
    run.finish(result, handle)
}

/// Blocked before the tick could use STATE.json (lock not taken, or the
/// state unreadable): report it and leave STATE.json as it is.
fn blocked_without_state<I: AgentInvoker, R: CheckRunner>(
    paths: &GovernorPaths,
    config: &GovernorConfig,
    deps: &TickDeps<'_, I, R>,
    run_id: &str,
    started_at: &str,
    state: &WorkspaceState,
    ending: Ending,
) -> Result<TickOutcome> {
    let mut report = Report::new(run_id, state.next_tick(), started_at, ending.code);
    report.set_outcome(ending.code, ending.reason);
    report.finished_at = now_rfc3339();
    report.budget = BudgetSnapshot {
        counters: state.budget,
        warnings: config.budget.warnings(&state.budget),
    };
    persist_report(paths, &report, &config.report, deps.renderer)?;
    Ok(TickOutcome {
        report,
        usage: TickUsage::default(),
    })
}

struct TickRun<'a, 'd, I: AgentInvoker, R: CheckRunner> {
    paths: GovernorPaths,
    config: &'a GovernorConfig,
    deps: &'a TickDeps<'d, I, R>,
    git: Git,
    prompts: PromptBuilder,
    log_dir: PathBuf,
    state: WorkspaceState,
    tick: u64,
    tick_state: TickState,
    report: Report,
    usage: TickUsage,
    fingerprint: Option<String>,
}

impl<I: AgentInvoker, R: CheckRunner> TickRun<'_, '_, I, R> {
    fn enter(&mut self, phase: Phase) {
        debug!(phase = phase.as_str(), "entering phase");
        self.tick_state = self.tick_state.clone().enter(phase);
    }

    fn base_commit(&self) -> Result<String> {
        self.tick_state
            .base_commit()
            .map(str::to_string)
            .context("base commit not recorded")
    }

    fn execute(&mut self, recovering: bool) -> Result<Ending> {
        self.enter(Phase::Preflight);
        match run_preflight(&self.git, &self.paths, self.config, &self.state, recovering) {
            Preflight::Ready { base_commit } => {
                self.tick_state = self.tick_state.clone().with_base_commit(base_commit);
            }
            Preflight::Blocked { code, reason } => {
                if matches!(
                    code,
                    ReportCode::BlockedDirtyWorktree | ReportCode::BlockedCrashRecoveryRequired
                ) {
                    self.report.worktree_clean_guaranteed = false;
                }
                return Ok(Ending::new(code, reason));
            }
        }
        fs::create_dir_all(&self.log_dir)
            .with_context(|| format!("create run dir {}", self.log_dir.display()))?;

        self.enter(Phase::Orchestrate);
        let task = match self.plan()? {
            Ok(task) => task,
            Err(ending) => return Ok(ending),
        };
        self.fingerprint = Some(fingerprint(&task)?);
        self.report.task_id = Some(task.task_id.clone());
        self.report.task_kind = Some(task.task_kind);
        self.tick_state = self.tick_state.clone().with_task(task.clone());

        match task.drive() {
            None => Ok(Ending::new(
                ReportCode::BlockedOrchestratorOutputInvalid,
                "task carries no payload for its kind",
            )),
            Some(TaskDrive::Control(signal)) => {
                info!(reason = ?signal.reason, "planner requested stop");
                Ok(Ending {
                    code: ReportCode::SuccessOrchestratorStop,
                    reason: signal.reason.clone(),
                })
            }
            Some(TaskDrive::Question(question)) => self.surface_planner_question(question),
            Some(TaskDrive::VerifyOnly) => self.judge(&task),
            Some(TaskDrive::Build(_)) => {
                // The judge needs the same matcher after the builder has run.
                if let Err(err) = ScopeMatcher::new(
                    &task.scope,
                    &self.config.scope,
                    &self.config.owned_globs(),
                ) {
                    return Ok(Ending::new(
                        ReportCode::BlockedOrchestratorOutputInvalid,
                        format!("task scope does not compile: {err:#}"),
                    ));
                }
                if let Some(ending) = self.review_gate(&task)? {
                    return Ok(ending);
                }
                self.build(&task)
            }
        }
    }

    /// ORCHESTRATE: obtain a task, or the ending for why none was obtained.
    fn plan(&mut self) -> Result<Result<Task, Ending>> {
        let mut inputs = PlannerPromptInputs {
            tick: self.tick,
            milestone: self.state.milestone.clone(),
            failure_streak: self.state.failure_streak,
            templates: self.config.verification.templates.keys().cloned().collect(),
            forbidden_globs: self.config.scope.forbidden_globs.clone(),
            last_report: summarize_last_report(&self.paths.report_path),
            ..PlannerPromptInputs::default()
        };
        inputs.load_context(&self.paths.goal_path, &self.paths.questions_path)?;

        let planner = Planner {
            invoker: self.deps.invoker,
            prompts: &self.prompts,
            workdir: self.git.workdir(),
            log_dir: &self.log_dir,
            max_retries: self.config.planner.max_retries,
            pricing: &self.config.budget.pricing,
        };
        let failure = match planner.request_task(&inputs, &mut self.usage, self.deps.cancel) {
            Ok(task) => return Ok(Ok(task)),
            Err(failure) => failure,
        };
        let ending = match failure {
            PlanFailure::Cancelled => return Err(Cancelled.into()),
            PlanFailure::Invalid { attempts, errors } => Ending::new(
                ReportCode::BlockedOrchestratorOutputInvalid,
                format!("{attempts} attempt(s) rejected: {}", errors.join("; ")),
            ),
            PlanFailure::Failed { message, stall } if stall.stalled => {
                let reason = format!(
                    "transport stalled ({}) during planning, request id {}: {message}",
                    stall.pattern.as_deref().unwrap_or("unknown"),
                    stall.request_id.as_deref().unwrap_or("unknown"),
                );
                self.report.stall = Some(stall);
                Ending::new(ReportCode::BlockedTransportStalled, reason)
            }
            PlanFailure::Failed { message, .. } => {
                Ending::new(ReportCode::BlockedOrchestratorFailed, message)
            }
        };
        Ok(Err(ending))
    }

    /// A question task must leave the tree untouched.
    fn surface_planner_question(&mut self, question: &Question) -> Result<Ending> {
        let base = self.base_commit()?;
        let touched = get_touched_files(&self.git, &base)?;
        if !touched.is_empty() {
            let reason = format!(
                "question task modified {} path(s): {}",
                touched.all.len(),
                touched.all.join(", ")
            );
            self.report.touched = Some(touched);
            return self.stop_after_rollback(ReportCode::StopQuestionSideEffects, reason);
        }
        self.surface_question("planner", question)?;
        Ok(Ending::bare(ReportCode::StopOrchestratorAskQuestion))
    }

    fn surface_question(&mut self, source: &str, question: &Question) -> Result<()> {
        append_question(
            &self.paths.questions_path,
            self.tick_state.run_id(),
            source,
            question,
        )?;
        self.report.question = Some(question.clone());
        Ok(())
    }

    /// Risk gate before BUILD. Returns an ending when the build must not run.
    fn review_gate(&mut self, task: &Task) -> Result<Option<Ending>> {
        let limits = task.diff_limits.unwrap_or(self.config.diff_limits);
        let budget_warning = !self.config.budget.warnings(&self.state.budget).is_empty();
        let flags = compute_risk_flags(
            &RiskInputs {
                diff: None,
                limits: &limits,
                scope: &task.scope,
                trigger: RiskTrigger::PreBuild,
                stop_history: &self.state.stop_history,
                current_tick: self.tick,
                verify_failed: self
                    .state
                    .last_code
                    .is_some_and(ReportCode::is_verify_failure),
                budget_warning,
            },
            &self.config.risk,
            &self.config.escalation,
        )?;
        let decision = should_escalate(
            &EscalationState {
                failure_streak: self.state.failure_streak,
                stop_history: &self.state.stop_history,
                risk_flags: &flags,
            },
            &self.config.escalation,
            self.tick,
        );
        let flag_names: Vec<String> = flags.iter().map(|f| f.name().to_string()).collect();
        self.report.risk_flags = flags;
        self.report.escalation = Some(decision.clone());
        let reason = decision
            .reason
            .clone()
            .unwrap_or_else(|| "risk flags raised".to_string());

        match decision.mode {
            EscalationMode::None => Ok(None),
            EscalationMode::Human => {
                warn!(%reason, "escalating to a human");
                Ok(Some(Ending::new(ReportCode::BlockedHumanEscalation, reason)))
            }
            EscalationMode::Reviewer => {
                info!(%reason, "escalating to the reviewer");
                let reviewer = Reviewer {
                    invoker: self.deps.invoker,
                    prompts: &self.prompts,
                    workdir: self.git.workdir(),
                    log_dir: &self.log_dir,
                    pricing: &self.config.budget.pricing,
                };
                let verdict = match reviewer.review(
                    task,
                    &reason,
                    flag_names,
                    &mut self.usage,
                    self.deps.cancel,
                ) {
                    Ok(verdict) => verdict,
                    Err(ReviewFailure::Cancelled) => return Err(Cancelled.into()),
                    Err(ReviewFailure::Invalid(errors)) => {
                        return Ok(Some(Ending::new(
                            ReportCode::BlockedReviewerOutputInvalid,
                            errors.join("; "),
                        )));
                    }
                    Err(ReviewFailure::Failed(message)) => {
                        return Ok(Some(Ending::new(ReportCode::BlockedReviewerFailed, message)));
                    }
                };
                self.report.reviewer = Some(verdict.clone());
                match verdict.decision {
                    ReviewDecision::Proceed => Ok(None),
                    ReviewDecision::ForcePatch => Ok(Some(self.stop_after_rollback(
                        ReportCode::StopReviewerForcedPatch,
                        verdict.reason,
                    )?)),
                    ReviewDecision::AskQuestion => {
                        let ending = self.stop_after_rollback(
                            ReportCode::StopReviewerAskQuestion,
                            verdict.reason,
                        )?;
                        if ending.code == ReportCode::StopReviewerAskQuestion
                            && let Some(question) = &verdict.question
                        {
                            self.surface_question("reviewer", question)?;
                        }
                        Ok(Some(ending))
                    }
                }
            }
        }
    }

    /// BUILD, then JUDGE on success.
    fn build(&mut self, task: &Task) -> Result<Ending> {
        self.enter(Phase::Build);
        let ctx = BuildContext {
            invoker: self.deps.invoker,
            prompts: &self.prompts,
            git: &self.git,
            paths: &self.paths,
            config: self.config,
            log_dir: &self.log_dir,
            pricing: &self.config.budget.pricing,
            cancel: self.deps.cancel,
        };
        let result = run_builder(&ctx, task, &mut self.usage)?;
        self.report.builder = Some(result.clone());
        self.tick_state = self.tick_state.clone().with_builder_result(result.clone());
        if !result.success {
            let code = resolve_builder_failure_code(&result);
            let reason = result
                .error
                .clone()
                .unwrap_or_else(|| "builder did not succeed".to_string());
            return self.stop_after_rollback(code, reason);
        }
        if !result.builder_output_valid {
            self.tick_state = self
                .tick_state
                .clone()
                .with_error("builder output was unusable; judging the diff anyway");
        }
        self.judge(task)
    }

    /// JUDGE: the fixed check sequence, then REPORT-phase commit.
    fn judge(&mut self, task: &Task) -> Result<Ending> {
        self.enter(Phase::Judge);
        let base = self.base_commit()?;

        let head = check_head_moved(&self.git, &base)?;
        if !head.ok {
            self.report.worktree_clean_guaranteed = false;
            return Ok(Ending {
                code: ReportCode::StopHeadMoved,
                reason: head.reason,
            });
        }

        let touched = get_touched_files(&self.git, &base)?;
        let blast = compute_blast_radius(&self.git, &base, &touched)?;
        self.report.touched = Some(touched.clone());
        self.report.blast_radius = Some(blast);

        let scope = match check_scope_violations(
            &touched,
            &task.scope,
            &self.config.scope,
            &self.config.owned_globs(),
        ) {
            Ok(scope) => scope,
            Err(err) => {
                return self.stop_after_rollback(
                    ReportCode::BlockedOrchestratorOutputInvalid,
                    format!("task scope does not compile: {err:#}"),
                );
            }
        };
        self.report.scope_check = Some(scope.clone());
        if let Some(code) = scope.stop_code {
            let reason = scope
                .violations
                .iter()
                .map(|v| format!("{} ({:?})", v.path, v.kind))
                .collect::<Vec<_>>()
                .join(", ");
            return self.stop_after_rollback(code, format!("scope violation: {reason}"));
        }

        let limits = task.diff_limits.unwrap_or(self.config.diff_limits);
        let diff = check_diff_limits(&blast, &limits);
        if let Some(code) = diff.stop_code {
            return self.stop_after_rollback(code, diff.reason.unwrap_or_default());
        }

        if task.task_kind.forbids_side_effects() && !touched.is_empty() {
            let code = match task.task_kind {
                TaskKind::Question => ReportCode::StopQuestionSideEffects,
                _ => ReportCode::StopVerifyOnlySideEffects,
            };
            return self.stop_after_rollback(
                code,
                format!("{} task modified {}", task.task_kind.as_str(), touched.all.join(", ")),
            );
        }

        let checks = match resolve_checks(&task.verification, &self.config.verification) {
            Ok(checks) => checks,
            Err(rejection) => return self.stop_after_rollback(rejection.code, rejection.reason),
        };
        let outcome = run_verifications(
            &checks,
            &VerifyContext {
                runner: self.deps.check_runner,
                workdir: self.git.workdir(),
                log_dir: Some(&self.log_dir),
                cancel: self.deps.cancel,
            },
        )?;
        for _ in &outcome.runs {
            self.usage.record_verify_run();
        }
        self.report.verification = outcome.runs;

        let post_flags = compute_risk_flags(
            &RiskInputs {
                diff: Some(DiffAnalysis {
                    blast: &blast,
                    touched: &touched,
                }),
                limits: &limits,
                scope: &task.scope,
                trigger: RiskTrigger::PostJudge,
                stop_history: &self.state.stop_history,
                current_tick: self.tick,
                verify_failed: outcome.failure.is_some(),
                budget_warning: !self.config.budget.warnings(&self.state.budget).is_empty(),
            },
            &self.config.risk,
            &self.config.escalation,
        )?;
        self.report.risk_flags = post_flags;

        if let Some(code) = outcome.failure {
            return self.stop_after_rollback(code, format!("verification failed ({code})"));
        }

        self.enter(Phase::Report);
        self.commit(task, &touched)
    }

    fn commit(&mut self, task: &Task, touched: &TouchedFiles) -> Result<Ending> {
        if touched.is_empty() || !self.config.git.commit_on_success {
            return Ok(Ending::bare(ReportCode::Success));
        }
        let message = commit_message(&self.config.git.commit_message_prefix, task);
        let committed = self
            .git
            .add_all()
            .and_then(|()| self.git.commit_staged(&message))
            .and_then(|_| self.git.head_sha());
        match committed {
            Ok(sha) => {
                info!(commit = %sha, "accepted change committed");
                self.report.commit = Some(sha);
                Ok(Ending::bare(ReportCode::Success))
            }
            Err(err) => {
                self.report.worktree_clean_guaranteed = false;
                Ok(Ending::new(ReportCode::BlockedCommitFailed, format!("{err:#}")))
            }
        }
    }

    /// Restore the base commit, then stop with `code`. A failed or dirty
    /// rollback replaces the stop with a blocked outcome.
    fn stop_after_rollback(&mut self, code: ReportCode, reason: String) -> Result<Ending> {
        let base = self.base_commit()?;
        // Recomputed: verification commands may have left files behind.
        let touched = get_touched_files(&self.git, &base)?;
        if touched.is_empty() {
            return Ok(Ending::new(code, reason));
        }
        info!(%code, paths = touched.all.len(), "rolling back");
        if self.report.touched.is_none() {
            self.report.touched = Some(touched.clone());
        }
        match perform_rollback_with_clean_check(&self.git, &base, &touched.untracked) {
            None => Ok(Ending::new(code, reason)),
            Some(block) => {
                self.report.worktree_clean_guaranteed = false;
                self.report.errors.push(format!("{code}: {reason}"));
                Ok(Ending::new(block.code, block.reason))
            }
        }
    }

    /// Classify the result, persist the report and state, release the lock.
    fn finish(mut self, result: Result<Ending>, handle: LockHandle) -> Result<TickOutcome> {
        let (ending, fault) = match result {
            Ok(ending) => (ending, None),
            Err(err) if is_cancellation(&err) => {
                warn!("tick cancelled");
                (self.interrupted_rollback(), None)
            }
            Err(err) => {
                warn!(err = %format!("{err:#}"), "tick aborted");
                self.report.worktree_clean_guaranteed = false;
                (
                    Ending::new(ReportCode::BlockedInterrupted, format!("{err:#}")),
                    Some(err),
                )
            }
        };

        let state = &self.tick_state;
        self.report.set_outcome(ending.code, ending.reason);
        self.report.phase = state.phase();
        self.report.base_commit = state.base_commit().map(str::to_string);
        self.report.fingerprint = self.fingerprint.clone();
        self.report.errors.extend(state.errors().iter().cloned());
        self.report.usage = self.usage;
        self.report.finished_at = now_rfc3339();

        self.state.record(&TickRecord {
            tick: self.tick,
            run_id: state.run_id(),
            code: ending.code,
            fingerprint: self.fingerprint.as_deref(),
            usage: &self.usage,
        });
        if let Some(milestone) = state.task().and_then(|t| t.milestone_id.clone()) {
            self.state.milestone = Some(milestone);
        }
        self.report.budget = BudgetSnapshot {
            counters: self.state.budget,
            warnings: self.config.budget.warnings(&self.state.budget),
        };

        persist_report(
            &self.paths,
            &self.report,
            &self.config.report,
            self.deps.renderer,
        )?;
        write_workspace_state(&self.paths.state_path, &self.state)?;
        self.enter(Phase::End);
        handle.release()?;
        info!(code = %self.report.code, "tick finished");

        if let Some(err) = fault {
            return Err(err);
        }
        Ok(TickOutcome {
            report: self.report,
            usage: self.usage,
        })
    }

    /// Cancellation ends in a stop with a clean tree when rollback allows it.
    fn interrupted_rollback(&mut self) -> Ending {
        let reason = format!("cancelled during {}", self.tick_state.phase().as_str());
        if self.tick_state.base_commit().is_none() {
            return Ending::new(ReportCode::StopInterrupted, reason);
        }
        match self.stop_after_rollback(ReportCode::StopInterrupted, reason) {
            Ok(ending) => ending,
            Err(err) => {
                self.report.worktree_clean_guaranteed = false;
                Ending::new(ReportCode::BlockedInterrupted, format!("{err:#}"))
            }
        }
    }
}

fn commit_message(prefix: &str, task: &Task) -> String {
    let intent = task.intent.lines().next().unwrap_or("").trim();
    if intent.is_empty() {
        format!("{prefix} {}", task.task_id)
    } else {
        format!("{prefix} {}: {intent}", task.task_id)
    }
}

/// One line about the previous tick for the planner, if a report exists.
fn summarize_last_report(path: &Path) -> Option<String> {
    let value = load_report(path).ok().flatten()?;
    let code = value.get("code")?.as_str()?;
    let mut summary = format!("tick {} ended {code}", value.get("tick")?.as_u64()?);
    if let Some(task_id) = value.get("task_id").and_then(|v| v.as_str()) {
        summary.push_str(&format!(" on task {task_id}"));
    }
    if let Some(reason) = value.get("reason").and_then(|v| v.as_str()) {
        summary.push_str(&format!(": {reason}"));
    }
    Some(summary)
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

/// Unique per process and timestamped, so run directories never collide.
fn new_run_id() -> String {
    static SEQ: AtomicU64 = AtomicU64::new(0);
    let seq = SEQ.fetch_add(1, Ordering::Relaxed);
    format!(
        "run-{}-{}-{seq}",
        Utc::now().format("%Y%m%d_%H%M%S"),
        std::process::id()
    )
}
