//! End-to-end tick scenarios against a real git repository.
//!
//! Agents and verification commands are scripted; git, the lock, rollback and
//! report persistence are real.

use std::fs;

use governor::core::cancel::CancelToken;
use governor::core::codes::ReportCode;
use governor::core::types::{TaskScope, Verdict};
use governor::io::config::GovernorConfig;
use governor::io::invoker::AgentRole;
use governor::io::lock;
use governor::io::report::{MarkdownRenderer, ReportRenderer, load_blocked, load_report};
use governor::io::workspace_state::{WorkspaceState, load_workspace_state, write_workspace_state};
use governor::test_support::{
    FailingRenderer, Reply, ScriptedCall, ScriptedChecks, ScriptedInvoker, TestRepo,
    execute_task, patch_task, question_task, stop_task, test_config, verify_only_task,
};
use governor::tick::{TickDeps, TickOutcome, run_tick};

fn tick_with(
    repo: &TestRepo,
    config: &GovernorConfig,
    invoker: &ScriptedInvoker,
    checks: &ScriptedChecks,
    renderer: &dyn ReportRenderer,
) -> TickOutcome {
    let cancel = CancelToken::new();
    let deps = TickDeps {
        invoker,
        check_runner: checks,
        renderer,
        cancel: &cancel,
    };
    run_tick(repo.path(), config, &deps).expect("tick")
}

fn tick(repo: &TestRepo, invoker: &ScriptedInvoker) -> TickOutcome {
    tick_with(
        repo,
        &test_config(),
        invoker,
        &ScriptedChecks::passing(),
        &MarkdownRenderer,
    )
}

/// Common post-conditions: REPORT.json matches, lock released, BLOCKED.json
/// present iff blocked.
fn assert_persisted(repo: &TestRepo, outcome: &TickOutcome) {
    let paths = repo.paths();
    let stored = load_report(&paths.report_path)
        .expect("load report")
        .expect("report written");
    assert_eq!(stored["code"], outcome.report.code.as_str());
    assert!(!paths.lock_path.exists(), "lock must be released");
    assert_eq!(
        paths.blocked_path.exists(),
        outcome.report.verdict == Verdict::Blocked
    );
}

#[test]
fn question_without_side_effects_stops_and_records_question() {
    let repo = TestRepo::new().expect("repo");
    let invoker = ScriptedInvoker::new(vec![ScriptedCall::planner(&question_task(
        "q1",
        "Which database should we target?",
    ))]);

    let outcome = tick(&repo, &invoker);

    assert_eq!(outcome.report.code, ReportCode::StopOrchestratorAskQuestion);
    assert_eq!(outcome.report.verdict, Verdict::Stop);
    assert_persisted(&repo, &outcome);
    let questions = fs::read_to_string(repo.paths().questions_path).expect("questions");
    assert!(questions.contains("Which database should we target?"));
    assert_eq!(invoker.seen(), vec![AgentRole::Planner]);

    let state = load_workspace_state(&repo.paths().state_path).expect("state");
    assert_eq!(state.tick, 1);
    assert_eq!(state.failure_streak, 0);
}

#[test]
fn question_with_side_effects_is_rolled_back() {
    let repo = TestRepo::new().expect("repo");
    let invoker = ScriptedInvoker::new(vec![
        ScriptedCall::planner(&question_task("q1", "Proceed?"))
            .writing("notes.txt", "scratch\n")
            .writing("README.md", "changed\n"),
    ]);

    let outcome = tick(&repo, &invoker);

    assert_eq!(outcome.report.code, ReportCode::StopQuestionSideEffects);
    assert!(outcome.report.worktree_clean_guaranteed);
    assert_persisted(&repo, &outcome);
    assert!(!repo.path().join("notes.txt").exists());
    assert_eq!(repo.read("README.md").expect("readme"), "hi\n");
    repo.git().ensure_clean().expect("clean after rollback");
}

#[test]
fn accepted_change_is_committed() {
    let repo = TestRepo::new().expect("repo");
    let base = repo.head().expect("head");
    let invoker = ScriptedInvoker::new(vec![
        ScriptedCall::planner(&execute_task("t1")),
        ScriptedCall::builder_done("added lib").writing("src/lib.rs", "pub fn f() {}\n"),
    ]);
    let checks = ScriptedChecks::passing();

    let outcome = tick_with(&repo, &test_config(), &invoker, &checks, &MarkdownRenderer);

    assert_eq!(outcome.report.code, ReportCode::Success);
    assert_persisted(&repo, &outcome);
    let head = repo.head().expect("head");
    assert_ne!(head, base);
    assert_eq!(outcome.report.commit.as_deref(), Some(head.as_str()));
    assert_eq!(outcome.report.base_commit.as_deref(), Some(base.as_str()));
    assert_eq!(outcome.report.verification.len(), 1);
    assert_eq!(checks.seen(), vec![vec!["cargo".to_string(), "test".to_string()]]);
    assert_eq!(outcome.usage.agent_calls, 2);
    assert_eq!(outcome.usage.verify_runs, 1);
    assert!(repo.paths().report_md_path.exists());
    repo.git().ensure_clean().expect("clean after commit");

    let state = load_workspace_state(&repo.paths().state_path).expect("state");
    assert_eq!(state.last_code, Some(ReportCode::Success));
    assert_eq!(state.budget.agent_calls, 2);
    assert_eq!(state.last_fingerprint, outcome.report.fingerprint);
}

#[test]
fn change_outside_allowed_globs_is_rolled_back() {
    let repo = TestRepo::new().expect("repo");
    let base = repo.head().expect("head");
    let mut task = execute_task("t1");
    task.scope = TaskScope {
        allowed_globs: vec!["src/**".to_string()],
        allow_new_files: true,
        ..TaskScope::default()
    };
    let invoker = ScriptedInvoker::new(vec![
        ScriptedCall::planner(&task),
        ScriptedCall::builder_done("wrote docs").writing("docs/guide.md", "x\n"),
    ]);

    let outcome = tick(&repo, &invoker);

    assert_eq!(
        outcome.report.code,
        ReportCode::StopScopeViolationOutsideAllowed
    );
    assert_persisted(&repo, &outcome);
    assert!(!repo.path().join("docs/guide.md").exists());
    assert_eq!(repo.head().expect("head"), base);
}

#[test]
fn touching_governor_config_is_a_runner_owned_violation() {
    let repo = TestRepo::new().expect("repo");
    let invoker = ScriptedInvoker::new(vec![
        ScriptedCall::planner(&execute_task("t1")),
        ScriptedCall::builder_done("tweaked config").writing("governor.toml", "state_dir = \"x\"\n"),
    ]);

    let outcome = tick(&repo, &invoker);

    assert_eq!(outcome.report.code, ReportCode::StopScopeViolationRunnerOwned);
    assert!(!repo.path().join("governor.toml").exists());
}

#[test]
fn oversized_diff_is_rolled_back() {
    let repo = TestRepo::new().expect("repo");
    let mut config = test_config();
    config.diff_limits.max_files_touched = 1;
    let invoker = ScriptedInvoker::new(vec![
        ScriptedCall::planner(&execute_task("t1")),
        ScriptedCall::builder_done("two files")
            .writing("a.txt", "a\n")
            .writing("b.txt", "b\n"),
    ]);

    let outcome = tick_with(
        &repo,
        &config,
        &invoker,
        &ScriptedChecks::passing(),
        &MarkdownRenderer,
    );

    assert_eq!(outcome.report.code, ReportCode::StopDiffTooLarge);
    let blast = outcome.report.blast_radius.expect("blast radius");
    assert_eq!(blast.files_touched, 2);
    assert!(!repo.path().join("a.txt").exists());
    assert!(!repo.path().join("b.txt").exists());
}

#[test]
fn failed_verification_is_rolled_back() {
    let repo = TestRepo::new().expect("repo");
    let invoker = ScriptedInvoker::new(vec![
        ScriptedCall::planner(&execute_task("t1")),
        ScriptedCall::builder_done("edit").writing("README.md", "broken\n"),
    ]);
    // The check run leaves an artifact behind; rollback must remove it too.
    let checks = ScriptedChecks::new(vec![false]).writing("test-output.log", "boom\n");

    let outcome = tick_with(&repo, &test_config(), &invoker, &checks, &MarkdownRenderer);

    assert_eq!(outcome.report.code, ReportCode::StopVerifyFailedFast);
    assert!(outcome.report.worktree_clean_guaranteed);
    assert_eq!(repo.read("README.md").expect("readme"), "hi\n");
    assert!(!repo.path().join("test-output.log").exists());

    let state = load_workspace_state(&repo.paths().state_path).expect("state");
    assert_eq!(state.failure_streak, 1);
    assert_eq!(state.stop_history.len(), 1);
}

#[test]
fn verify_only_task_runs_checks_without_committing() {
    let repo = TestRepo::new().expect("repo");
    let base = repo.head().expect("head");
    let invoker = ScriptedInvoker::new(vec![ScriptedCall::planner(&verify_only_task("v1"))]);
    let checks = ScriptedChecks::passing();

    let outcome = tick_with(&repo, &test_config(), &invoker, &checks, &MarkdownRenderer);

    assert_eq!(outcome.report.code, ReportCode::Success);
    assert_eq!(outcome.report.commit, None);
    assert_eq!(checks.seen().len(), 1);
    assert_eq!(repo.head().expect("head"), base);
}

#[test]
fn verify_only_task_with_side_effects_is_rolled_back() {
    let repo = TestRepo::new().expect("repo");
    let invoker = ScriptedInvoker::new(vec![
        ScriptedCall::planner(&verify_only_task("v1")).writing("stray.txt", "x\n"),
    ]);
    let checks = ScriptedChecks::passing();

    let outcome = tick_with(&repo, &test_config(), &invoker, &checks, &MarkdownRenderer);

    assert_eq!(outcome.report.code, ReportCode::StopVerifyOnlySideEffects);
    assert!(checks.seen().is_empty());
    assert!(!repo.path().join("stray.txt").exists());
}

#[test]
fn planner_stop_signal_succeeds_without_building() {
    let repo = TestRepo::new().expect("repo");
    let invoker = ScriptedInvoker::new(vec![ScriptedCall::planner(&stop_task("goal reached"))]);

    let outcome = tick(&repo, &invoker);

    assert_eq!(outcome.report.code, ReportCode::SuccessOrchestratorStop);
    assert_eq!(outcome.report.verdict, Verdict::Success);
    assert_eq!(outcome.report.reason.as_deref(), Some("goal reached"));
    assert_eq!(invoker.seen(), vec![AgentRole::Planner]);
    assert_persisted(&repo, &outcome);
}

#[test]
fn held_lock_blocks_without_touching_state() {
    let repo = TestRepo::new().expect("repo");
    let paths = repo.paths();
    let holder = lock::acquire(&paths.lock_path, "2026-01-01T00:00:00Z").expect("hold lock");
    let invoker = ScriptedInvoker::new(Vec::new());

    let outcome = tick(&repo, &invoker);

    assert_eq!(outcome.report.code, ReportCode::BlockedLockHeld);
    assert!(paths.blocked_path.exists());
    assert!(!paths.state_path.exists());
    assert!(paths.lock_path.exists(), "the holder keeps its lock");
    assert!(invoker.seen().is_empty());
    holder.release().expect("release");
}

#[test]
fn corrupt_lock_blocks() {
    let repo = TestRepo::new().expect("repo");
    let paths = repo.paths();
    fs::create_dir_all(&paths.state_dir).expect("state dir");
    fs::write(&paths.lock_path, "not json").expect("corrupt lock");

    let outcome = tick(&repo, &ScriptedInvoker::new(Vec::new()));

    assert_eq!(outcome.report.code, ReportCode::BlockedLockCorrupt);
    let blocked = load_blocked(&paths.blocked_path)
        .expect("load")
        .expect("blocked written");
    assert_eq!(blocked.code, ReportCode::BlockedLockCorrupt);
    assert!(!blocked.remediation.is_empty());
}

#[test]
fn stale_lock_over_dirty_tree_requires_crash_recovery() {
    let repo = TestRepo::new().expect("repo");
    let paths = repo.paths();
    fs::create_dir_all(&paths.state_dir).expect("state dir");
    fs::write(
        &paths.lock_path,
        r#"{"pid": 4242, "started_at": "2026-01-01T00:00:00Z", "boot_id": "previous-boot"}"#,
    )
    .expect("stale lock");
    repo.write("half-written.rs", "fn\n").expect("residue");

    let outcome = tick(&repo, &ScriptedInvoker::new(Vec::new()));

    assert_eq!(outcome.report.code, ReportCode::BlockedCrashRecoveryRequired);
    assert!(!outcome.report.worktree_clean_guaranteed);
    assert_persisted(&repo, &outcome);
    assert!(repo.path().join("half-written.rs").exists(), "residue is left for the operator");
}

#[test]
fn failing_renderer_never_prevents_report_json() {
    // Success path.
    let repo = TestRepo::new().expect("repo");
    let invoker = ScriptedInvoker::new(vec![ScriptedCall::planner(&stop_task("done"))]);
    let outcome = tick_with(
        &repo,
        &test_config(),
        &invoker,
        &ScriptedChecks::passing(),
        &FailingRenderer,
    );
    assert_eq!(outcome.report.code, ReportCode::SuccessOrchestratorStop);
    assert_persisted(&repo, &outcome);
    assert!(!repo.paths().report_md_path.exists());

    // Blocked path.
    let repo = TestRepo::new().expect("repo");
    repo.write("stray.txt", "x\n").expect("dirty");
    let outcome = tick_with(
        &repo,
        &test_config(),
        &ScriptedInvoker::new(Vec::new()),
        &ScriptedChecks::passing(),
        &FailingRenderer,
    );
    assert_eq!(outcome.report.code, ReportCode::BlockedDirtyWorktree);
    assert_persisted(&repo, &outcome);
}

#[test]
fn failure_streak_escalates_to_human_before_building() {
    let repo = TestRepo::new().expect("repo");
    let paths = repo.paths();
    fs::create_dir_all(&paths.state_dir).expect("state dir");
    write_workspace_state(
        &paths.state_path,
        &WorkspaceState {
            tick: 5,
            failure_streak: 2,
            ..WorkspaceState::default()
        },
    )
    .expect("state");
    let invoker = ScriptedInvoker::new(vec![ScriptedCall::planner(&execute_task("t1"))]);

    let outcome = tick(&repo, &invoker);

    assert_eq!(outcome.report.code, ReportCode::BlockedHumanEscalation);
    assert_eq!(outcome.report.tick, 6);
    assert_eq!(invoker.seen(), vec![AgentRole::Planner]);
    assert_persisted(&repo, &outcome);
}

fn reviewer_config() -> GovernorConfig {
    let mut config = test_config();
    config.escalation.reviewer_enabled = true;
    config.risk.high_risk_globs = vec!["secrets/**".to_string()];
    config
}

#[test]
fn reviewer_force_patch_stops_before_building() {
    let repo = TestRepo::new().expect("repo");
    let invoker = ScriptedInvoker::new(vec![
        ScriptedCall::planner(&execute_task("t1")),
        ScriptedCall::reviewer("force_patch", "touches secrets"),
    ]);

    let outcome = tick_with(
        &repo,
        &reviewer_config(),
        &invoker,
        &ScriptedChecks::passing(),
        &MarkdownRenderer,
    );

    assert_eq!(outcome.report.code, ReportCode::StopReviewerForcedPatch);
    assert_eq!(invoker.seen(), vec![AgentRole::Planner, AgentRole::Reviewer]);
    assert!(outcome.report.risk_flags.iter().any(|f| f.name() == "high_risk_path"));
}

#[test]
fn reviewer_proceed_lets_the_build_run() {
    let repo = TestRepo::new().expect("repo");
    let invoker = ScriptedInvoker::new(vec![
        ScriptedCall::planner(&execute_task("t1")),
        ScriptedCall::reviewer("proceed", "looks fine"),
        ScriptedCall::builder_done("done").writing("src/lib.rs", "pub fn g() {}\n"),
    ]);

    let outcome = tick_with(
        &repo,
        &reviewer_config(),
        &invoker,
        &ScriptedChecks::passing(),
        &MarkdownRenderer,
    );

    assert_eq!(outcome.report.code, ReportCode::Success);
    assert_eq!(
        invoker.seen(),
        vec![AgentRole::Planner, AgentRole::Reviewer, AgentRole::Builder]
    );
}

#[test]
fn malformed_planner_output_blocks_after_retries() {
    let repo = TestRepo::new().expect("repo");
    let mut config = test_config();
    config.planner.max_retries = 1;
    let invoker = ScriptedInvoker::new(vec![
        ScriptedCall::new(AgentRole::Planner, Reply::Text("no json here".to_string())),
        ScriptedCall::new(AgentRole::Planner, Reply::Text("{\"task_id\": \"\"}".to_string())),
    ]);

    let outcome = tick_with(
        &repo,
        &config,
        &invoker,
        &ScriptedChecks::passing(),
        &MarkdownRenderer,
    );

    assert_eq!(outcome.report.code, ReportCode::BlockedOrchestratorOutputInvalid);
    assert_eq!(outcome.usage.agent_calls, 2);
    assert_persisted(&repo, &outcome);
}

#[test]
fn transport_stall_blocks_with_request_id() {
    let repo = TestRepo::new().expect("repo");
    let invoker = ScriptedInvoker::new(vec![ScriptedCall::new(
        AgentRole::Planner,
        Reply::Fail("error: stream disconnected before completion; request_id: req_abc123".to_string()),
    )]);

    let outcome = tick(&repo, &invoker);

    assert_eq!(outcome.report.code, ReportCode::BlockedTransportStalled);
    let reason = outcome.report.reason.clone().expect("reason");
    assert!(reason.contains("req_abc123"), "{reason}");
    assert!(outcome.report.stall.as_ref().is_some_and(|s| s.stalled));
}

#[test]
fn unsafe_patch_path_is_rejected_before_applying() {
    let repo = TestRepo::new().expect("repo");
    let patch = "--- a/../outside.txt\n+++ b/../outside.txt\n@@ -0,0 +1 @@\n+x\n";
    let invoker = ScriptedInvoker::new(vec![ScriptedCall::planner(&patch_task("p1", patch))]);

    let outcome = tick(&repo, &invoker);

    assert_eq!(outcome.report.code, ReportCode::StopPatchInvalidPath);
    repo.git().ensure_clean().expect("nothing applied");
}

#[test]
fn patch_mode_applies_and_commits() {
    let repo = TestRepo::new().expect("repo");
    let patch = "diff --git a/README.md b/README.md\n--- a/README.md\n+++ b/README.md\n@@ -1 +1 @@\n-hi\n+hello\n";
    let invoker = ScriptedInvoker::new(vec![ScriptedCall::planner(&patch_task("p1", patch))]);

    let outcome = tick(&repo, &invoker);

    assert_eq!(outcome.report.code, ReportCode::Success);
    assert_eq!(repo.read("README.md").expect("readme"), "hello\n");
    assert!(outcome.report.commit.is_some());
}

#[test]
fn builder_failure_rolls_back_partial_edits() {
    let repo = TestRepo::new().expect("repo");
    let invoker = ScriptedInvoker::new(vec![
        ScriptedCall::planner(&execute_task("t1")),
        ScriptedCall::new(AgentRole::Builder, Reply::Fail("agent crashed".to_string()))
            .writing("half.rs", "fn\n"),
    ]);

    let outcome = tick(&repo, &invoker);

    assert_eq!(outcome.report.code, ReportCode::StopBuilderFailed);
    assert!(!repo.path().join("half.rs").exists());
    assert_persisted(&repo, &outcome);
}

#[test]
fn cancellation_writes_an_interrupted_report() {
    let repo = TestRepo::new().expect("repo");
    let invoker = ScriptedInvoker::new(vec![
        ScriptedCall::planner(&execute_task("t1")),
        ScriptedCall::new(AgentRole::Builder, Reply::Cancel).writing("partial.rs", "fn\n"),
    ]);

    let outcome = tick(&repo, &invoker);

    assert_eq!(outcome.report.code, ReportCode::StopInterrupted);
    assert!(!repo.path().join("partial.rs").exists());
    assert_persisted(&repo, &outcome);
    let state = load_workspace_state(&repo.paths().state_path).expect("state");
    assert_eq!(state.failure_streak, 0);
}

#[test]
fn unreadable_state_blocks_with_a_report() {
    let repo = TestRepo::new().expect("repo");
    let paths = repo.paths();
    fs::create_dir_all(&paths.state_dir).expect("state dir");
    fs::write(&paths.state_path, "{not json").expect("corrupt state");
    let invoker = ScriptedInvoker::new(vec![ScriptedCall::planner(&stop_task("unused"))]);

    let outcome = tick(&repo, &invoker);

    assert_eq!(outcome.report.code, ReportCode::BlockedStateCorrupt);
    assert_persisted(&repo, &outcome);
    assert!(invoker.seen().is_empty());
    assert_eq!(
        fs::read_to_string(&paths.state_path).expect("state"),
        "{not json",
        "the operator gets the file as it was"
    );
}

/// Verifies a task whose globs do not compile is rejected while planning,
/// before any builder can touch the tree.
#[test]
fn uncompilable_task_glob_is_malformed_planner_output() {
    let repo = TestRepo::new().expect("repo");
    let mut config = test_config();
    config.planner.max_retries = 0;
    let mut task = execute_task("t1");
    task.scope.allowed_globs = vec!["src/[".to_string()];
    let invoker = ScriptedInvoker::new(vec![
        ScriptedCall::planner(&task),
        ScriptedCall::builder_done("wrote lib").writing("src/lib.rs", "pub fn f() {}\n"),
    ]);

    let outcome = tick_with(
        &repo,
        &config,
        &invoker,
        &ScriptedChecks::passing(),
        &MarkdownRenderer,
    );

    assert_eq!(outcome.report.code, ReportCode::BlockedOrchestratorOutputInvalid);
    let reason = outcome.report.reason.clone().expect("reason");
    assert!(reason.contains("scope.allowed_globs"), "{reason}");
    assert_eq!(invoker.seen(), vec![AgentRole::Planner]);
    assert!(!repo.path().join("src/lib.rs").exists());
    repo.git().ensure_clean().expect("tree untouched");
    assert_persisted(&repo, &outcome);
}

/// Verifies residue that rollback cannot remove turns the stop into a block.
/// `git clean -f` never deletes a nested repository.
#[test]
fn rollback_residue_blocks_as_dirty() {
    let repo = TestRepo::new().expect("repo");
    let invoker = ScriptedInvoker::new(vec![
        ScriptedCall::planner(&question_task("q1", "Proceed?"))
            .running(&["git", "init", "-q", "nested"])
            .running(&[
                "git",
                "-C",
                "nested",
                "-c",
                "user.email=agent@example.com",
                "-c",
                "user.name=agent",
                "commit",
                "-q",
                "--allow-empty",
                "-m",
                "scratch",
            ])
            .writing("nested/scratch.txt", "x\n"),
    ]);

    let outcome = tick(&repo, &invoker);

    assert_eq!(outcome.report.code, ReportCode::BlockedRollbackDirty);
    assert_eq!(outcome.report.verdict, Verdict::Blocked);
    assert!(!outcome.report.worktree_clean_guaranteed);
    assert!(
        outcome
            .report
            .errors
            .iter()
            .any(|err| err.starts_with("STOP_QUESTION_SIDE_EFFECTS")),
        "{:?}",
        outcome.report.errors
    );
    assert_persisted(&repo, &outcome);
    let blocked = load_blocked(&repo.paths().blocked_path)
        .expect("load")
        .expect("blocked written");
    assert_eq!(blocked.code, ReportCode::BlockedRollbackDirty);
    assert!(repo.path().join("nested").is_dir(), "residue stays for the operator");
}
