//! CLI tests: spawn the governor binary and check exit codes and artifacts.

use std::fs;
use std::process::Command;

use governor::exit_codes;
use governor::io::report::load_blocked;
use governor::test_support::TestRepo;

fn governor(repo: &TestRepo, args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_governor"))
        .arg("--root")
        .arg(repo.path())
        .args(args)
        .output()
        .expect("spawn governor")
}

/// Verifies an uncommitted config blocks the tick before any agent runs,
/// and that `ack` clears the block.
#[test]
fn uncommitted_init_blocks_tick_until_acknowledged() {
    let repo = TestRepo::new().expect("repo");
    let paths = repo.paths();

    let init = governor(&repo, &["init"]);
    assert_eq!(init.status.code(), Some(exit_codes::OK));
    assert!(repo.path().join("governor.toml").is_file());

    let tick = governor(&repo, &["tick"]);
    assert_eq!(tick.status.code(), Some(exit_codes::BLOCKED));
    assert!(String::from_utf8_lossy(&tick.stdout).contains("BLOCKED_DIRTY_WORKTREE"));
    let blocked = load_blocked(&paths.blocked_path)
        .expect("load")
        .expect("blocked written");
    assert_eq!(blocked.code.as_str(), "BLOCKED_DIRTY_WORKTREE");
    assert!(!paths.lock_path.exists());

    let ack = governor(&repo, &["ack"]);
    assert_eq!(ack.status.code(), Some(exit_codes::OK));
    assert!(!paths.blocked_path.exists());
}

#[test]
fn init_twice_without_force_is_invalid() {
    let repo = TestRepo::new().expect("repo");
    assert_eq!(governor(&repo, &["init"]).status.code(), Some(exit_codes::OK));
    assert_eq!(
        governor(&repo, &["init"]).status.code(),
        Some(exit_codes::INVALID)
    );
    assert_eq!(
        governor(&repo, &["init", "--force"]).status.code(),
        Some(exit_codes::OK)
    );
}

#[test]
fn unlock_removes_a_leftover_lock() {
    let repo = TestRepo::new().expect("repo");
    let paths = repo.paths();
    fs::create_dir_all(&paths.state_dir).expect("state dir");
    fs::write(&paths.lock_path, "{}").expect("lock");

    let out = governor(&repo, &["unlock"]);
    assert_eq!(out.status.code(), Some(exit_codes::OK));
    assert!(!paths.lock_path.exists());
}

#[test]
fn fingerprint_ignores_task_id_and_key_order() {
    let repo = TestRepo::new().expect("repo");
    repo.write("a.json", r#"{"task_id": "a", "task_kind": "execute", "intent": " x "}"#)
        .expect("a");
    repo.write("b.json", r#"{"intent": "x", "task_kind": "execute", "task_id": "b"}"#)
        .expect("b");

    let path = |name: &str| repo.path().join(name).to_string_lossy().into_owned();
    let a = governor(&repo, &["fingerprint", &path("a.json")]);
    let b = governor(&repo, &["fingerprint", &path("b.json")]);
    assert_eq!(a.status.code(), Some(exit_codes::OK));
    let a = String::from_utf8_lossy(&a.stdout).trim().to_string();
    let b = String::from_utf8_lossy(&b.stdout).trim().to_string();
    assert_eq!(a.len(), 64);
    assert_eq!(a, b);
}

/// Verifies SIGINT during `tick` cancels the running agent, writes an
/// interrupted report and releases the lock instead of abandoning it.
#[cfg(unix)]
#[test]
fn sigint_during_tick_interrupts_and_releases_the_lock() {
    use std::process::Stdio;
    use std::thread;
    use std::time::{Duration, Instant};

    use governor::io::report::load_report;
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let repo = TestRepo::new().expect("repo");
    let paths = repo.paths();
    let config_dir = tempfile::tempdir().expect("config dir");
    let config_path = config_dir.path().join("governor.toml");
    fs::write(&config_path, "[agents.planner]\ncommand = [\"sleep\", \"30\"]\n").expect("config");

    let child = Command::new(env!("CARGO_BIN_EXE_governor"))
        .arg("--root")
        .arg(repo.path())
        .arg("--config")
        .arg(&config_path)
        .arg("tick")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn governor");

    let deadline = Instant::now() + Duration::from_secs(20);
    while !paths.lock_path.exists() {
        assert!(Instant::now() < deadline, "tick never took the lock");
        thread::sleep(Duration::from_millis(20));
    }
    thread::sleep(Duration::from_millis(300));
    let pid = Pid::from_raw(i32::try_from(child.id()).expect("pid"));
    kill(pid, Signal::SIGINT).expect("send SIGINT");

    let started = Instant::now();
    let output = child.wait_with_output().expect("wait");
    assert!(started.elapsed() < Duration::from_secs(20), "planner was not terminated");
    assert_eq!(output.status.code(), Some(exit_codes::STOP));
    assert!(String::from_utf8_lossy(&output.stdout).contains("STOP_INTERRUPTED"));
    let report = load_report(&paths.report_path)
        .expect("load")
        .expect("report written");
    assert_eq!(report["code"], "STOP_INTERRUPTED");
    assert!(!paths.lock_path.exists(), "lock must be released");
    repo.git().ensure_clean().expect("tree left clean");
}
