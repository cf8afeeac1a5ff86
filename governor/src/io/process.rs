//! Helpers for running child processes with timeouts and bounded output.

use std::io::{Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::core::cancel::CancelToken;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Captured child process output. Only the tail of each stream is kept.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Bytes dropped from the front of stdout.
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    pub cancelled: bool,
    /// The child ignored SIGTERM and was force-killed.
    pub force_killed: bool,
}

impl CommandOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).to_string()
    }

    pub fn stdout_truncated_notice(&self, label: &str) -> String {
        if self.stdout_truncated > 0 {
            format!(
                "[{label} stdout: first {} bytes dropped]\n",
                self.stdout_truncated
            )
        } else {
            String::new()
        }
    }

    pub fn stderr_truncated_notice(&self, label: &str) -> String {
        if self.stderr_truncated > 0 {
            format!(
                "[{label} stderr: first {} bytes dropped]\n",
                self.stderr_truncated
            )
        } else {
            String::new()
        }
    }
}

/// Limits applied to one child process.
#[derive(Debug, Clone)]
pub struct RunLimits<'a> {
    pub timeout: Duration,
    /// Time between SIGTERM and SIGKILL.
    pub kill_grace: Duration,
    /// Bytes of each stream kept in memory.
    pub output_limit_bytes: usize,
    pub cancel: Option<&'a CancelToken>,
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs and stdin is fed from its
/// own thread. On timeout or cancellation the child gets SIGTERM, then SIGKILL
/// once `kill_grace` elapses.
#[instrument(skip_all, fields(timeout_secs = limits.timeout.as_secs(), output_limit_bytes = limits.output_limit_bytes))]
pub fn run_command(
    mut cmd: Command,
    stdin: Option<Vec<u8>>,
    limits: &RunLimits<'_>,
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    // Own process group, so termination reaches grandchildren holding our pipes.
    #[cfg(unix)]
    std::os::unix::process::CommandExt::process_group(&mut cmd, 0);

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdin_handle = match stdin {
        Some(input) => {
            let mut child_stdin = child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("stdin was not piped"))?;
            // A child that exits early closes the pipe; that is not our error.
            Some(thread::spawn(move || {
                let _ = child_stdin.write_all(&input);
            }))
        }
        None => None,
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let limit = limits.output_limit_bytes;
    let stdout_handle = thread::spawn(move || read_stream_tail(stdout, limit));
    let stderr_handle = thread::spawn(move || read_stream_tail(stderr, limit));

    let deadline = Instant::now() + limits.timeout;
    let mut timed_out = false;
    let mut cancelled = false;
    let mut force_killed = false;
    let status = loop {
        let now = Instant::now();
        let wait = deadline.saturating_duration_since(now).min(POLL_INTERVAL);
        if let Some(status) = child.wait_timeout(wait).context("wait for command")? {
            break status;
        }
        if limits.cancel.is_some_and(CancelToken::is_cancelled) {
            warn!("cancellation requested, terminating command");
            cancelled = true;
        } else if Instant::now() >= deadline {
            warn!(
                timeout_secs = limits.timeout.as_secs(),
                "command timed out, terminating"
            );
            timed_out = true;
        } else {
            continue;
        }
        let (status, forced) = terminate(&mut child, limits.kill_grace)?;
        force_killed = forced;
        break status;
    };

    if let Some(handle) = stdin_handle
        && handle.join().is_err()
    {
        warn!("stdin writer thread panicked");
    }
    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, cancelled, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
        cancelled,
        force_killed,
    })
}

/// SIGTERM, wait up to `grace`, then SIGKILL. Returns whether SIGKILL was needed.
fn terminate(child: &mut Child, grace: Duration) -> Result<(ExitStatus, bool)> {
    signal_group(child, Termination::Graceful);
    if let Some(status) = child
        .wait_timeout(grace)
        .context("wait for command after SIGTERM")?
    {
        signal_group(child, Termination::Forced);
        return Ok((status, false));
    }
    warn!(grace_secs = grace.as_secs(), "command ignored SIGTERM, killing");
    signal_group(child, Termination::Forced);
    child.kill().context("kill command")?;
    let status = child.wait().context("wait command after kill")?;
    Ok((status, true))
}

#[derive(Debug, Clone, Copy)]
enum Termination {
    Graceful,
    Forced,
}

/// Signal the child's whole process group.
#[cfg(unix)]
fn signal_group(child: &Child, how: Termination) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Ok(pid) = i32::try_from(child.id()) else {
        return;
    };
    let signal = match how {
        Termination::Graceful => Signal::SIGTERM,
        Termination::Forced => Signal::SIGKILL,
    };
    if let Err(err) = killpg(Pid::from_raw(pid), signal) {
        debug!(err = %err, ?signal, "group signal delivery failed");
    }
}

#[cfg(not(unix))]
fn signal_group(_child: &Child, _how: Termination) {}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

/// Drain `reader`, keeping only the last `limit` bytes.
fn read_stream_tail<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut dropped = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        // Compact lazily so long streams are not shifted on every read.
        if buf.len() > limit.saturating_mul(2).max(limit + chunk.len()) {
            let excess = buf.len() - limit;
            buf.drain(..excess);
            dropped += excess;
        }
    }
    if buf.len() > limit {
        let excess = buf.len() - limit;
        buf.drain(..excess);
        dropped += excess;
    }

    Ok((buf, dropped))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(timeout: Duration) -> RunLimits<'static> {
        RunLimits {
            timeout,
            kill_grace: Duration::from_millis(200),
            output_limit_bytes: 1024,
            cancel: None,
        }
    }

    #[test]
    fn tail_reader_keeps_the_end() {
        let data: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
        let (kept, dropped) = read_stream_tail(&data[..], 100).expect("read");
        assert_eq!(kept.len(), 100);
        assert_eq!(dropped, 49_900);
        assert_eq!(kept[..], data[49_900..]);
    }

    #[test]
    fn captures_stdout_and_stdin() {
        let output = run_command(
            Command::new("cat"),
            Some(b"hello from stdin".to_vec()),
            &limits(Duration::from_secs(10)),
        )
        .expect("run");
        assert!(output.status.success());
        assert_eq!(output.stdout_lossy(), "hello from stdin");
        assert!(!output.timed_out);
    }

    #[cfg(unix)]
    #[test]
    fn timeout_terminates_the_child() {
        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        let started = Instant::now();
        let output = run_command(cmd, None, &limits(Duration::from_millis(300))).expect("run");
        assert!(output.timed_out);
        assert!(!output.status.success());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[test]
    fn cancellation_stops_the_child() {
        let token = CancelToken::new();
        token.cancel();
        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        let output = run_command(
            cmd,
            None,
            &RunLimits {
                cancel: Some(&token),
                ..limits(Duration::from_secs(30))
            },
        )
        .expect("run");
        assert!(output.cancelled);
        assert!(!output.timed_out);
    }
}
