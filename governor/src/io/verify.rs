//! Verification runner: configured check templates, run without a shell.

use std::fs;
use std::path::Path;
use std::process::Command;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::core::cancel::{CancelToken, Cancelled};
use crate::core::codes::ReportCode;
use crate::core::params::{interpolate_argv, placeholders};
use crate::core::types::VerificationPlan;
use crate::io::config::VerificationConfig;
use crate::io::process::{RunLimits, run_command};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyTier {
    Fast,
    Slow,
}

impl VerifyTier {
    fn failure_code(self) -> ReportCode {
        match self {
            VerifyTier::Fast => ReportCode::StopVerifyFailedFast,
            VerifyTier::Slow => ReportCode::StopVerifyFailedSlow,
        }
    }
}

/// A template with parameters substituted, ready to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCheck {
    pub id: String,
    pub tier: VerifyTier,
    pub argv: Vec<String>,
    pub timeout: Duration,
    pub reruns_on_failure: u32,
}

/// Why a verification plan cannot run at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyRejection {
    pub code: ReportCode,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyStatus {
    Passed,
    Failed,
    TimedOut,
    /// Failed, then passed on a rerun.
    Flaky,
}

/// Log entry for one executed check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationRun {
    pub template_id: String,
    pub tier: VerifyTier,
    pub argv: Vec<String>,
    pub status: VerifyStatus,
    pub exit_code: Option<i32>,
    pub attempts: u32,
    pub duration_ms: u64,
    pub output_tail: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationOutcome {
    pub runs: Vec<VerificationRun>,
    /// Set when a check did not pass; later checks were skipped.
    pub failure: Option<ReportCode>,
}

/// Result of executing one argv once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckExecution {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub cancelled: bool,
    pub output: String,
}

/// Executes a single check. Tests use scripted runners.
pub trait CheckRunner {
    fn run(&self, argv: &[String], workdir: &Path, timeout: Duration, cancel: &CancelToken)
    -> Result<CheckExecution>;
}

/// Spawns the argv directly, no shell.
pub struct ProcessCheckRunner {
    pub kill_grace: Duration,
    pub output_limit_bytes: usize,
}

impl ProcessCheckRunner {
    pub fn from_config(config: &VerificationConfig) -> Self {
        Self {
            kill_grace: Duration::from_secs(config.kill_grace_secs),
            output_limit_bytes: config.output_limit_bytes,
        }
    }
}

impl CheckRunner for ProcessCheckRunner {
    fn run(
        &self,
        argv: &[String],
        workdir: &Path,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<CheckExecution> {
        let Some((program, args)) = argv.split_first() else {
            anyhow::bail!("empty verification argv");
        };
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(workdir);
        let output = match run_command(
            cmd,
            None,
            &RunLimits {
                timeout,
                kill_grace: self.kill_grace,
                output_limit_bytes: self.output_limit_bytes,
                cancel: Some(cancel),
            },
        ) {
            Ok(output) => output,
            // A missing program is a failing check, not a governor fault.
            Err(err) => {
                return Ok(CheckExecution {
                    success: false,
                    exit_code: None,
                    timed_out: false,
                    cancelled: false,
                    output: format!("failed to start {program}: {err:#}"),
                });
            }
        };
        let mut text = String::new();
        text.push_str(&output.stdout_truncated_notice("check"));
        text.push_str(&output.stdout_lossy());
        text.push_str(&output.stderr_truncated_notice("check"));
        text.push_str(&output.stderr_lossy());
        Ok(CheckExecution {
            success: output.status.success() && !output.timed_out && !output.cancelled,
            exit_code: output.status.code(),
            timed_out: output.timed_out,
            cancelled: output.cancelled,
            output: text,
        })
    }
}

/// Resolve the plan against configured templates.
///
/// Every provided parameter is validated against the injection rules, and
/// every placeholder must resolve. Fast checks come before slow ones.
pub fn resolve_checks(
    plan: &VerificationPlan,
    config: &VerificationConfig,
) -> Result<Vec<ResolvedCheck>, VerifyRejection> {
    let validator = config.params.compile().map_err(|err| VerifyRejection {
        code: ReportCode::StopVerifyConfigInvalid,
        reason: format!("{err:#}"),
    })?;
    validator
        .validate_all(&plan.params)
        .map_err(|err| VerifyRejection {
            code: err.stop_code(),
            reason: err.to_string(),
        })?;

    let tiers = plan
        .fast
        .iter()
        .map(|id| (id, VerifyTier::Fast))
        .chain(plan.slow.iter().map(|id| (id, VerifyTier::Slow)));
    let mut checks = Vec::new();
    for (id, tier) in tiers {
        let template = config.templates.get(id).ok_or_else(|| VerifyRejection {
            code: ReportCode::StopVerifyConfigInvalid,
            reason: format!("unknown verification template `{id}`"),
        })?;
        let argv = interpolate_argv(&template.argv, &plan.params).map_err(|err| VerifyRejection {
            code: err.stop_code(),
            reason: format!("template `{id}`: {err}"),
        })?;
        debug!(id = %id, params = ?placeholders(&template.argv), "resolved check");
        checks.push(ResolvedCheck {
            id: id.clone(),
            tier,
            argv,
            timeout: Duration::from_secs(
                template
                    .timeout_secs
                    .unwrap_or(config.default_timeout_secs),
            ),
            reruns_on_failure: template.reruns_on_failure,
        });
    }
    Ok(checks)
}

/// Where run logs go and how runs are executed.
pub struct VerifyContext<'a, R: CheckRunner> {
    pub runner: &'a R,
    pub workdir: &'a Path,
    /// Directory for per-check logs, if any.
    pub log_dir: Option<&'a Path>,
    pub cancel: &'a CancelToken,
}

/// Run checks in order, stopping at the first one that does not pass.
///
/// Returns `Err` carrying [`Cancelled`] if cancellation interrupts a check.
#[instrument(skip_all, fields(checks = checks.len()))]
pub fn run_verifications<R: CheckRunner>(
    checks: &[ResolvedCheck],
    ctx: &VerifyContext<'_, R>,
) -> Result<VerificationOutcome> {
    let mut runs = Vec::new();
    for (index, check) in checks.iter().enumerate() {
        ctx.cancel.check()?;
        let run = run_one(check, ctx)?;
        if let Some(dir) = ctx.log_dir {
            write_check_log(&dir.join(format!("verify-{index:02}-{}.log", check.id)), &run)?;
        }
        let failure = match run.status {
            VerifyStatus::Passed => None,
            VerifyStatus::Failed => Some(check.tier.failure_code()),
            VerifyStatus::TimedOut | VerifyStatus::Flaky => {
                Some(ReportCode::StopVerifyFlakyOrTimeout)
            }
        };
        runs.push(run);
        if let Some(code) = failure {
            warn!(id = %check.id, code = %code, "verification failed");
            return Ok(VerificationOutcome {
                runs,
                failure: Some(code),
            });
        }
        info!(id = %check.id, "verification passed");
    }
    Ok(VerificationOutcome {
        runs,
        failure: None,
    })
}

fn run_one<R: CheckRunner>(check: &ResolvedCheck, ctx: &VerifyContext<'_, R>) -> Result<VerificationRun> {
    let started = Instant::now();
    let mut attempts = 0;
    let mut failed_once = false;
    loop {
        attempts += 1;
        let exec = ctx
            .runner
            .run(&check.argv, ctx.workdir, check.timeout, ctx.cancel)
            .with_context(|| format!("run verification `{}`", check.id))?;
        if exec.cancelled {
            return Err(Cancelled.into());
        }
        let status = if exec.timed_out {
            Some(VerifyStatus::TimedOut)
        } else if exec.success {
            Some(if failed_once {
                VerifyStatus::Flaky
            } else {
                VerifyStatus::Passed
            })
        } else if attempts > check.reruns_on_failure {
            Some(VerifyStatus::Failed)
        } else {
            failed_once = true;
            debug!(id = %check.id, attempts, "check failed, rerunning");
            None
        };
        if let Some(status) = status {
            return Ok(VerificationRun {
                template_id: check.id.clone(),
                tier: check.tier,
                argv: check.argv.clone(),
                status,
                exit_code: exec.exit_code,
                attempts,
                duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                output_tail: exec.output,
            });
        }
    }
}

fn write_check_log(path: &Path, run: &VerificationRun) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create verify log dir {}", parent.display()))?;
    }
    let mut buf = format!(
        "$ {}\nstatus: {:?} exit: {:?} attempts: {}\n\n",
        run.argv.join(" "),
        run.status,
        run.exit_code,
        run.attempts
    );
    buf.push_str(&run.output_tail);
    fs::write(path, buf).with_context(|| format!("write verify log {}", path.display()))
}
