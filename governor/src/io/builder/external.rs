//! External-driver mode: hand the task to an out-of-process driver.
//!
//! Contract with the driver, all through environment variables:
//!
//! | variable | value |
//! |---|---|
//! | `GOVERNOR_DRIVER_PROTOCOL` | protocol version (`1`) |
//! | `GOVERNOR_DRIVER_KIND` | `driver_kind` from the task |
//! | `GOVERNOR_REPO_ROOT` | absolute repository root |
//! | `GOVERNOR_TASK_PATH` | absolute path of TASK.json |
//! | `GOVERNOR_OUTPUT_PATH` | absolute path the driver must write its result to |
//! | `GOVERNOR_RESULT_SCHEMA_PATH` | absolute path of the result schema |
//!
//! The driver writes exactly one JSON object to the output path and exits.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use super::{BuildContext, parse_builder_output};
use crate::core::builder_outcome::{BuilderInvocationResult, FailurePolicy};
use crate::core::cancel::{CancelToken, Cancelled};
use crate::core::codes::ReportCode;
use crate::core::path::validate_relative_path;
use crate::core::types::{ExternalDriverBuild, Task};
use crate::io::atomic::{remove_if_exists, write_json_atomic};
use crate::io::config::ExternalDriverConfig;
use crate::io::invoker::AgentInvoker;
use crate::io::paths::GovernorPaths;
use crate::io::process::{RunLimits, run_command};
use crate::io::schema::{SchemaKind, write_schema};

const MODE: &str = "external_driver";
pub const DRIVER_PROTOCOL_VERSION: &str = "1";

pub(super) fn run<I: AgentInvoker>(
    ctx: &BuildContext<'_, I>,
    task: &Task,
    build: &ExternalDriverBuild,
    policy: FailurePolicy,
) -> Result<BuilderInvocationResult> {
    run_driver(
        ctx.paths,
        &ctx.config.builder.external,
        task,
        build,
        policy,
        ctx.cancel,
    )
}

/// Preflight, spawn and collect an external driver.
#[instrument(skip_all, fields(driver_kind = %build.driver_kind))]
pub fn run_driver(
    paths: &GovernorPaths,
    config: &ExternalDriverConfig,
    task: &Task,
    build: &ExternalDriverBuild,
    policy: FailurePolicy,
    cancel: &CancelToken,
) -> Result<BuilderInvocationResult> {
    let output_path = match &config.output_path {
        Some(rel) => {
            if let Err(reason) = validate_relative_path(rel) {
                return Ok(unavailable(format!("output path {rel:?}: {reason}")));
            }
            paths.root.join(rel)
        }
        None => paths.driver_output_path.clone(),
    };
    let Some((program, args)) = config.command.split_first() else {
        return Ok(unavailable("no external driver command configured"));
    };
    let Some(resolved) = resolve_command(program) else {
        return Ok(unavailable(format!("driver command {program:?} not found on PATH")));
    };

    write_json_atomic(&paths.task_path, task)?;
    let schema_path = write_schema(&paths.schemas_dir, SchemaKind::BuilderResult)?;
    remove_if_exists(&output_path)?;
    if let Some(parent) = output_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create driver output dir {}", parent.display()))?;
    }

    let mut cmd = Command::new(&resolved);
    cmd.args(args)
        .current_dir(&paths.root)
        .env("GOVERNOR_DRIVER_PROTOCOL", DRIVER_PROTOCOL_VERSION)
        .env("GOVERNOR_DRIVER_KIND", &build.driver_kind)
        .env("GOVERNOR_REPO_ROOT", &paths.root)
        .env("GOVERNOR_TASK_PATH", &paths.task_path)
        .env("GOVERNOR_OUTPUT_PATH", &output_path)
        .env("GOVERNOR_RESULT_SCHEMA_PATH", &schema_path);
    info!(program = %resolved.display(), "starting external driver");

    let output = match run_command(
        cmd,
        None,
        &RunLimits {
            timeout: Duration::from_secs(config.timeout_secs),
            kill_grace: Duration::from_secs(config.kill_grace_secs),
            output_limit_bytes: config.output_limit_bytes,
            cancel: Some(cancel),
        },
    ) {
        Ok(output) => output,
        Err(err) => return Ok(unavailable(format!("spawn driver: {err:#}"))),
    };
    if output.cancelled {
        return Err(Cancelled.into());
    }
    if output.timed_out {
        warn!(timeout_secs = config.timeout_secs, "external driver timed out");
        return Ok(BuilderInvocationResult::failed(
            MODE,
            Some(ReportCode::StopBuilderTimeout),
            format!("driver timed out after {}s", config.timeout_secs),
        ));
    }
    if !output.status.success() {
        return Ok(BuilderInvocationResult::failed(
            MODE,
            Some(ReportCode::StopBuilderFailed),
            format!(
                "driver exited with status {:?}: {}",
                output.status.code(),
                output.stderr_lossy().trim()
            ),
        ));
    }

    if !output_path.exists() {
        return Ok(BuilderInvocationResult::failed(
            MODE,
            Some(ReportCode::StopBuilderDriverOutputMissing),
            format!("driver wrote nothing to {}", output_path.display()),
        ));
    }
    let text = fs::read_to_string(&output_path)
        .with_context(|| format!("read driver output {}", output_path.display()))?;
    parse_builder_output(MODE, &text, policy)
}

fn unavailable(reason: impl Into<String>) -> BuilderInvocationResult {
    BuilderInvocationResult::failed(
        MODE,
        Some(ReportCode::StopBuilderDriverUnavailable),
        reason,
    )
}

/// Resolve a command without a shell: paths are checked directly, bare names
/// are searched on `PATH`.
pub fn resolve_command(cmd: &str) -> Option<PathBuf> {
    let trimmed = cmd.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.contains('/') || trimmed.contains(std::path::MAIN_SEPARATOR) {
        let path = PathBuf::from(trimmed);
        return is_executable(&path).then_some(path);
    }
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(|dir| dir.join(trimmed))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|m| m.is_file() && (m.permissions().mode() & 0o111 != 0))
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    fs::metadata(path).map(|m| m.is_file()).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::builder_outcome::resolve_builder_failure_code;
    use crate::core::types::TaskKind;
    use crate::io::paths::DEFAULT_STATE_DIR;

    fn task() -> Task {
        serde_json::from_value(serde_json::json!({
            "task_id": "t1",
            "task_kind": "execute",
            "builder": {"mode": "external_driver", "driver_kind": "scripted"}
        }))
        .expect("task")
    }

    fn build() -> ExternalDriverBuild {
        ExternalDriverBuild {
            driver_kind: "scripted".to_string(),
            notes: None,
        }
    }

    fn driver(script: &str, timeout_secs: u64) -> ExternalDriverConfig {
        ExternalDriverConfig {
            command: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            timeout_secs,
            kill_grace_secs: 1,
            ..ExternalDriverConfig::default()
        }
    }

    fn run(paths: &GovernorPaths, config: &ExternalDriverConfig) -> BuilderInvocationResult {
        assert_eq!(task().task_kind, TaskKind::Execute);
        run_driver(
            paths,
            config,
            &task(),
            &build(),
            FailurePolicy::FailClosed,
            &CancelToken::new(),
        )
        .expect("run")
    }

    #[cfg(unix)]
    #[test]
    fn driver_receives_env_contract_and_result_is_read() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = GovernorPaths::new(temp.path(), DEFAULT_STATE_DIR);
        let script = r#"test "$GOVERNOR_DRIVER_PROTOCOL" = 1 || exit 9
test "$GOVERNOR_DRIVER_KIND" = scripted || exit 8
test -f "$GOVERNOR_TASK_PATH" || exit 7
test -f "$GOVERNOR_RESULT_SCHEMA_PATH" || exit 6
printf '{"status":"done","summary":"driven"}' > "$GOVERNOR_OUTPUT_PATH""#;
        let result = run(&paths, &driver(script, 10));
        assert!(result.success, "{result:?}");
        assert_eq!(
            result.result.map(|r| r.summary),
            Some("driven".to_string())
        );
    }

    #[cfg(unix)]
    #[test]
    fn default_output_follows_the_state_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = GovernorPaths::new(temp.path(), "ops/state");
        let script = r#"test "$GOVERNOR_OUTPUT_PATH" = "$GOVERNOR_REPO_ROOT/ops/state/BUILDER_RESULT.json" || exit 5
printf '{"status":"done","summary":"driven"}' > "$GOVERNOR_OUTPUT_PATH""#;
        let result = run(&paths, &driver(script, 10));
        assert!(result.success, "{result:?}");
    }

    #[cfg(unix)]
    #[test]
    fn missing_output_has_its_own_code() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = GovernorPaths::new(temp.path(), DEFAULT_STATE_DIR);
        let result = run(&paths, &driver("exit 0", 10));
        assert_eq!(
            resolve_builder_failure_code(&result),
            ReportCode::StopBuilderDriverOutputMissing
        );
    }

    #[cfg(unix)]
    #[test]
    fn timeout_is_distinguished() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = GovernorPaths::new(temp.path(), DEFAULT_STATE_DIR);
        let result = run(&paths, &driver("exec sleep 30", 1));
        assert_eq!(
            resolve_builder_failure_code(&result),
            ReportCode::StopBuilderTimeout
        );
    }

    #[test]
    fn unresolvable_command_is_unavailable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = GovernorPaths::new(temp.path(), DEFAULT_STATE_DIR);
        let config = ExternalDriverConfig {
            command: vec!["definitely-not-a-driver-xyz".to_string()],
            ..ExternalDriverConfig::default()
        };
        let result = run(&paths, &config);
        assert_eq!(
            resolve_builder_failure_code(&result),
            ReportCode::StopBuilderDriverUnavailable
        );
        assert_eq!(
            resolve_builder_failure_code(&run(&paths, &ExternalDriverConfig::default())),
            ReportCode::StopBuilderDriverUnavailable
        );
    }

    #[test]
    fn unsafe_output_path_is_refused() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = GovernorPaths::new(temp.path(), DEFAULT_STATE_DIR);
        let config = ExternalDriverConfig {
            output_path: Some("../outside.json".to_string()),
            ..driver("exit 0", 10)
        };
        let result = run(&paths, &config);
        assert_eq!(result.stop_code, Some(ReportCode::StopBuilderDriverUnavailable));
    }
}
