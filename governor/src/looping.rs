//! Multi-tick looping helper for `governor loop`.

use std::path::Path;

use anyhow::Result;
use tracing::info;

use crate::core::codes::ReportCode;
use crate::core::types::Verdict;
use crate::io::config::GovernorConfig;
use crate::io::invoker::AgentInvoker;
use crate::io::paths::GovernorPaths;
use crate::io::signals::StopFlag;
use crate::io::verify::CheckRunner;
use crate::io::workspace_state::load_workspace_state;
use crate::tick::{TickDeps, TickOutcome, run_tick};

/// Limits for one `run_loop` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopConfig {
    /// Ticks to run before returning. `None` runs until another stop applies.
    pub max_ticks: Option<u32>,
    /// Consecutive dispatches of one task fingerprint treated as a loop.
    /// Zero disables the check.
    pub max_redispatch: u32,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_ticks: None,
            max_redispatch: 3,
        }
    }
}

/// Reason why `run_loop` stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopStop {
    /// The planner signalled that there is nothing left to do.
    Finished,
    /// A tick ended with a stop or blocked verdict.
    Halted { verdict: Verdict, code: ReportCode },
    /// SIGINT/SIGTERM arrived; no further tick was started.
    StopRequested,
    /// `max_ticks` ticks ran.
    TickCap { max_ticks: u32 },
    /// The planner kept handing out the same task.
    Redispatch { fingerprint: String, dispatches: u32 },
}

/// Summary of a loop invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    pub ticks_executed: u32,
    pub stop: LoopStop,
}

/// Run ticks until one does not succeed, the planner stops, a signal asks
/// for a stop, the tick cap is reached or a redispatch loop is detected.
///
/// A tick fault stops the loop with `Err`; its report is already on disk.
pub fn run_loop<I: AgentInvoker, R: CheckRunner, F: FnMut(&TickOutcome)>(
    root: &Path,
    config: &GovernorConfig,
    deps: &TickDeps<'_, I, R>,
    loop_config: &LoopConfig,
    stop_flag: &StopFlag,
    mut on_tick: F,
) -> Result<LoopOutcome> {
    let paths = GovernorPaths::new(root, &config.state_dir);
    let mut ticks_executed = 0u32;

    loop {
        if stop_flag.is_requested() {
            return finish(ticks_executed, LoopStop::StopRequested);
        }
        if let Some(max_ticks) = loop_config.max_ticks
            && ticks_executed >= max_ticks
        {
            return finish(ticks_executed, LoopStop::TickCap { max_ticks });
        }

        let outcome = run_tick(root, config, deps)?;
        ticks_executed += 1;
        on_tick(&outcome);

        let report = &outcome.report;
        if report.verdict != Verdict::Success {
            return finish(
                ticks_executed,
                LoopStop::Halted {
                    verdict: report.verdict,
                    code: report.code,
                },
            );
        }
        if report.code == ReportCode::SuccessOrchestratorStop {
            return finish(ticks_executed, LoopStop::Finished);
        }
        if loop_config.max_redispatch > 0
            && let Some(fingerprint) = &report.fingerprint
        {
            let state = load_workspace_state(&paths.state_path)?;
            let dispatches = state.repeat_count + 1;
            if dispatches >= loop_config.max_redispatch {
                return finish(
                    ticks_executed,
                    LoopStop::Redispatch {
                        fingerprint: fingerprint.clone(),
                        dispatches,
                    },
                );
            }
        }
    }
}

fn finish(ticks_executed: u32, stop: LoopStop) -> Result<LoopOutcome> {
    info!(ticks_executed, ?stop, "loop finished");
    Ok(LoopOutcome {
        ticks_executed,
        stop,
    })
}
