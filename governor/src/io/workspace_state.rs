//! Cross-tick bookkeeping (`STATE.json`).

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::core::budget::{BudgetCounters, TickUsage};
use crate::core::codes::ReportCode;
use crate::core::types::{StopHistoryEntry, Verdict};
use crate::io::atomic::{remove_if_exists, write_json_atomic};
use crate::io::lock::{HostProbe, SystemHost, holder_is_live, read_lock};
use crate::io::paths::GovernorPaths;
use crate::io::report::{BlockedData, load_blocked};

/// Entries older than this are dropped from `stop_history`.
pub const STOP_HISTORY_LIMIT: usize = 100;

/// Persisted state carried from one tick to the next.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceState {
    /// Number of the last tick that wrote this file.
    pub tick: u64,
    pub last_run_id: Option<String>,
    pub last_verdict: Option<Verdict>,
    pub last_code: Option<ReportCode>,
    /// Consecutive ticks whose code counts as a failure.
    pub failure_streak: u32,
    pub stop_history: Vec<StopHistoryEntry>,
    /// Free-form milestone label the planner may advance.
    pub milestone: Option<String>,
    /// Fingerprint of the last planned task.
    pub last_fingerprint: Option<String>,
    /// How many consecutive ticks planned the same fingerprint.
    pub repeat_count: u32,
    pub budget: BudgetCounters,
}

/// What a finished tick contributes to the state.
#[derive(Debug, Clone, Copy)]
pub struct TickRecord<'a> {
    pub tick: u64,
    pub run_id: &'a str,
    pub code: ReportCode,
    pub fingerprint: Option<&'a str>,
    pub usage: &'a TickUsage,
}

impl WorkspaceState {
    pub fn next_tick(&self) -> u64 {
        self.tick + 1
    }

    /// Fold a finished tick into the state.
    pub fn record(&mut self, record: &TickRecord<'_>) {
        let verdict = record.code.verdict();
        self.tick = record.tick;
        self.last_run_id = Some(record.run_id.to_string());
        self.last_verdict = Some(verdict);
        self.last_code = Some(record.code);
        if record.code.counts_as_failure() {
            self.failure_streak += 1;
        } else if verdict == Verdict::Success {
            self.failure_streak = 0;
        }
        if verdict != Verdict::Success {
            self.stop_history.push(StopHistoryEntry {
                tick: record.tick,
                verdict,
            });
            let excess = self.stop_history.len().saturating_sub(STOP_HISTORY_LIMIT);
            self.stop_history.drain(..excess);
        }
        match record.fingerprint {
            Some(fp) if self.last_fingerprint.as_deref() == Some(fp) => self.repeat_count += 1,
            Some(fp) => {
                self.last_fingerprint = Some(fp.to_string());
                self.repeat_count = 0;
            }
            None => {}
        }
        self.budget.absorb(record.usage);
    }

    /// Operator acknowledgement after a human escalation.
    pub fn acknowledge(&mut self) {
        self.failure_streak = 0;
        self.stop_history.clear();
        self.repeat_count = 0;
    }
}

/// Load state, treating a missing file as a fresh workspace.
pub fn load_workspace_state(path: &Path) -> Result<WorkspaceState> {
    if !path.exists() {
        debug!(path = %path.display(), "no workspace state yet");
        return Ok(WorkspaceState::default());
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read state {}", path.display()))?;
    let state: WorkspaceState = serde_json::from_str(&contents)
        .with_context(|| format!("parse state {}", path.display()))?;
    debug!(tick = state.tick, failure_streak = state.failure_streak, "workspace state loaded");
    Ok(state)
}

pub fn write_workspace_state(path: &Path, state: &WorkspaceState) -> Result<()> {
    debug!(path = %path.display(), tick = state.tick, "writing workspace state");
    write_json_atomic(path, state)
}

/// Clear a blocked outcome once an operator has dealt with it.
///
/// Resets the escalation inputs in STATE.json and removes BLOCKED.json.
/// Returns the cleared block, or `None` when nothing was blocked. A stale
/// lock from a crashed tick does not prevent this; the next tick reclaims it.
pub fn acknowledge_blocked(paths: &GovernorPaths) -> Result<Option<BlockedData>> {
    acknowledge_blocked_with(paths, &SystemHost)
}

pub fn acknowledge_blocked_with<H: HostProbe>(
    paths: &GovernorPaths,
    host: &H,
) -> Result<Option<BlockedData>> {
    if let Some(holder) = read_lock(&paths.lock_path)?
        && holder_is_live(&holder, host)
    {
        return Err(anyhow!(
            "a tick is running (pid {}); acknowledge after it finishes",
            holder.pid
        ));
    }
    let Some(blocked) = load_blocked(&paths.blocked_path)? else {
        return Ok(None);
    };
    let mut state = load_workspace_state(&paths.state_path)?;
    state.acknowledge();
    write_workspace_state(&paths.state_path, &state)?;
    remove_if_exists(&paths.blocked_path)?;
    info!(code = %blocked.code, run_id = %blocked.run_id, "block acknowledged");
    Ok(Some(blocked))
}
