//! Canonical locations of governor artifacts for a repository root.

use std::path::{Path, PathBuf};

pub const DEFAULT_STATE_DIR: &str = ".governor";
pub const CONFIG_FILE: &str = "governor.toml";

/// All artifact paths under the state directory.
#[derive(Debug, Clone)]
pub struct GovernorPaths {
    pub root: PathBuf,
    pub state_dir: PathBuf,
    pub gitignore_path: PathBuf,
    pub lock_path: PathBuf,
    pub report_path: PathBuf,
    pub report_md_path: PathBuf,
    pub blocked_path: PathBuf,
    pub state_path: PathBuf,
    pub questions_path: PathBuf,
    /// Operator-written goal handed to the planner.
    pub goal_path: PathBuf,
    pub task_path: PathBuf,
    /// Default result file for an external builder driver.
    pub driver_output_path: PathBuf,
    pub schemas_dir: PathBuf,
    pub runs_dir: PathBuf,
}

impl GovernorPaths {
    /// `state_dir` is relative to `root`.
    pub fn new(root: impl Into<PathBuf>, state_dir: &str) -> Self {
        let root = root.into();
        let state = root.join(state_dir);
        Self {
            root,
            gitignore_path: state.join(".gitignore"),
            lock_path: state.join("lock.json"),
            report_path: state.join("REPORT.json"),
            report_md_path: state.join("REPORT.md"),
            blocked_path: state.join("BLOCKED.json"),
            state_path: state.join("STATE.json"),
            questions_path: state.join("QUESTIONS.md"),
            goal_path: state.join("GOAL.md"),
            task_path: state.join("TASK.json"),
            driver_output_path: state.join("BUILDER_RESULT.json"),
            schemas_dir: state.join("schemas"),
            runs_dir: state.join("runs"),
            state_dir: state,
        }
    }

    /// Per-run directory for agent and verification logs.
    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.runs_dir.join(run_id)
    }

    pub fn default_config_path(root: &Path) -> PathBuf {
        root.join(CONFIG_FILE)
    }
}
