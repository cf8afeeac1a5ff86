//! Scaffolding for the governor state directory.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};

use super::config::{GovernorConfig, write_config};
use super::paths::GovernorPaths;
use super::workspace_state::{WorkspaceState, write_workspace_state};

/// Ignores everything in the state dir, including itself, so governor
/// artifacts never show up as worktree changes.
pub const STATE_GITIGNORE: &str = "*\n";

/// Options for `init_governor`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// Overwrite an existing config, goal and state.
    pub force: bool,
}

/// Create the state dir and its `.gitignore`. Idempotent; runs every tick.
pub fn ensure_state_dir(paths: &GovernorPaths) -> Result<()> {
    if paths.state_dir.exists() && !paths.state_dir.is_dir() {
        return Err(anyhow!(
            "state dir {} exists but is not a directory",
            paths.state_dir.display()
        ));
    }
    create_dir(&paths.state_dir)?;
    let current = fs::read_to_string(&paths.gitignore_path).ok();
    if current.as_deref() != Some(STATE_GITIGNORE) {
        write_file(&paths.gitignore_path, STATE_GITIGNORE)?;
    }
    Ok(())
}

/// Write a default `governor.toml`, a goal placeholder and empty state.
///
/// Fails if the config already exists unless `options.force` is set.
pub fn init_governor(root: &Path, options: &InitOptions) -> Result<GovernorPaths> {
    let config_path = GovernorPaths::default_config_path(root);
    if config_path.exists() && !options.force {
        return Err(anyhow!(
            "governor init: {} already exists (use --force to overwrite)",
            config_path.display()
        ));
    }
    let config = GovernorConfig::default();
    let paths = GovernorPaths::new(root, &config.state_dir);
    ensure_state_dir(&paths)?;

    write_config(&config_path, &config)?;
    if options.force || !paths.goal_path.exists() {
        write_file(&paths.goal_path, GOAL_PLACEHOLDER)?;
    }
    if options.force || !paths.state_path.exists() {
        write_workspace_state(&paths.state_path, &WorkspaceState::default())?;
    }
    Ok(paths)
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create directory {}", path.display()))
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_dir(parent)?;
    }
    fs::write(path, contents).with_context(|| format!("write file {}", path.display()))
}

const GOAL_PLACEHOLDER: &str = "# Goal\n\nDescribe what the build loop should work towards.\n";
