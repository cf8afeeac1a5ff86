//! Tick governor for an autonomous build loop.
//!
//! Each tick asks a planning agent for one task, hands it to a builder, judges
//! the resulting diff against scope, size and verification policy, and either
//! commits the change or rolls it back. Outcomes land in `.governor/REPORT.json`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;

use governor::core::cancel::CancelToken;
use governor::core::fingerprint::fingerprint_value;
use governor::core::types::Verdict;
use governor::exit_codes;
use governor::io::config::{GovernorConfig, load_config};
use governor::io::init::{InitOptions, init_governor};
use governor::io::invoker::CommandInvoker;
use governor::io::lock::release_lock;
use governor::io::paths::GovernorPaths;
use governor::io::report::MarkdownRenderer;
use governor::io::signals::install_stop_handler;
use governor::io::verify::ProcessCheckRunner;
use governor::io::workspace_state::acknowledge_blocked;
use governor::logging;
use governor::looping::{LoopConfig, LoopStop, run_loop};
use governor::tick::{TickDeps, TickOutcome, run_tick};

#[derive(Parser)]
#[command(
    name = "governor",
    version,
    about = "Crash-safe tick governor for autonomous build loops"
)]
struct Cli {
    /// Repository root to govern.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,
    /// Config file (defaults to `<root>/governor.toml`).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write `governor.toml`, the state dir and a goal placeholder.
    Init {
        /// Overwrite existing files.
        #[arg(short, long)]
        force: bool,
    },
    /// Run exactly one tick.
    Tick,
    /// Run ticks until one does not succeed or the planner stops.
    Loop {
        #[arg(long)]
        max_ticks: Option<u32>,
        /// Consecutive dispatches of one task treated as a loop (0 disables).
        #[arg(long, default_value_t = 3)]
        max_redispatch: u32,
    },
    /// Delete the lock file left by a crashed tick.
    Unlock,
    /// Acknowledge a blocked outcome and reset escalation state.
    Ack,
    /// Print the fingerprint of a task JSON file.
    Fingerprint { file: PathBuf },
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let root = cli.root.as_path();
    match cli.command {
        Command::Init { force } => cmd_init(root, force),
        Command::Tick => {
            let config = resolve_config(root, cli.config.as_deref())?;
            cmd_tick(root, &config)
        }
        Command::Loop {
            max_ticks,
            max_redispatch,
        } => {
            let config = resolve_config(root, cli.config.as_deref())?;
            let loop_config = LoopConfig {
                max_ticks,
                max_redispatch,
            };
            cmd_loop(root, &config, &loop_config)
        }
        Command::Unlock => {
            let config = resolve_config(root, cli.config.as_deref())?;
            let paths = GovernorPaths::new(root, &config.state_dir);
            release_lock(&paths.lock_path)?;
            println!("released {}", paths.lock_path.display());
            Ok(exit_codes::OK)
        }
        Command::Ack => {
            let config = resolve_config(root, cli.config.as_deref())?;
            let paths = GovernorPaths::new(root, &config.state_dir);
            match acknowledge_blocked(&paths)? {
                Some(blocked) => println!("acknowledged {} from {}", blocked.code, blocked.run_id),
                None => println!("nothing to acknowledge"),
            }
            Ok(exit_codes::OK)
        }
        Command::Fingerprint { file } => cmd_fingerprint(&file),
    }
}

fn resolve_config(root: &Path, explicit: Option<&Path>) -> Result<GovernorConfig> {
    let path = explicit.map_or_else(|| GovernorPaths::default_config_path(root), Path::to_path_buf);
    load_config(&path)
}

fn cmd_init(root: &Path, force: bool) -> Result<i32> {
    let paths = init_governor(root, &InitOptions { force })?;
    println!("initialized {}", paths.state_dir.display());
    Ok(exit_codes::OK)
}

fn cmd_tick(root: &Path, config: &GovernorConfig) -> Result<i32> {
    let stop_flag = install_stop_handler()?;
    let invoker = command_invoker(config);
    let checks = ProcessCheckRunner::from_config(&config.verification);
    let cancel = stop_flag.cancel_token();
    let deps = TickDeps {
        invoker: &invoker,
        check_runner: &checks,
        renderer: &MarkdownRenderer,
        cancel: &cancel,
    };
    let outcome = run_tick(root, config, &deps)?;
    print_outcome(&outcome);
    Ok(exit_codes::for_verdict(outcome.report.verdict))
}

fn cmd_loop(root: &Path, config: &GovernorConfig, loop_config: &LoopConfig) -> Result<i32> {
    let stop_flag = install_stop_handler()?;
    let invoker = command_invoker(config);
    let checks = ProcessCheckRunner::from_config(&config.verification);
    let cancel = CancelToken::new();
    let deps = TickDeps {
        invoker: &invoker,
        check_runner: &checks,
        renderer: &MarkdownRenderer,
        cancel: &cancel,
    };
    let outcome = run_loop(root, config, &deps, loop_config, &stop_flag, print_outcome)?;
    println!("loop: {} tick(s), {:?}", outcome.ticks_executed, outcome.stop);
    Ok(match outcome.stop {
        LoopStop::Finished | LoopStop::TickCap { .. } => exit_codes::OK,
        LoopStop::Halted { verdict, .. } => exit_codes::for_verdict(verdict),
        LoopStop::StopRequested | LoopStop::Redispatch { .. } => {
            exit_codes::for_verdict(Verdict::Stop)
        }
    })
}

fn cmd_fingerprint(file: &Path) -> Result<i32> {
    let raw = fs::read_to_string(file).with_context(|| format!("read {}", file.display()))?;
    let value: Value =
        serde_json::from_str(&raw).with_context(|| format!("parse {}", file.display()))?;
    println!("{}", fingerprint_value(&value));
    Ok(exit_codes::OK)
}

fn command_invoker(config: &GovernorConfig) -> CommandInvoker {
    CommandInvoker::new(
        config.agents.clone(),
        Duration::from_secs(config.agents.kill_grace_secs),
    )
}

fn print_outcome(outcome: &TickOutcome) {
    let report = &outcome.report;
    match &report.reason {
        Some(reason) => println!(
            "tick {} {} {}: {reason}",
            report.tick,
            report.verdict.as_str(),
            report.code
        ),
        None => println!("tick {} {} {}", report.tick, report.verdict.as_str(), report.code),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_init_force() {
        let cli = Cli::parse_from(["governor", "init", "--force"]);
        assert!(matches!(cli.command, Command::Init { force: true }));
    }

    #[test]
    fn parse_loop_with_global_root() {
        let cli = Cli::parse_from(["governor", "loop", "--max-ticks", "4", "--root", "/tmp/x"]);
        assert_eq!(cli.root, PathBuf::from("/tmp/x"));
        assert!(matches!(
            cli.command,
            Command::Loop {
                max_ticks: Some(4),
                max_redispatch: 3
            }
        ));
    }
}
