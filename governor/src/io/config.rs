//! Governor configuration stored in `governor.toml` at the repository root.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::budget::BudgetPolicy;
use crate::core::params::ParamRules;
use crate::core::path::validate_relative_path;
use crate::core::risk::{EscalationPolicy, RiskPolicy};
use crate::core::scope::{GlobList, GlobalScope};
use crate::core::types::DiffLimits;
use crate::io::atomic::write_atomic;
use crate::io::paths::DEFAULT_STATE_DIR;

/// Governor configuration (TOML).
///
/// Edited by humans; every field has a default so a missing file or section
/// yields a working configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GovernorConfig {
    /// State directory relative to the repository root.
    pub state_dir: String,
    /// Paths the governor itself owns; no task may touch them.
    pub runner_owned_globs: Vec<String>,
    pub scope: GlobalScope,
    /// Used when a task carries no limits of its own.
    pub diff_limits: DiffLimits,
    pub agents: AgentsConfig,
    pub planner: PlannerConfig,
    pub builder: BuilderConfig,
    pub verification: VerificationConfig,
    pub risk: RiskPolicy,
    pub escalation: EscalationPolicy,
    pub budget: BudgetPolicy,
    pub report: ReportConfig,
    pub git: GitConfig,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            state_dir: DEFAULT_STATE_DIR.to_string(),
            runner_owned_globs: vec![
                format!("{DEFAULT_STATE_DIR}/**"),
                crate::io::paths::CONFIG_FILE.to_string(),
            ],
            scope: GlobalScope::default(),
            diff_limits: DiffLimits::default(),
            agents: AgentsConfig::default(),
            planner: PlannerConfig::default(),
            builder: BuilderConfig::default(),
            verification: VerificationConfig::default(),
            risk: RiskPolicy::default(),
            escalation: EscalationPolicy::default(),
            budget: BudgetPolicy::default(),
            report: ReportConfig::default(),
            git: GitConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentsConfig {
    pub planner: AgentCommand,
    pub builder: AgentCommand,
    pub reviewer: AgentCommand,
    /// Rendered prompts are trimmed to this many bytes, droppable sections first.
    pub prompt_budget_bytes: usize,
    /// Time between SIGTERM and SIGKILL for agent processes.
    pub kill_grace_secs: u64,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            planner: AgentCommand::default(),
            builder: AgentCommand::default(),
            reviewer: AgentCommand::default(),
            prompt_budget_bytes: 32 * 1024,
            kill_grace_secs: 5,
        }
    }
}

/// How to spawn one agent role. The prompt is piped on stdin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentCommand {
    /// Program and arguments; never run through a shell.
    pub command: Vec<String>,
    pub timeout_secs: u64,
    /// Bytes of stdout/stderr kept in memory.
    pub output_limit_bytes: usize,
    /// Flag used to pass the turn budget (e.g. `--max-turns`), if supported.
    pub max_turns_flag: Option<String>,
}

impl Default for AgentCommand {
    fn default() -> Self {
        Self {
            command: vec![
                "codex".to_string(),
                "exec".to_string(),
                "--skip-git-repo-check".to_string(),
                "-".to_string(),
            ],
            timeout_secs: 30 * 60,
            output_limit_bytes: 1_000_000,
            max_turns_flag: None,
        }
    }
}

impl AgentCommand {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    fn validate(&self, role: &str) -> Result<()> {
        if self.command.first().is_none_or(|program| program.trim().is_empty()) {
            return Err(anyhow!("agents.{role}.command must be a non-empty array"));
        }
        if self.timeout_secs == 0 {
            return Err(anyhow!("agents.{role}.timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("agents.{role}.output_limit_bytes must be > 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PlannerConfig {
    /// Extra planner calls allowed after malformed output.
    pub max_retries: u32,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self { max_retries: 2 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BuilderConfig {
    /// Treat unusable builder output as fatal for every task kind.
    pub strict_output: bool,
    /// Upper bound on the turn budget a task may request.
    pub max_turns: u32,
    pub external: ExternalDriverConfig,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            strict_output: false,
            max_turns: 40,
            external: ExternalDriverConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExternalDriverConfig {
    /// Driver program and arguments. Empty means no driver is configured.
    pub command: Vec<String>,
    /// Result file, relative to the repository root. Unset means
    /// `BUILDER_RESULT.json` inside the state directory.
    pub output_path: Option<String>,
    pub timeout_secs: u64,
    pub kill_grace_secs: u64,
    pub output_limit_bytes: usize,
}

impl Default for ExternalDriverConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            output_path: None,
            timeout_secs: 30 * 60,
            kill_grace_secs: 5,
            output_limit_bytes: 1_000_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VerificationConfig {
    /// Check templates by id, referenced from a task's `verification` plan.
    pub templates: BTreeMap<String, VerifyTemplate>,
    pub params: ParamRules,
    pub default_timeout_secs: u64,
    pub kill_grace_secs: u64,
    /// Tail of stdout/stderr kept per run.
    pub output_limit_bytes: usize,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            templates: BTreeMap::new(),
            params: ParamRules::default(),
            default_timeout_secs: 10 * 60,
            kill_grace_secs: 5,
            output_limit_bytes: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VerifyTemplate {
    /// Argv with optional `{{param}}` placeholders.
    pub argv: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Reruns after a failure; a later pass marks the check flaky.
    #[serde(default)]
    pub reruns_on_failure: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReportConfig {
    pub markdown: bool,
    /// Hard cap on REPORT.md length, in characters.
    pub markdown_char_budget: usize,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            markdown: true,
            markdown_char_budget: 8_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GitConfig {
    pub commit_on_success: bool,
    pub commit_message_prefix: String,
    /// Branch checked out (created if missing) before every tick.
    pub work_branch: Option<String>,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            commit_on_success: true,
            commit_message_prefix: "governor:".to_string(),
            work_branch: None,
        }
    }
}

impl GovernorConfig {
    pub fn validate(&self) -> Result<()> {
        validate_relative_path(&self.state_dir)
            .map_err(|reason| anyhow!("state_dir {:?}: {reason}", self.state_dir))?;
        GlobList::compile(&self.runner_owned_globs).context("runner_owned_globs")?;
        GlobList::compile(&self.scope.forbidden_globs).context("scope.forbidden_globs")?;
        GlobList::compile(&self.risk.high_risk_globs).context("risk.high_risk_globs")?;
        if self.diff_limits.max_files_touched == 0 || self.diff_limits.max_lines_changed == 0 {
            return Err(anyhow!("diff_limits must be > 0"));
        }
        self.agents.planner.validate("planner")?;
        self.agents.builder.validate("builder")?;
        self.agents.reviewer.validate("reviewer")?;
        if self.agents.prompt_budget_bytes < 1024 {
            return Err(anyhow!("agents.prompt_budget_bytes must be >= 1024"));
        }
        if self.builder.max_turns == 0 {
            return Err(anyhow!("builder.max_turns must be > 0"));
        }
        let external = &self.builder.external;
        if let Some(output_path) = &external.output_path {
            validate_relative_path(output_path).map_err(|reason| {
                anyhow!("builder.external.output_path {output_path:?}: {reason}")
            })?;
        }
        if external.timeout_secs == 0 {
            return Err(anyhow!("builder.external.timeout_secs must be > 0"));
        }
        for (id, template) in &self.verification.templates {
            if template.argv.first().is_none_or(|program| program.trim().is_empty()) {
                return Err(anyhow!("verification.templates.{id}.argv must be non-empty"));
            }
            if template.timeout_secs == Some(0) {
                return Err(anyhow!("verification.templates.{id}.timeout_secs must be > 0"));
            }
        }
        if self.verification.default_timeout_secs == 0 {
            return Err(anyhow!("verification.default_timeout_secs must be > 0"));
        }
        if self.verification.output_limit_bytes == 0 {
            return Err(anyhow!("verification.output_limit_bytes must be > 0"));
        }
        self.verification
            .params
            .compile()
            .context("verification.params")?;
        if self.risk.diff_fraction_threshold <= 0.0 {
            return Err(anyhow!("risk.diff_fraction_threshold must be > 0"));
        }
        if self.budget.warning_fraction <= 0.0 || self.budget.warning_fraction > 1.0 {
            return Err(anyhow!("budget.warning_fraction must be in (0, 1]"));
        }
        if self.report.markdown_char_budget == 0 {
            return Err(anyhow!("report.markdown_char_budget must be > 0"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `GovernorConfig::default()`.
impl GovernorConfig {
    /// Runner-owned globs, always including the configured state directory.
    pub fn owned_globs(&self) -> Vec<String> {
        let state_glob = format!("{}/**", self.state_dir.trim_end_matches('/'));
        let mut globs = self.runner_owned_globs.clone();
        if !globs.contains(&state_glob) {
            globs.push(state_glob);
        }
        globs
    }
}

pub fn load_config(path: &Path) -> Result<GovernorConfig> {
    if !path.exists() {
        let cfg = GovernorConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: GovernorConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &GovernorConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, GovernorConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("governor.toml");
        let mut cfg = GovernorConfig::default();
        cfg.verification.templates.insert(
            "unit".to_string(),
            VerifyTemplate {
                argv: vec!["cargo".into(), "test".into(), "-p".into(), "{{pkg}}".into()],
                timeout_secs: Some(120),
                reruns_on_failure: 1,
            },
        );
        cfg.git.work_branch = Some("governor/work".to_string());
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("governor.toml");
        fs::write(
            &path,
            "[diff_limits]\nmax_files_touched = 3\nmax_lines_changed = 50\n\n\
             [verification.templates.lint]\nargv = [\"cargo\", \"clippy\"]\n",
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.diff_limits.max_files_touched, 3);
        assert_eq!(cfg.state_dir, ".governor");
        assert_eq!(cfg.verification.templates["lint"].reruns_on_failure, 0);
    }

    #[test]
    fn validate_rejects_escaping_state_dir() {
        let cfg = GovernorConfig {
            state_dir: "../elsewhere".to_string(),
            ..GovernorConfig::default()
        };
        let err = cfg.validate().expect_err("invalid");
        assert!(err.to_string().contains("state_dir"));
    }

    #[test]
    fn custom_state_dir_stays_runner_owned() {
        let cfg = GovernorConfig {
            state_dir: "ops/governor".to_string(),
            ..GovernorConfig::default()
        };
        let owned = cfg.owned_globs();
        assert!(owned.contains(&"ops/governor/**".to_string()), "{owned:?}");
        assert!(owned.contains(&"governor.toml".to_string()));
        assert_eq!(GovernorConfig::default().owned_globs().len(), 2);
    }

    #[test]
    fn validate_rejects_escaping_driver_output_path() {
        let mut cfg = GovernorConfig::default();
        cfg.builder.external.output_path = Some("/tmp/result.json".to_string());
        let err = cfg.validate().expect_err("invalid");
        assert!(err.to_string().contains("output_path"), "{err}");
    }

    #[test]
    fn validate_rejects_empty_template_argv() {
        let mut cfg = GovernorConfig::default();
        cfg.verification.templates.insert(
            "broken".to_string(),
            VerifyTemplate {
                argv: Vec::new(),
                timeout_secs: None,
                reruns_on_failure: 0,
            },
        );
        assert!(cfg.validate().is_err());
    }
}
