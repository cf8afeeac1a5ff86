//! Tick artifacts: REPORT.json, REPORT.md, BLOCKED.json and QUESTIONS.md.

use std::fmt::Write as _;
use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::core::blast::{BlastRadius, TouchedFiles};
use crate::core::budget::{BudgetCounters, TickUsage};
use crate::core::builder_outcome::BuilderInvocationResult;
use crate::core::codes::ReportCode;
use crate::core::risk::{EscalationDecision, RiskFlag};
use crate::core::scope::ScopeCheck;
use crate::core::stall::StallClassification;
use crate::core::tick_state::Phase;
use crate::core::types::{Question, TaskKind, Verdict};
use crate::io::atomic::{remove_if_exists, write_atomic, write_json_atomic};
use crate::io::config::ReportConfig;
use crate::io::paths::GovernorPaths;
use crate::io::reviewer::ReviewerVerdict;
use crate::io::verify::VerificationRun;

pub const REPORT_SCHEMA_VERSION: u32 = 1;

/// Durable outcome of one tick. Exactly one is written per tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Report {
    pub schema_version: u32,
    pub run_id: String,
    pub tick: u64,
    pub started_at: String,
    pub finished_at: String,
    pub verdict: Verdict,
    pub code: ReportCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Last phase entered before the tick ended.
    pub phase: Phase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_commit: Option<String>,
    /// Commit created for an accepted change.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_kind: Option<TaskKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub builder: Option<BuilderInvocationResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blast_radius: Option<BlastRadius>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub touched: Option<TouchedFiles>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope_check: Option<ScopeCheck>,
    pub verification: Vec<VerificationRun>,
    pub risk_flags: Vec<RiskFlag>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escalation: Option<EscalationDecision>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reviewer: Option<ReviewerVerdict>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub question: Option<Question>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stall: Option<StallClassification>,
    /// False when the tree may hold residue the governor could not remove.
    pub worktree_clean_guaranteed: bool,
    pub budget: BudgetSnapshot,
    pub usage: TickUsage,
    pub errors: Vec<String>,
}

/// Cumulative counters after this tick, plus warnings raised against limits.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BudgetSnapshot {
    pub counters: BudgetCounters,
    pub warnings: Vec<String>,
}

impl Report {
    /// A report with only identity and outcome filled in.
    pub fn new(
        run_id: impl Into<String>,
        tick: u64,
        started_at: impl Into<String>,
        code: ReportCode,
    ) -> Self {
        let started_at = started_at.into();
        Self {
            schema_version: REPORT_SCHEMA_VERSION,
            run_id: run_id.into(),
            tick,
            finished_at: started_at.clone(),
            started_at,
            verdict: code.verdict(),
            code,
            reason: None,
            phase: Phase::Lock,
            base_commit: None,
            commit: None,
            task_id: None,
            task_kind: None,
            fingerprint: None,
            builder: None,
            blast_radius: None,
            touched: None,
            scope_check: None,
            verification: Vec::new(),
            risk_flags: Vec::new(),
            escalation: None,
            reviewer: None,
            question: None,
            stall: None,
            worktree_clean_guaranteed: true,
            budget: BudgetSnapshot::default(),
            usage: TickUsage::default(),
            errors: Vec::new(),
        }
    }

    /// Set code and verdict together so they never disagree.
    pub fn set_outcome(&mut self, code: ReportCode, reason: Option<String>) {
        self.code = code;
        self.verdict = code.verdict();
        self.reason = reason;
    }
}

/// Written iff the verdict is `blocked`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedData {
    pub code: ReportCode,
    pub run_id: String,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub remediation: String,
}

impl BlockedData {
    pub fn from_report(report: &Report) -> Self {
        Self {
            code: report.code,
            run_id: report.run_id.clone(),
            created_at: report.finished_at.clone(),
            reason: report.reason.clone(),
            remediation: report
                .code
                .remediation()
                .unwrap_or("Inspect REPORT.json and resolve the condition before the next tick.")
                .to_string(),
        }
    }
}

/// Optional human-readable rendering of a report.
pub trait ReportRenderer {
    fn render(&self, report: &Report) -> Result<String>;
}

/// Markdown summary for operators.
pub struct MarkdownRenderer;

impl ReportRenderer for MarkdownRenderer {
    fn render(&self, report: &Report) -> Result<String> {
        let mut out = String::new();
        writeln!(out, "# Tick {} ({})", report.tick, report.run_id)?;
        writeln!(out)?;
        writeln!(out, "- Verdict: **{}**", report.verdict.as_str())?;
        writeln!(out, "- Code: `{}`", report.code)?;
        if let Some(reason) = &report.reason {
            writeln!(out, "- Reason: {reason}")?;
        }
        writeln!(out, "- Phase: {}", report.phase.as_str())?;
        if let Some(task_id) = &report.task_id {
            let kind = report.task_kind.map_or("?", TaskKind::as_str);
            writeln!(out, "- Task: `{task_id}` ({kind})")?;
        }
        if let Some(commit) = &report.commit {
            writeln!(out, "- Commit: `{commit}`")?;
        }
        if !report.worktree_clean_guaranteed {
            writeln!(out, "- **Working tree is not guaranteed clean.**")?;
        }

        if let Some(blast) = &report.blast_radius {
            writeln!(out, "\n## Blast radius\n")?;
            writeln!(
                out,
                "{} files, +{} -{} lines, {} new",
                blast.files_touched, blast.lines_added, blast.lines_deleted, blast.new_files
            )?;
        }
        if let Some(scope) = report.scope_check.as_ref().filter(|s| !s.ok) {
            writeln!(out, "\n## Scope violations\n")?;
            for violation in &scope.violations {
                writeln!(out, "- `{}`: {:?}", violation.path, violation.kind)?;
            }
        }
        if !report.verification.is_empty() {
            writeln!(out, "\n## Verification\n")?;
            for run in &report.verification {
                writeln!(
                    out,
                    "- `{}` ({:?}): {:?} in {} ms",
                    run.template_id, run.tier, run.status, run.duration_ms
                )?;
            }
        }
        if !report.risk_flags.is_empty() {
            writeln!(out, "\n## Risk\n")?;
            for flag in &report.risk_flags {
                writeln!(out, "- {}", flag.name())?;
            }
            if let Some(escalation) = &report.escalation {
                writeln!(out, "- Escalation: {:?}", escalation.mode)?;
            }
        }
        if let Some(question) = &report.question {
            writeln!(out, "\n## Question\n\n{}", question.text)?;
            for option in &question.options {
                writeln!(out, "- {option}")?;
            }
        }
        writeln!(out, "\n## Budget\n")?;
        let counters = &report.budget.counters;
        writeln!(
            out,
            "ticks {}, agent calls {}, verify runs {}, est. ${:.2}",
            counters.ticks, counters.agent_calls, counters.verify_runs, counters.estimated_cost_usd
        )?;
        for warning in &report.budget.warnings {
            writeln!(out, "- {warning}")?;
        }
        if !report.errors.is_empty() {
            writeln!(out, "\n## Errors\n")?;
            for error in &report.errors {
                writeln!(out, "- {error}")?;
            }
        }
        Ok(out)
    }
}

/// Cut `text` to at most `budget` characters, marking the cut.
pub fn truncate_chars(text: &str, budget: usize) -> String {
    const MARKER: &str = "\n\n[truncated]\n";
    if text.chars().count() <= budget {
        return text.to_string();
    }
    let keep = budget.saturating_sub(MARKER.chars().count());
    let mut out: String = text.chars().take(keep).collect();
    out.push_str(MARKER);
    out.chars().take(budget).collect()
}

/// Persist every artifact for a finished tick.
///
/// REPORT.json and BLOCKED.json errors propagate; the Markdown rendering is
/// best-effort and only logged on failure.
#[instrument(skip_all, fields(code = %report.code))]
pub fn persist_report(
    paths: &GovernorPaths,
    report: &Report,
    config: &ReportConfig,
    renderer: &dyn ReportRenderer,
) -> Result<()> {
    write_json_atomic(&paths.report_path, report)?;
    if report.verdict == Verdict::Blocked {
        write_json_atomic(&paths.blocked_path, &BlockedData::from_report(report))?;
    } else if remove_if_exists(&paths.blocked_path)? {
        debug!("cleared stale BLOCKED.json");
    }

    if config.markdown {
        match renderer.render(report) {
            Ok(markdown) => {
                let markdown = truncate_chars(&markdown, config.markdown_char_budget);
                if let Err(err) = write_atomic(&paths.report_md_path, &markdown) {
                    warn!(err = %err, "failed to write REPORT.md");
                }
            }
            Err(err) => warn!(err = %err, "report rendering failed"),
        }
    }
    Ok(())
}

pub fn load_report(path: &Path) -> Result<Option<serde_json::Value>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read report {}", path.display()))?;
    let value = serde_json::from_str(&contents)
        .with_context(|| format!("parse report {}", path.display()))?;
    Ok(Some(value))
}

pub fn load_blocked(path: &Path) -> Result<Option<BlockedData>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let data = serde_json::from_str(&contents)
        .with_context(|| format!("parse {}", path.display()))?;
    Ok(Some(data))
}

/// Append a surfaced question to QUESTIONS.md.
pub fn append_question(path: &Path, run_id: &str, source: &str, question: &Question) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let mut entry = format!("## {run_id} ({source})\n\n{}\n", question.text.trim());
    if let Some(context) = &question.context {
        entry.push_str(&format!("\n{}\n", context.trim()));
    }
    if !question.options.is_empty() {
        entry.push('\n');
        for option in &question.options {
            entry.push_str(&format!("- {option}\n"));
        }
    }
    entry.push('\n');
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    file.write_all(entry.as_bytes())
        .with_context(|| format!("append {}", path.display()))
}
