//! Prompt rendering for the planner, builder and reviewer roles.

use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use regex::Regex;
use tracing::debug;

use crate::core::types::{AgentBuild, DiffLimits, Task};

const PLANNER_TEMPLATE: &str = include_str!("prompts/planner.md");
const BUILDER_TEMPLATE: &str = include_str!("prompts/builder.md");
const REVIEWER_TEMPLATE: &str = include_str!("prompts/reviewer.md");

/// Everything the planner sees about the workspace.
#[derive(Debug, Clone, Default)]
pub struct PlannerPromptInputs {
    pub goal: String,
    pub tick: u64,
    pub milestone: Option<String>,
    pub failure_streak: u32,
    /// Configured verification template ids.
    pub templates: Vec<String>,
    pub forbidden_globs: Vec<String>,
    /// Short rendering of the previous report.
    pub last_report: Option<String>,
    pub open_questions: String,
    /// Why the previous reply was rejected, on retries.
    pub feedback: Vec<String>,
}

impl PlannerPromptInputs {
    /// Goal and open questions are read from the state dir; missing files are empty.
    pub fn load_context(&mut self, goal_path: &Path, questions_path: &Path) -> Result<()> {
        self.goal = read_optional(goal_path)?.unwrap_or_default();
        self.open_questions = read_optional(questions_path)?.unwrap_or_default();
        Ok(())
    }
}

/// Reviewer input: the task under review and why it was escalated.
#[derive(Debug, Clone)]
pub struct ReviewerPromptInputs<'a> {
    pub task: &'a Task,
    pub reason: &'a str,
    pub flags: Vec<String>,
}

fn environment() -> Result<Environment<'static>> {
    let mut env = Environment::new();
    env.add_template("planner", PLANNER_TEMPLATE)
        .context("load planner template")?;
    env.add_template("builder", BUILDER_TEMPLATE)
        .context("load builder template")?;
    env.add_template("reviewer", REVIEWER_TEMPLATE)
        .context("load reviewer template")?;
    Ok(env)
}

fn non_empty(text: &str) -> Option<&str> {
    let text = text.trim();
    (!text.is_empty()).then_some(text)
}

/// A parsed section from rendered template output.
#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    required: bool,
    content: String,
}

/// Split rendered output on `<!-- section:KEY required|droppable -->` markers.
fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->").unwrap()
    });

    let markers: Vec<_> = SECTION_RE
        .captures_iter(rendered)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            Some((
                caps.get(1)?.as_str().to_string(),
                caps.get(2)?.as_str() == "required",
                whole.start(),
                whole.end(),
            ))
        })
        .collect();

    let mut sections = Vec::new();
    for (i, (key, required, _, body_start)) in markers.iter().enumerate() {
        let end = markers
            .get(i + 1)
            .map_or(rendered.len(), |(_, _, next_start, _)| *next_start);
        let content = rendered[*body_start..end].trim().to_string();
        if !content.is_empty() || *required {
            sections.push(ParsedSection {
                key: key.clone(),
                required: *required,
                content,
            });
        }
    }
    sections
}

/// Drop droppable sections in `drop_order` until under budget, then truncate the last one.
fn apply_budget(sections: &mut Vec<ParsedSection>, budget: usize, drop_order: &[&str]) {
    let total_len = |secs: &[ParsedSection]| -> usize { secs.iter().map(|s| s.content.len()).sum() };

    for key in drop_order {
        if total_len(sections) <= budget {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == *key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped section for budget"
            );
            sections.remove(idx);
        }
    }

    let other_len: usize = sections
        .iter()
        .rev()
        .skip(1)
        .map(|s| s.content.len())
        .sum();
    let allowed = budget.saturating_sub(other_len);
    if let Some(last) = sections.last_mut()
        && last.content.len() > allowed
    {
        let before_len = last.content.len();
        let mut cut = allowed.saturating_sub(12);
        while !last.content.is_char_boundary(cut) {
            cut -= 1;
        }
        last.content.truncate(cut);
        last.content.push_str("\n[truncated]");
        debug!(
            section = last.key,
            before_len,
            after_len = last.content.len(),
            "truncated section for budget"
        );
    }
}

fn render_sections(sections: &[ParsedSection]) -> String {
    sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Renders role prompts within a byte budget.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    budget_bytes: usize,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Self {
        Self { budget_bytes }
    }

    pub fn planner(&self, input: &PlannerPromptInputs) -> Result<String> {
        let env = environment()?;
        let rendered = env.get_template("planner")?.render(context! {
            goal => non_empty(&input.goal),
            tick => input.tick,
            milestone => input.milestone.as_deref(),
            failure_streak => input.failure_streak,
            templates => &input.templates,
            forbidden => &input.forbidden_globs,
            last_report => input.last_report.as_deref().and_then(non_empty),
            questions => non_empty(&input.open_questions),
            feedback => &input.feedback,
        })?;
        Ok(self.finish(&rendered, &["questions", "report", "feedback"]))
    }

    pub fn builder(&self, task: &Task, build: &AgentBuild, limits: &DiffLimits) -> Result<String> {
        let env = environment()?;
        let checks: Vec<&String> = task
            .verification
            .fast
            .iter()
            .chain(&task.verification.slow)
            .collect();
        let rendered = env.get_template("builder")?.render(context! {
            task_id => &task.task_id,
            intent => task.intent.trim(),
            allowed => &task.scope.allowed_globs,
            forbidden => &task.scope.forbidden_globs,
            allow_new_files => task.scope.allow_new_files,
            allow_lockfile_changes => task.scope.allow_lockfile_changes,
            max_files => limits.max_files_touched,
            max_lines => limits.max_lines_changed,
            instructions => non_empty(&build.instructions),
            checks => checks,
        })?;
        Ok(self.finish(&rendered, &["checks", "instructions"]))
    }

    pub fn reviewer(&self, input: &ReviewerPromptInputs<'_>) -> Result<String> {
        let env = environment()?;
        let task_json =
            serde_json::to_string_pretty(input.task).context("serialize task for reviewer")?;
        let rendered = env.get_template("reviewer")?.render(context! {
            reason => input.reason,
            flags => &input.flags,
            task_json => task_json,
        })?;
        Ok(self.finish(&rendered, &[]))
    }

    fn finish(&self, rendered: &str, drop_order: &[&str]) -> String {
        let mut sections = parse_sections(rendered);
        apply_budget(&mut sections, self.budget_bytes, drop_order);
        render_sections(&sections)
    }
}

fn read_optional(path: &Path) -> Result<Option<String>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(path)
        .with_context(|| format!("read prompt input {}", path.display()))?;
    Ok(Some(contents))
}
