//! Risk flags and escalation decisions.
//!
//! Flags are derived from the judge's findings (when a diff exists) and from
//! tick history. [`should_escalate`] turns them into a routing decision:
//! nobody, the reviewing agent, or a human.

use serde::{Deserialize, Serialize};

use crate::core::blast::{BlastRadius, TouchedFiles, diff_fraction};
use crate::core::scope::{GlobList, globs_may_overlap};
use crate::core::types::{DiffLimits, StopHistoryEntry, TaskScope, Verdict};

/// Risk thresholds from configuration (`[risk]`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskPolicy {
    /// Sensitive paths; touching (or being allowed to touch) them is high risk.
    pub high_risk_globs: Vec<String>,
    /// Fraction of the diff budget above which a change is flagged.
    pub diff_fraction_threshold: f64,
}

impl Default for RiskPolicy {
    fn default() -> Self {
        Self {
            high_risk_globs: Vec::new(),
            diff_fraction_threshold: 0.8,
        }
    }
}

/// Escalation thresholds from configuration (`[escalation]`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationPolicy {
    pub reviewer_enabled: bool,
    /// A consecutive-failure streak above this escalates straight to a human.
    pub failure_streak_threshold: u32,
    pub repeated_stop_window: u64,
    pub repeated_stop_max: u32,
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self {
            reviewer_enabled: false,
            failure_streak_threshold: 1,
            repeated_stop_window: 10,
            repeated_stop_max: 2,
        }
    }
}

/// When flags are computed. Before BUILD there is no diff, so sensitivity is
/// judged from the task's allowed globs instead of touched paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskTrigger {
    PreBuild,
    PostJudge,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "flag", rename_all = "snake_case")]
pub enum RiskFlag {
    HighRiskPath { paths: Vec<String> },
    DiffFraction { fraction: f64, threshold: f64 },
    VerifyFail,
    BudgetWarning,
    RepeatedStop { stops: u32, window: u64 },
}

impl RiskFlag {
    pub fn name(&self) -> &'static str {
        match self {
            RiskFlag::HighRiskPath { .. } => "high_risk_path",
            RiskFlag::DiffFraction { .. } => "diff_fraction",
            RiskFlag::VerifyFail => "verify_fail",
            RiskFlag::BudgetWarning => "budget_warning",
            RiskFlag::RepeatedStop { .. } => "repeated_stop",
        }
    }

    /// Budget warnings are reported but never escalate on their own.
    pub fn warrants_escalation(&self) -> bool {
        !matches!(self, RiskFlag::BudgetWarning)
    }
}

/// Observed diff, present only after the judge has run.
#[derive(Debug, Clone, Copy)]
pub struct DiffAnalysis<'a> {
    pub blast: &'a BlastRadius,
    pub touched: &'a TouchedFiles,
}

/// Everything [`compute_risk_flags`] looks at.
#[derive(Debug, Clone, Copy)]
pub struct RiskInputs<'a> {
    pub diff: Option<DiffAnalysis<'a>>,
    pub limits: &'a DiffLimits,
    pub scope: &'a TaskScope,
    pub trigger: RiskTrigger,
    pub stop_history: &'a [StopHistoryEntry],
    pub current_tick: u64,
    pub verify_failed: bool,
    pub budget_warning: bool,
}

pub fn compute_risk_flags(
    inputs: &RiskInputs<'_>,
    risk: &RiskPolicy,
    escalation: &EscalationPolicy,
) -> anyhow::Result<Vec<RiskFlag>> {
    let mut flags = Vec::new();

    if !risk.high_risk_globs.is_empty() {
        let sensitive = GlobList::compile(&risk.high_risk_globs)?;
        let mut paths: Vec<String> = match (inputs.trigger, inputs.diff) {
            (RiskTrigger::PostJudge, Some(diff)) => diff
                .touched
                .all
                .iter()
                .filter(|p| sensitive.is_match(p))
                .cloned()
                .collect(),
            _ => Vec::new(),
        };
        if inputs.trigger == RiskTrigger::PreBuild {
            paths.extend(allowed_overlap(inputs.scope, &risk.high_risk_globs));
        }
        if !paths.is_empty() {
            flags.push(RiskFlag::HighRiskPath { paths });
        }
    }

    if let Some(diff) = inputs.diff {
        let fraction = diff_fraction(diff.blast, inputs.limits);
        if fraction > risk.diff_fraction_threshold {
            flags.push(RiskFlag::DiffFraction {
                fraction,
                threshold: risk.diff_fraction_threshold,
            });
        }
    }

    if inputs.verify_failed {
        flags.push(RiskFlag::VerifyFail);
    }
    if inputs.budget_warning {
        flags.push(RiskFlag::BudgetWarning);
    }

    let stops = count_stops_in_window(
        inputs.stop_history,
        escalation.repeated_stop_window,
        inputs.current_tick,
    );
    if escalation.repeated_stop_max > 0 && stops >= escalation.repeated_stop_max {
        flags.push(RiskFlag::RepeatedStop {
            stops,
            window: escalation.repeated_stop_window,
        });
    }

    Ok(flags)
}

/// Allowed globs that may reach a sensitive glob. An empty allow list reaches everything.
fn allowed_overlap(scope: &TaskScope, high_risk_globs: &[String]) -> Vec<String> {
    if scope.allowed_globs.is_empty() {
        return high_risk_globs.to_vec();
    }
    scope
        .allowed_globs
        .iter()
        .filter(|allowed| {
            high_risk_globs
                .iter()
                .any(|sensitive| globs_may_overlap(allowed, sensitive))
        })
        .cloned()
        .collect()
}

fn count_stops_in_window(history: &[StopHistoryEntry], window_ticks: u64, current_tick: u64) -> u32 {
    let start = current_tick.saturating_sub(window_ticks);
    history
        .iter()
        .filter(|entry| entry.verdict == Verdict::Stop)
        .filter(|entry| entry.tick >= start && entry.tick <= current_tick)
        .count() as u32
}

/// True when at least `max_stops` stop verdicts fall in
/// `[current_tick - window_ticks, current_tick]` (inclusive).
pub fn check_repeated_stops(
    history: &[StopHistoryEntry],
    window_ticks: u64,
    max_stops: u32,
    current_tick: u64,
) -> bool {
    count_stops_in_window(history, window_ticks, current_tick) >= max_stops
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationMode {
    None,
    Reviewer,
    Human,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationDecision {
    pub mode: EscalationMode,
    pub reason: Option<String>,
}

/// Tick history relevant to escalation.
#[derive(Debug, Clone, Copy)]
pub struct EscalationState<'a> {
    pub failure_streak: u32,
    pub stop_history: &'a [StopHistoryEntry],
    pub risk_flags: &'a [RiskFlag],
}

/// Resolve the escalation mode.
///
/// A failure streak above threshold goes to a human and short-circuits every
/// other check. Otherwise repeated stops or an escalating risk flag route to
/// the reviewer when one is enabled, else to a human.
pub fn should_escalate(
    state: &EscalationState<'_>,
    policy: &EscalationPolicy,
    current_tick: u64,
) -> EscalationDecision {
    if state.failure_streak > policy.failure_streak_threshold {
        return EscalationDecision {
            mode: EscalationMode::Human,
            reason: Some(format!(
                "failure streak {} exceeds threshold {}",
                state.failure_streak, policy.failure_streak_threshold
            )),
        };
    }

    let mut reasons = Vec::new();
    if policy.repeated_stop_max > 0
        && check_repeated_stops(
            state.stop_history,
            policy.repeated_stop_window,
            policy.repeated_stop_max,
            current_tick,
        )
    {
        reasons.push(format!(
            "at least {} stops within the last {} ticks",
            policy.repeated_stop_max, policy.repeated_stop_window
        ));
    }
    for flag in state.risk_flags {
        if flag.warrants_escalation() && !matches!(flag, RiskFlag::RepeatedStop { .. }) {
            reasons.push(format!("risk flag {}", flag.name()));
        }
    }

    if reasons.is_empty() {
        return EscalationDecision {
            mode: EscalationMode::None,
            reason: None,
        };
    }
    let mode = if policy.reviewer_enabled {
        EscalationMode::Reviewer
    } else {
        EscalationMode::Human
    };
    EscalationDecision {
        mode,
        reason: Some(reasons.join("; ")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stop(tick: u64) -> StopHistoryEntry {
        StopHistoryEntry {
            tick,
            verdict: Verdict::Stop,
        }
    }

    fn policy(reviewer_enabled: bool) -> EscalationPolicy {
        EscalationPolicy {
            reviewer_enabled,
            failure_streak_threshold: 1,
            repeated_stop_window: 10,
            repeated_stop_max: 2,
        }
    }

    #[test]
    fn repeated_stops_counts_inclusive_window() {
        let history = [stop(5), stop(8), stop(12)];
        assert!(check_repeated_stops(&history, 10, 2, 12));

        let old = [stop(1), stop(2)];
        assert!(!check_repeated_stops(&old, 10, 2, 15));
        // Window start is inclusive: [5, 15].
        assert!(check_repeated_stops(&[stop(5), stop(15)], 10, 2, 15));
        assert!(!check_repeated_stops(&[stop(4), stop(15)], 10, 2, 15));
    }

    #[test]
    fn non_stop_verdicts_are_ignored() {
        let history = [
            stop(3),
            StopHistoryEntry {
                tick: 4,
                verdict: Verdict::Blocked,
            },
            StopHistoryEntry {
                tick: 5,
                verdict: Verdict::Success,
            },
        ];
        assert!(!check_repeated_stops(&history, 10, 2, 5));
    }

    #[test]
    fn failure_streak_beats_repeated_stops() {
        let history = [stop(9), stop(10)];
        let decision = should_escalate(
            &EscalationState {
                failure_streak: 2,
                stop_history: &history,
                risk_flags: &[],
            },
            &policy(true),
            10,
        );
        assert_eq!(decision.mode, EscalationMode::Human);
        assert!(decision.reason.expect("reason").contains("failure streak"));
    }

    #[test]
    fn repeated_stops_go_to_reviewer_when_enabled() {
        let history = [stop(9), stop(10)];
        let state = EscalationState {
            failure_streak: 0,
            stop_history: &history,
            risk_flags: &[],
        };
        assert_eq!(
            should_escalate(&state, &policy(true), 10).mode,
            EscalationMode::Reviewer
        );
        assert_eq!(
            should_escalate(&state, &policy(false), 10).mode,
            EscalationMode::Human
        );
    }

    #[test]
    fn quiet_history_does_not_escalate() {
        let decision = should_escalate(
            &EscalationState {
                failure_streak: 1,
                stop_history: &[stop(2)],
                risk_flags: &[RiskFlag::BudgetWarning],
            },
            &policy(true),
            10,
        );
        assert_eq!(decision.mode, EscalationMode::None);
    }

    #[test]
    fn pre_build_flags_sensitive_allowed_globs() {
        let scope = TaskScope {
            allowed_globs: vec!["src/**".into(), ".github/workflows/**".into()],
            ..TaskScope::default()
        };
        let risk = RiskPolicy {
            high_risk_globs: vec![".github/**".into()],
            ..RiskPolicy::default()
        };
        let flags = compute_risk_flags(
            &RiskInputs {
                diff: None,
                limits: &DiffLimits::default(),
                scope: &scope,
                trigger: RiskTrigger::PreBuild,
                stop_history: &[],
                current_tick: 1,
                verify_failed: false,
                budget_warning: false,
            },
            &risk,
            &EscalationPolicy::default(),
        )
        .expect("flags");
        assert_eq!(
            flags,
            vec![RiskFlag::HighRiskPath {
                paths: vec![".github/workflows/**".to_string()]
            }]
        );
    }

    #[test]
    fn post_judge_flags_touched_paths_and_diff_fraction() {
        let touched = TouchedFiles::new(vec!["infra/main.tf".into(), "src/a.rs".into()], vec![], vec![]);
        let blast = BlastRadius {
            files_touched: 2,
            lines_added: 90,
            lines_deleted: 0,
            new_files: 0,
        };
        let limits = DiffLimits {
            max_files_touched: 10,
            max_lines_changed: 100,
        };
        let risk = RiskPolicy {
            high_risk_globs: vec!["infra/**".into()],
            diff_fraction_threshold: 0.8,
        };
        let flags = compute_risk_flags(
            &RiskInputs {
                diff: Some(DiffAnalysis {
                    blast: &blast,
                    touched: &touched,
                }),
                limits: &limits,
                scope: &TaskScope::default(),
                trigger: RiskTrigger::PostJudge,
                stop_history: &[stop(1), stop(2)],
                current_tick: 3,
                verify_failed: true,
                budget_warning: true,
            },
            &risk,
            &EscalationPolicy::default(),
        )
        .expect("flags");
        let names: Vec<&str> = flags.iter().map(RiskFlag::name).collect();
        assert_eq!(
            names,
            vec![
                "high_risk_path",
                "diff_fraction",
                "verify_fail",
                "budget_warning",
                "repeated_stop"
            ]
        );
    }
}
