//! Token usage and cumulative budget accounting.
//!
//! Usage for one tick is an explicit [`TickUsage`] value threaded through the
//! orchestrator and returned with the report. Cross-tick totals live in
//! [`BudgetCounters`], persisted in STATE.json.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Calls and tokens consumed by a single tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TickUsage {
    pub agent_calls: u64,
    pub builder_calls: u64,
    pub verify_runs: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub estimated_cost_usd: f64,
}

impl TickUsage {
    pub fn record_agent_call(&mut self, usage: Option<TokenUsage>, pricing: &TokenPricing) {
        self.agent_calls += 1;
        if let Some(usage) = usage {
            self.input_tokens += usage.input_tokens;
            self.output_tokens += usage.output_tokens;
            self.estimated_cost_usd += pricing.cost(usage);
        }
    }

    pub fn record_builder_call(&mut self) {
        self.builder_calls += 1;
    }

    pub fn record_verify_run(&mut self) {
        self.verify_runs += 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenPricing {
    pub input_usd_per_mtok: f64,
    pub output_usd_per_mtok: f64,
}

impl Default for TokenPricing {
    fn default() -> Self {
        Self {
            input_usd_per_mtok: 3.0,
            output_usd_per_mtok: 15.0,
        }
    }
}

impl TokenPricing {
    pub fn cost(&self, usage: TokenUsage) -> f64 {
        (usage.input_tokens as f64 * self.input_usd_per_mtok
            + usage.output_tokens as f64 * self.output_usd_per_mtok)
            / 1_000_000.0
    }
}

/// Cumulative totals across ticks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetCounters {
    pub ticks: u64,
    pub agent_calls: u64,
    pub builder_calls: u64,
    pub verify_runs: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub estimated_cost_usd: f64,
}

impl BudgetCounters {
    /// Fold one finished tick into the totals.
    pub fn absorb(&mut self, usage: &TickUsage) {
        self.ticks += 1;
        self.agent_calls += usage.agent_calls;
        self.builder_calls += usage.builder_calls;
        self.verify_runs += usage.verify_runs;
        self.input_tokens += usage.input_tokens;
        self.output_tokens += usage.output_tokens;
        self.estimated_cost_usd += usage.estimated_cost_usd;
    }

    /// Totals as they would stand with `usage` folded in, without mutating.
    pub fn with_tick(&self, usage: &TickUsage) -> Self {
        let mut next = *self;
        next.absorb(usage);
        next
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetPolicy {
    pub max_ticks: Option<u64>,
    pub max_agent_calls: Option<u64>,
    pub max_verify_runs: Option<u64>,
    pub max_estimated_cost_usd: Option<f64>,
    /// Fraction of any limit at which a warning is raised.
    pub warning_fraction: f64,
    pub pricing: TokenPricing,
}

impl Default for BudgetPolicy {
    fn default() -> Self {
        Self {
            max_ticks: None,
            max_agent_calls: None,
            max_verify_runs: None,
            max_estimated_cost_usd: None,
            warning_fraction: 0.8,
            pricing: TokenPricing::default(),
        }
    }
}

impl BudgetPolicy {
    /// `(name, used, limit)` for every limit kind.
    fn limits(&self, counters: &BudgetCounters) -> [(&'static str, f64, Option<f64>); 4] {
        [
            ("ticks", counters.ticks as f64, self.max_ticks.map(|v| v as f64)),
            (
                "agent_calls",
                counters.agent_calls as f64,
                self.max_agent_calls.map(|v| v as f64),
            ),
            (
                "verify_runs",
                counters.verify_runs as f64,
                self.max_verify_runs.map(|v| v as f64),
            ),
            (
                "estimated_cost_usd",
                counters.estimated_cost_usd,
                self.max_estimated_cost_usd,
            ),
        ]
    }

    /// Human-readable warnings for limits at or past the warning fraction.
    pub fn warnings(&self, counters: &BudgetCounters) -> Vec<String> {
        self.limits(counters)
            .into_iter()
            .filter_map(|(name, used, limit)| {
                let limit = limit?;
                (limit > 0.0 && used >= limit * self.warning_fraction).then(|| {
                    format!(
                        "{name} at {:.0}% of budget ({used} of {limit})",
                        used / limit * 100.0
                    )
                })
            })
            .collect()
    }

    /// First limit that is already used up, if any.
    pub fn exhausted(&self, counters: &BudgetCounters) -> Option<String> {
        self.limits(counters)
            .into_iter()
            .find_map(|(name, used, limit)| {
                let limit = limit?;
                (used >= limit).then(|| format!("{name} budget exhausted ({used} of {limit})"))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_usage_prices_tokens() {
        let pricing = TokenPricing {
            input_usd_per_mtok: 2.0,
            output_usd_per_mtok: 10.0,
        };
        let mut usage = TickUsage::default();
        usage.record_agent_call(
            Some(TokenUsage {
                input_tokens: 500_000,
                output_tokens: 100_000,
            }),
            &pricing,
        );
        usage.record_agent_call(None, &pricing);
        assert_eq!(usage.agent_calls, 2);
        assert_eq!(usage.input_tokens, 500_000);
        assert!((usage.estimated_cost_usd - 2.0).abs() < 1e-9);
    }

    #[test]
    fn counters_absorb_ticks() {
        let mut counters = BudgetCounters::default();
        let usage = TickUsage {
            agent_calls: 2,
            builder_calls: 1,
            verify_runs: 3,
            ..TickUsage::default()
        };
        counters.absorb(&usage);
        counters.absorb(&usage);
        assert_eq!(counters.ticks, 2);
        assert_eq!(counters.verify_runs, 6);
        assert_eq!(counters.builder_calls, 2);
    }

    #[test]
    fn warnings_fire_at_the_warning_fraction() {
        let policy = BudgetPolicy {
            max_ticks: Some(10),
            max_agent_calls: Some(100),
            ..BudgetPolicy::default()
        };
        let counters = BudgetCounters {
            ticks: 8,
            agent_calls: 10,
            ..BudgetCounters::default()
        };
        let warnings = policy.warnings(&counters);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].starts_with("ticks at 80%"));
        assert_eq!(policy.exhausted(&counters), None);
    }

    #[test]
    fn exhausted_reports_the_first_spent_limit() {
        let policy = BudgetPolicy {
            max_verify_runs: Some(4),
            ..BudgetPolicy::default()
        };
        let counters = BudgetCounters {
            verify_runs: 4,
            ..BudgetCounters::default()
        };
        let reason = policy.exhausted(&counters).expect("exhausted");
        assert!(reason.contains("verify_runs"));
    }

    #[test]
    fn unlimited_policy_never_warns() {
        let policy = BudgetPolicy::default();
        let counters = BudgetCounters {
            ticks: 1_000,
            ..BudgetCounters::default()
        };
        assert!(policy.warnings(&counters).is_empty());
        assert!(policy.exhausted(&counters).is_none());
    }
}
