//! Blast radius and diff-limit policy.

use serde::{Deserialize, Serialize};

use crate::core::codes::ReportCode;
use crate::core::types::DiffLimits;

/// Paths changed relative to the tick's base commit.
///
/// All lists are sorted and deduplicated so serialized reports stay stable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TouchedFiles {
    /// Tracked paths that differ from the base commit (including deletions).
    pub tracked: Vec<String>,
    /// Untracked, non-ignored paths.
    pub untracked: Vec<String>,
    /// Union of `tracked` and `untracked`.
    pub all: Vec<String>,
    /// Paths that did not exist at the base commit.
    pub new_files: Vec<String>,
}

impl TouchedFiles {
    pub fn new(mut tracked: Vec<String>, mut untracked: Vec<String>, mut added: Vec<String>) -> Self {
        tracked.sort();
        tracked.dedup();
        untracked.sort();
        untracked.dedup();
        let mut all: Vec<String> = tracked.iter().chain(untracked.iter()).cloned().collect();
        all.sort();
        all.dedup();
        added.extend(untracked.iter().cloned());
        added.sort();
        added.dedup();
        Self {
            tracked,
            untracked,
            all,
            new_files: added,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.all.is_empty()
    }

    pub fn is_new(&self, path: &str) -> bool {
        self.new_files.binary_search_by(|p| p.as_str().cmp(path)).is_ok()
    }
}

/// Quantitative size of a change. Derived, never stored as policy input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlastRadius {
    pub files_touched: u32,
    pub lines_added: u64,
    pub lines_deleted: u64,
    pub new_files: u32,
}

impl BlastRadius {
    pub fn lines_changed(&self) -> u64 {
        self.lines_added + self.lines_deleted
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiffLimitCheck {
    pub ok: bool,
    pub stop_code: Option<ReportCode>,
    pub reason: Option<String>,
}

/// Fail when files touched or lines changed (added + deleted) exceed `limits`.
pub fn check_diff_limits(blast: &BlastRadius, limits: &DiffLimits) -> DiffLimitCheck {
    let mut reasons = Vec::new();
    if blast.files_touched > limits.max_files_touched {
        reasons.push(format!(
            "files touched {} exceeds limit {}",
            blast.files_touched, limits.max_files_touched
        ));
    }
    if blast.lines_changed() > u64::from(limits.max_lines_changed) {
        reasons.push(format!(
            "lines changed {} exceeds limit {}",
            blast.lines_changed(),
            limits.max_lines_changed
        ));
    }
    if reasons.is_empty() {
        return DiffLimitCheck {
            ok: true,
            stop_code: None,
            reason: None,
        };
    }
    DiffLimitCheck {
        ok: false,
        stop_code: Some(ReportCode::StopDiffTooLarge),
        reason: Some(reasons.join("; ")),
    }
}

/// Fraction of the diff budget consumed: the larger of the file and line ratios.
pub fn diff_fraction(blast: &BlastRadius, limits: &DiffLimits) -> f64 {
    let files = f64::from(blast.files_touched) / f64::from(limits.max_files_touched.max(1));
    let lines = blast.lines_changed() as f64 / f64::from(limits.max_lines_changed.max(1));
    files.max(lines)
}
