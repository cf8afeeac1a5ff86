//! Stable exit codes for governor CLI commands.

use crate::core::types::Verdict;

/// Command succeeded, or the tick ended with a success verdict.
pub const OK: i32 = 0;
/// Invalid config or arguments, or an unexpected fault.
pub const INVALID: i32 = 1;
/// The tick ended with a stop verdict.
pub const STOP: i32 = 2;
/// The tick ended blocked; an operator must act before the next tick.
pub const BLOCKED: i32 = 3;

pub fn for_verdict(verdict: Verdict) -> i32 {
    match verdict {
        Verdict::Success => OK,
        Verdict::Stop => STOP,
        Verdict::Blocked => BLOCKED,
    }
}
