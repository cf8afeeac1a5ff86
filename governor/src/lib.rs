//! Crash-safe tick governor for an autonomous build loop.
//!
//! A tick asks a planning agent for one task, hands it to a builder, judges
//! the diff against scope, size and verification policy, and then commits or
//! rolls back. The architecture enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (task model, policy, risk and
//!   escalation, fingerprints). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (filesystem, git, locks, process
//!   execution, agent calls). Isolated behind traits to enable fakes in tests.
//!
//! [`tick`] coordinates the two into a single tick; [`looping`] repeats ticks
//! for `governor loop`.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod looping;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod tick;
