//! Diagnostic tracing for the governor binary.
//!
//! Spans and events go to stderr and are filtered by `RUST_LOG`. They are
//! never a tick outcome: `REPORT.json`, `BLOCKED.json` and `STATE.json` under
//! `.governor/` (see `io/report` and `io/workspace_state`) are written whatever
//! the filter says.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_FILTER: &str = "warn";

/// Install the stderr subscriber.
///
/// `RUST_LOG=governor=debug governor tick` shows process spawns, kills and
/// rollback steps. A second call is a no-op, so embedding callers that
/// already installed a subscriber keep theirs.
pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .compact(),
        )
        .try_init();
}
