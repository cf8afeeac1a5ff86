//! SIGINT/SIGTERM handling.
//!
//! A signal only raises a flag; nothing exits from the handler. `governor
//! loop` reads the flag between ticks and starts no further tick. `governor
//! tick` also hands the flag to the tick as its [`CancelToken`], so the running
//! agent or check is terminated and the tick ends interrupted, with a report
//! and the lock released.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use tracing::debug;

use crate::core::cancel::CancelToken;

/// Set once SIGINT or SIGTERM has been received.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// A cancel token sharing this flag: a stop request cancels the tick.
    pub fn cancel_token(&self) -> CancelToken {
        CancelToken::from_flag(Arc::clone(&self.0))
    }
}

/// Route SIGINT and SIGTERM to a new [`StopFlag`].
#[cfg(unix)]
pub fn install_stop_handler() -> Result<StopFlag> {
    use signal_hook::consts::{SIGINT, SIGTERM};

    let flag = StopFlag::new();
    for signal in [SIGINT, SIGTERM] {
        signal_hook::flag::register(signal, Arc::clone(&flag.0))
            .with_context(|| format!("register handler for signal {signal}"))?;
    }
    debug!("stop handler installed");
    Ok(flag)
}

#[cfg(not(unix))]
pub fn install_stop_handler() -> Result<StopFlag> {
    use signal_hook::consts::SIGINT;

    let flag = StopFlag::new();
    signal_hook::flag::register(SIGINT, Arc::clone(&flag.0))
        .context("register handler for SIGINT")?;
    debug!("stop handler installed");
    Ok(flag)
}
