//! Side-effecting helpers for the governor: filesystem, git, child processes
//! and agent invocation.

pub mod atomic;
pub mod builder;
pub mod config;
pub mod git;
pub mod init;
pub mod invoker;
pub mod judge;
pub mod lock;
pub mod paths;
pub mod planner;
pub mod preflight;
pub mod process;
pub mod prompt;
pub mod report;
pub mod reviewer;
pub mod rollback;
pub mod schema;
pub mod signals;
pub mod verify;
pub mod workspace_state;
