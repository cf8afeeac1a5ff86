//! Deterministic, pure logic shared by the governor.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod blast;
pub mod budget;
pub mod builder_outcome;
pub mod cancel;
pub mod codes;
pub mod fingerprint;
pub mod json_extract;
pub mod params;
pub mod path;
pub mod risk;
pub mod scope;
pub mod stall;
pub mod tick_state;
pub mod types;
