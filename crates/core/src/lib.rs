//! Pure domain types and logic shared by every storyreel crate.
//!
//! This crate has zero internal dependencies so that the cache, scheduler,
//! and pipeline crates can all build on the same job model, backoff math,
//! fingerprinting, and estimation heuristics without cycles.

pub mod backoff;
pub mod error;
pub mod estimate;
pub mod fingerprint;
pub mod job;
