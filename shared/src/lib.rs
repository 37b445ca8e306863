//! Shared types and utilities for kdprof
//!
//! This crate contains the data model used across the profiling core and the
//! agent: dispatch events, completion records, requested features and the
//! dispatch filter specification.

pub mod types;
pub mod utils;

// Re-export commonly used types
pub use types::{events::*, feature::*, filter::*};
