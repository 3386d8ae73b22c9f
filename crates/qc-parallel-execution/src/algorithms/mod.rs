//! Algorithms module for parallel execution
//!
//! Contains:
//! - Arbitrator (cross-sequence conflict detection)
//! - Bounds pass for concurrent accumulator deltas

pub mod arbitrator;
pub mod bounds;

pub use arbitrator::Arbitrator;
pub use bounds::{combined_delta, extend};
