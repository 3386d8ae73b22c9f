//! Ports module for parallel execution
//!
//! Defines inbound (API) and outbound (SPI) port traits.

pub mod inbound;
pub mod outbound;

pub use inbound::{BlockOutcome, BlockStats, ParallelExecutionApi};
pub use outbound::{CommitKey, CommitSink, Interpreter, StateView};
