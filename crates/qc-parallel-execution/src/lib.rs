//! # QC Parallel Execution
//!
//! Optimistic parallel execution of state-mutating jobs.
//!
//! Independent job sequences of a generation run concurrently, each over
//! its own cascading write cache rooted at a shared read-only snapshot.
//! Afterwards a single arbitration pass detects conflicting accesses,
//! truncates losing sequences from their first conflicting job, and hands
//! back the cleared transitions for commit. Commutative values (bounded
//! accumulators, member sets) merge concurrent deltas without conflict as
//! long as their bounds hold.
//!
//! ## Architecture
//!
//! - **Domain**: Typed values, versioned entries, paths, conflicts, invariants
//! - **Cache**: Layered write cache with delta merge and export
//! - **Execution**: Job, JobSequence, Generation, worker budget
//! - **Algorithms**: Arbitrator and bounds pass
//! - **Ports**: Inbound (ParallelExecutionApi) and Outbound (StateView, Interpreter, CommitSink)
//! - **Adapters**: In-memory store and scripted interpreter
//! - **Application**: Service running and committing generations

pub mod adapters;
pub mod algorithms;
pub mod application;
pub mod cache;
pub mod config;
pub mod domain;
pub mod execution;
pub mod ports;

pub use adapters::{InMemoryStore, Op, ScriptedInterpreter};
pub use algorithms::Arbitrator;
pub use application::ParallelExecutionService;
pub use cache::{ExportFilter, LayerId, LayerView, WriteCache};
pub use config::ExecutionConfig;
pub use domain::conflicts::{Conflict, ConflictKind, ConflictSet};
pub use domain::entities::*;
pub use domain::errors::*;
pub use domain::value_objects::*;
pub use domain::versioned::{transition_digest, VersionedValue};
pub use execution::{
    ExecutionContext, Generation, GenerationOutcome, GenerationStats, Job, JobResult, JobSequence,
    ResourceBudget, SequenceState, TxContext,
};
pub use ports::inbound::{BlockOutcome, BlockStats, ParallelExecutionApi};
pub use ports::outbound::{CommitKey, CommitSink, Interpreter, StateView};
