//! Execution model
//!
//! - `Job`: one message run through the interpreter
//! - `JobSequence`: serially dependent jobs over one cascading cache
//! - `Generation`: independent sequences run concurrently, then arbitrated
//! - `ResourceBudget`: worker threads shared with nested generations

pub mod budget;
pub mod context;
pub mod generation;
pub mod job;
pub mod sequence;

pub use budget::{Reservation, ResourceBudget};
pub use context::{ExecutionContext, TxContext};
pub use generation::{Generation, GenerationOutcome, GenerationStats};
pub use job::{Job, JobResult};
pub use sequence::{JobSequence, SequenceState};
