//! Inbound Ports (Driving Ports / API)

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::entities::BlockContext;
use crate::domain::errors::ExecutionError;
use crate::execution::{Generation, GenerationOutcome, GenerationStats};

/// Result of executing every generation of a block.
#[derive(Clone, Debug, Default)]
pub struct BlockOutcome {
    pub block_number: u64,
    /// One outcome per generation, in execution order
    pub generations: Vec<GenerationOutcome>,
}

impl BlockOutcome {
    /// Number of transitions committed across all generations
    pub fn transitions(&self) -> usize {
        self.generations.iter().map(|g| g.transitions.len()).sum()
    }

    /// Summed statistics of every generation.
    pub fn stats(&self) -> BlockStats {
        self.generations.iter().fold(BlockStats::default(), |mut total, outcome| {
            total.add(&outcome.stats);
            total
        })
    }
}

/// Aggregate counters over a block.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockStats {
    pub generations: usize,
    pub sequences: usize,
    pub jobs: usize,
    pub conflicting_sequences: usize,
    pub flagged_jobs: usize,
    pub transitions: usize,
}

impl BlockStats {
    fn add(&mut self, stats: &GenerationStats) {
        self.generations += 1;
        self.sequences += stats.sequences;
        self.jobs += stats.jobs;
        self.conflicting_sequences += stats.conflicting_sequences;
        self.flagged_jobs += stats.flagged_jobs;
        self.transitions += stats.transitions;
    }
}

/// Primary Parallel Execution API
#[async_trait]
pub trait ParallelExecutionApi: Send + Sync {
    /// Execute one generation against committed state and commit its
    /// cleared transitions.
    async fn execute_generation(
        &self,
        block: BlockContext,
        generation: Generation,
    ) -> Result<GenerationOutcome, ExecutionError>;

    /// Execute generations one after another. Each generation observes the
    /// transitions committed by the ones before it.
    async fn execute_block(
        &self,
        block: BlockContext,
        generations: Vec<Generation>,
    ) -> Result<BlockOutcome, ExecutionError>;
}
