//! Generations
//!
//! A generation runs mutually independent job sequences concurrently, then
//! arbitrates their accesses once. Conflicting sequences are truncated so
//! the returned transitions equal those of a sequential run in ascending
//! sequence id order.

use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::algorithms::Arbitrator;
use crate::domain::conflicts::ConflictSet;
use crate::domain::errors::{ExecutionError, JobError};
use crate::domain::invariants::invariant_sequence_atomicity;
use crate::domain::value_objects::SequenceId;
use crate::domain::versioned::{transition_digest, VersionedValue};
use crate::ports::outbound::StateView;

use super::context::ExecutionContext;
use super::sequence::JobSequence;

type SequenceRun = Result<(Vec<SequenceId>, Vec<VersionedValue>), ExecutionError>;

/// Statistics from one generation run.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationStats {
    pub sequences: usize,
    pub jobs: usize,
    /// Worker threads the sequences ran on
    pub workers_used: usize,
    pub used_parallel: bool,
    pub failed_sequences: usize,
    pub conflicting_sequences: usize,
    pub flagged_jobs: usize,
    /// Truncated jobs that could not pay their immune transitions
    pub voided_jobs: usize,
    pub transitions: usize,
}

/// Everything a generation run produced.
#[derive(Clone, Debug, Default)]
pub struct GenerationOutcome {
    pub generation_id: u64,
    /// Cleared transitions in ascending sequence id order
    pub transitions: Vec<VersionedValue>,
    pub conflicts: ConflictSet,
    pub stats: GenerationStats,
}

impl GenerationOutcome {
    /// Keccak-256 digest of the transitions.
    pub fn digest(&self) -> Result<[u8; 32], ExecutionError> {
        transition_digest(&self.transitions)
    }
}

/// Batch of independent job sequences.
#[derive(Clone, Debug)]
pub struct Generation {
    id: u64,
    job_sequences: Vec<JobSequence>,
    degree_of_parallelism: usize,
}

impl Generation {
    pub fn new(id: u64, degree_of_parallelism: usize) -> Self {
        Self {
            id,
            job_sequences: Vec::new(),
            degree_of_parallelism: degree_of_parallelism.max(1),
        }
    }

    pub fn with_sequences(
        id: u64,
        degree_of_parallelism: usize,
        sequences: Vec<JobSequence>,
    ) -> Self {
        Self {
            job_sequences: sequences,
            ..Self::new(id, degree_of_parallelism)
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn degree_of_parallelism(&self) -> usize {
        self.degree_of_parallelism
    }

    pub fn sequences(&self) -> &[JobSequence] {
        &self.job_sequences
    }

    pub fn len(&self) -> usize {
        self.job_sequences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.job_sequences.is_empty()
    }

    pub fn add(&mut self, sequence: JobSequence) {
        self.job_sequences.push(sequence);
    }

    /// Drop every sequence so the generation can take the next batch.
    pub fn clear(&mut self) {
        self.job_sequences.clear();
    }

    /// Run, arbitrate and return the cleared transitions.
    pub fn execute(
        &mut self,
        ctx: &ExecutionContext,
        parent: &dyn StateView,
    ) -> Vec<VersionedValue> {
        self.execute_detailed(ctx, parent).transitions
    }

    /// Same as `execute`, with conflicts and statistics.
    ///
    /// Never fails: a sequence that cannot run is logged and contributes
    /// nothing.
    pub fn execute_detailed(
        &mut self,
        ctx: &ExecutionContext,
        parent: &dyn StateView,
    ) -> GenerationOutcome {
        self.job_sequences.sort_by_key(JobSequence::id);
        let mut stats = GenerationStats {
            sequences: self.job_sequences.len(),
            jobs: self.job_sequences.iter().map(JobSequence::len).sum(),
            ..GenerationStats::default()
        };

        let (runs, workers) = self.dispatch(ctx, parent);
        stats.workers_used = workers;
        stats.used_parallel = workers > 1;

        let mut ids = Vec::new();
        let mut accesses = Vec::new();
        for (sequence, run) in self.job_sequences.iter().zip(runs) {
            match run {
                Ok((seq_ids, seq_accesses)) => {
                    ids.extend(seq_ids);
                    accesses.extend(seq_accesses);
                }
                Err(err) => {
                    stats.failed_sequences += 1;
                    warn!(
                        generation = self.id,
                        sequence = sequence.id(),
                        %err,
                        "Job sequence failed to run"
                    );
                }
            }
        }

        let conflicts = if self.job_sequences.len() > 1 {
            Arbitrator::detect(&ids, &accesses)
        } else {
            ConflictSet::default()
        };

        let conflicting_txs = conflicts.tx_ids();
        for sequence in &mut self.job_sequences {
            if !conflicts.contains(sequence.id()) {
                continue;
            }
            stats.conflicting_sequences += 1;
            stats.flagged_jobs +=
                sequence.flag_conflict(&conflicting_txs, JobError::AccessConflict);
            stats.voided_jobs += sequence.void_jobs(conflicts.voided());
            debug_assert!(invariant_sequence_atomicity(
                sequence
                    .jobs()
                    .iter()
                    .map(|job| job.result().and_then(|r| r.error.as_ref()))
            ));
        }

        let transitions: Vec<VersionedValue> = self
            .job_sequences
            .iter()
            .flat_map(JobSequence::get_cleared_transitions)
            .collect();
        stats.transitions = transitions.len();

        info!(
            generation = self.id,
            nesting = ctx.nesting(),
            sequences = stats.sequences,
            jobs = stats.jobs,
            workers = stats.workers_used,
            conflicts = conflicts.len(),
            flagged_jobs = stats.flagged_jobs,
            voided_jobs = stats.voided_jobs,
            transitions = stats.transitions,
            "Generation executed"
        );

        GenerationOutcome {
            generation_id: self.id,
            transitions,
            conflicts,
            stats,
        }
    }

    /// Run every sequence, on a worker pool when the budget allows.
    fn dispatch(
        &mut self,
        ctx: &ExecutionContext,
        parent: &dyn StateView,
    ) -> (Vec<SequenceRun>, usize) {
        let sequences = self.job_sequences.len();
        let wanted = self.degree_of_parallelism.min(sequences);
        if wanted > 1 && sequences >= ctx.config().parallel_threshold {
            let reservation = ctx.budget().reserve(wanted);
            let workers = reservation.granted();
            if workers > 1 {
                let generation = self.id;
                match ThreadPoolBuilder::new()
                    .num_threads(workers)
                    .thread_name(move |i| format!("qc-exec-{generation}-{i}"))
                    .build()
                {
                    Ok(pool) => {
                        let runs = pool.install(|| {
                            self.job_sequences
                                .par_iter_mut()
                                .map(|sequence| {
                                    let worker = rayon::current_thread_index().unwrap_or(0);
                                    sequence.run(ctx, parent, worker)
                                })
                                .collect()
                        });
                        return (runs, workers);
                    }
                    Err(err) => warn!(
                        generation = self.id,
                        %err,
                        "Worker pool unavailable, running sequentially"
                    ),
                }
            } else {
                debug!(
                    generation = self.id,
                    wanted,
                    "Worker budget exhausted, running sequentially"
                );
            }
        }

        let runs = self
            .job_sequences
            .iter_mut()
            .map(|sequence| sequence.run(ctx, parent, 0))
            .collect();
        (runs, 1)
    }
}
