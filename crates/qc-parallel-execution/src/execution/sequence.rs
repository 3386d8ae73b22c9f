//! Job sequences
//!
//! A sequence is a serial chain of jobs sharing one cascading cache: job
//! `i + 1` observes every transition of job `i`. Arbitration sees each job's
//! entries separately and truncates the sequence from the first conflicting
//! job on.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

use crate::cache::{ExportFilter, LayerId, WriteCache};
use crate::domain::errors::{ExecutionError, JobError};
use crate::domain::path::Path;
use crate::domain::value_objects::{SequenceId, TxIndex};
use crate::domain::versioned::{sort_by_access, VersionedValue};
use crate::ports::outbound::StateView;

use super::context::ExecutionContext;
use super::job::{Job, JobResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SequenceState {
    Created,
    Running,
    Completed,
    ConflictFlagged,
}

/// Ordered, serially dependent jobs.
#[derive(Clone, Debug)]
pub struct JobSequence {
    id: SequenceId,
    jobs: Vec<Job>,
    state: SequenceState,
    accesses: Vec<VersionedValue>,
}

impl JobSequence {
    pub fn new(id: SequenceId) -> Self {
        Self {
            id,
            jobs: Vec::new(),
            state: SequenceState::Created,
            accesses: Vec::new(),
        }
    }

    pub fn with_jobs(id: SequenceId, jobs: Vec<Job>) -> Self {
        Self {
            jobs,
            ..Self::new(id)
        }
    }

    pub fn push(&mut self, job: Job) {
        self.jobs.push(job);
    }

    pub fn id(&self) -> SequenceId {
        self.id
    }

    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    pub fn state(&self) -> SequenceState {
        self.state
    }

    /// Accesses exported by the last run, pure reads included
    pub fn accesses(&self) -> &[VersionedValue] {
        &self.accesses
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Execute every job in order over a fresh cache rooted at `parent`.
    ///
    /// Returns every job's arbitration entries, each paired with the
    /// sequence id. Job tx indices ascend along the sequence.
    pub fn run(
        &mut self,
        ctx: &ExecutionContext,
        parent: &dyn StateView,
        worker: usize,
    ) -> Result<(Vec<SequenceId>, Vec<VersionedValue>), ExecutionError> {
        if self.state != SequenceState::Created {
            return Err(ExecutionError::SequenceAlreadyRun { id: self.id });
        }
        self.state = SequenceState::Running;

        let mut cache = WriteCache::new(parent);
        let root = cache.root();
        for job in &mut self.jobs {
            let layer = cache.derive(root)?;
            let executed = job.execute(ctx, &mut cache, layer);
            cache.release(layer)?;
            executed?;
            absorb_job(&mut cache, root, job)?;
        }

        self.accesses = cache.export(root, &ExportFilter::accesses())?;
        self.state = SequenceState::Completed;

        let entries: Vec<VersionedValue> = self
            .jobs
            .iter()
            .filter_map(Job::result)
            .flat_map(JobResult::arbitration_entries)
            .collect();
        debug!(
            sequence = self.id,
            worker,
            jobs = self.jobs.len(),
            accesses = self.accesses.len(),
            entries = entries.len(),
            "Job sequence completed"
        );
        Ok((vec![self.id; entries.len()], entries))
    }

    /// Transitions safe to commit.
    ///
    /// With every job successful this is the merged sequence export. Otherwise
    /// each job's `transitions()` are folded per path: absolute writes replace,
    /// deltas accumulate.
    pub fn get_cleared_transitions(&self) -> Vec<VersionedValue> {
        if !matches!(self.state, SequenceState::Completed | SequenceState::ConflictFlagged) {
            return Vec::new();
        }
        if self.jobs.iter().all(Job::successful) {
            return self
                .accesses
                .iter()
                .filter(|v| v.is_transition())
                .cloned()
                .collect();
        }

        let mut merged: BTreeMap<Path, VersionedValue> = BTreeMap::new();
        for result in self.jobs.iter().filter_map(Job::result) {
            for entry in result.transitions().into_iter().filter(VersionedValue::is_transition) {
                match merged.get_mut(&entry.path) {
                    Some(existing) => {
                        if let Err(err) = existing.absorb(&entry) {
                            warn!(
                                sequence = self.id,
                                tx_index = result.tx_index,
                                path = %entry.path,
                                %err,
                                "Dropping transition that no longer fits"
                            );
                        }
                    }
                    None => {
                        merged.insert(entry.path.clone(), entry);
                    }
                }
            }
        }
        let mut cleared: Vec<VersionedValue> = merged.into_values().collect();
        sort_by_access(&mut cleared);
        cleared
    }

    /// Flag the first job whose tx index is in `tx_ids` and every job after
    /// it. Returns the number of jobs flagged.
    pub fn flag_conflict(&mut self, tx_ids: &BTreeSet<TxIndex>, error: JobError) -> usize {
        let Some(first) = self.jobs.iter().position(|job| tx_ids.contains(&job.tx_index())) else {
            return 0;
        };
        let mut flagged = 0;
        for job in &mut self.jobs[first..] {
            if let Some(result) = job.result_mut() {
                result.flag(error.clone());
                flagged += 1;
            }
        }
        self.state = SequenceState::ConflictFlagged;
        debug!(
            sequence = self.id,
            first_tx = self.jobs[first].tx_index(),
            flagged,
            "Job sequence conflict-flagged"
        );
        flagged
    }

    /// Drop every transition of the jobs in `tx_ids`, immune ones included.
    /// Returns the number of jobs voided.
    pub fn void_jobs(&mut self, tx_ids: &BTreeSet<TxIndex>) -> usize {
        let mut voided = 0;
        for job in &mut self.jobs {
            if !tx_ids.contains(&job.tx_index()) {
                continue;
            }
            if let Some(result) = job.result_mut() {
                result.flag(JobError::AccessConflict);
                result.discard_transitions();
                voided += 1;
            }
        }
        if voided > 0 {
            debug!(sequence = self.id, voided, "Unpayable jobs voided");
        }
        voided
    }
}

/// Merge a finished job's transitions into the sequence layer.
///
/// A job whose transitions cannot be merged is failed and only its immune
/// transitions are merged; if even those do not fit, it contributes nothing.
fn absorb_job(
    cache: &mut WriteCache<'_>,
    root: LayerId,
    job: &mut Job,
) -> Result<(), ExecutionError> {
    let tx_index = job.tx_index();
    let Some(result) = job.result_mut() else {
        return Ok(());
    };
    let Err(err) = cache.merge(root, result.transitions()) else {
        return Ok(());
    };
    warn!(tx_index, %err, "Job transitions rejected, keeping immune transitions");
    result.flag(JobError::from(err));
    result.postprocess();
    if let Err(err) = cache.merge(root, result.transitions()) {
        warn!(tx_index, %err, "Immune transitions rejected");
        result.discard_transitions();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryStore, Op, ScriptedInterpreter};
    use crate::config::ExecutionConfig;
    use crate::domain::entities::{BlockContext, Message};
    use crate::domain::value_objects::{Address, Delta, TypedValue};
    use primitive_types::U256;
    use std::sync::Arc;

    fn ctx(interpreter: ScriptedInterpreter) -> ExecutionContext {
        ExecutionContext::new(
            ExecutionConfig::sequential(),
            BlockContext::default(),
            Arc::new(interpreter),
        )
    }

    fn job(tx: TxIndex) -> Job {
        Job::new(tx, Message::call(Address::from_low_u64_be(1), Address::from_low_u64_be(2)))
    }

    fn store() -> InMemoryStore {
        let store = InMemoryStore::new();
        store.create_container("/data/").unwrap();
        store
    }

    #[test]
    fn test_later_jobs_see_earlier_writes() {
        let interpreter = ScriptedInterpreter::new()
            .script(1, vec![Op::Write("/data/x".into(), Some(TypedValue::numeric(U256::from(5))))])
            .script(2, vec![Op::Copy("/data/x".into(), "/data/y".into())]);
        let ctx = ctx(interpreter);
        let store = store();
        let mut sequence = JobSequence::with_jobs(3, vec![job(1), job(2)]);

        let (ids, accesses) = sequence.run(&ctx, &store, 0).unwrap();
        assert!(ids.iter().all(|id| *id == 3));
        assert_eq!(ids.len(), accesses.len());
        let y = accesses.iter().find(|a| a.path == "/data/y").unwrap();
        assert_eq!(y.value.as_ref().and_then(TypedValue::as_u256), Some(U256::from(5)));
        assert_eq!(sequence.state(), SequenceState::Completed);
    }

    #[test]
    fn test_run_tags_entries_per_job() {
        use crate::domain::value_objects::NumericDelta;

        let interpreter = ScriptedInterpreter::new()
            .script(1, vec![Op::Delta("/data/n".into(), Delta::credit(U256::from(40)))])
            .script(2, vec![Op::Delta("/data/n".into(), Delta::debit(U256::from(40)))]);
        let ctx = ctx(interpreter);
        let store = store();
        let mut sequence = JobSequence::with_jobs(3, vec![job(1), job(2)]);

        let (_, accesses) = sequence.run(&ctx, &store, 0).unwrap();
        let n: Vec<_> = accesses.iter().filter(|a| a.path == "/data/n").collect();
        assert_eq!(n.len(), 2);
        assert_eq!(n[0].origin, 1);
        assert_eq!(
            n[0].accumulator().map(|acc| *acc.delta()),
            Some(NumericDelta::credit(U256::from(40)))
        );
        assert_eq!(n[1].origin, 2);
        assert_eq!(
            n[1].accumulator().map(|acc| *acc.delta()),
            Some(NumericDelta::debit(U256::from(40)))
        );
    }

    #[test]
    fn test_void_jobs_drops_immune_transitions() {
        let interpreter = ScriptedInterpreter::new()
            .with_fees()
            .script(1, vec![Op::Write("/data/a".into(), Some(TypedValue::plain(vec![1])))])
            .script(2, vec![Op::Write("/data/b".into(), Some(TypedValue::plain(vec![2])))]);
        let ctx = ctx(interpreter);
        let store = store();
        store.fund_account(&Address::from_low_u64_be(1), U256::from(1_000_000)).unwrap();
        store.fund_account(&Address::zero(), U256::zero()).unwrap();
        let mut sequence = JobSequence::with_jobs(1, vec![job(1), job(2)]);
        sequence.run(&ctx, &store, 0).unwrap();

        sequence.flag_conflict(&BTreeSet::from([2]), JobError::AccessConflict);
        assert_eq!(sequence.void_jobs(&BTreeSet::from([2])), 1);
        let cleared = sequence.get_cleared_transitions();
        assert!(cleared.iter().any(|t| t.path == "/data/a"));
        assert!(cleared.iter().all(|t| t.path != "/data/b"));
        let job2 = sequence.jobs()[1].result().unwrap();
        assert!(job2.transitions().is_empty());
        assert!(!job2.successful());
    }

    #[test]
    fn test_run_twice_fails() {
        let ctx = ctx(ScriptedInterpreter::new());
        let store = store();
        let mut sequence = JobSequence::with_jobs(1, vec![job(1)]);
        sequence.run(&ctx, &store, 0).unwrap();
        assert!(matches!(
            sequence.run(&ctx, &store, 0),
            Err(ExecutionError::SequenceAlreadyRun { id: 1 })
        ));
    }

    #[test]
    fn test_failed_job_contributes_nothing_but_immune() {
        let interpreter = ScriptedInterpreter::new()
            .script(1, vec![Op::Delta("/data/n".into(), Delta::credit(U256::from(1)))])
            .script(2, vec![
                Op::Delta("/data/n".into(), Delta::credit(U256::from(10))),
                Op::Revert("boom".into()),
            ])
            .script(3, vec![Op::Delta("/data/n".into(), Delta::credit(U256::from(100)))]);
        let ctx = ctx(interpreter);
        let store = store();
        let mut sequence = JobSequence::with_jobs(1, vec![job(1), job(2), job(3)]);
        sequence.run(&ctx, &store, 0).unwrap();

        assert!(!sequence.jobs()[1].successful());
        let cleared = sequence.get_cleared_transitions();
        let n = cleared.iter().find(|t| t.path == "/data/n").unwrap();
        assert_eq!(n.value.as_ref().and_then(TypedValue::as_u256), Some(U256::from(101)));
    }

    #[test]
    fn test_flag_conflict_truncates_from_first_match() {
        let interpreter = ScriptedInterpreter::new()
            .script(1, vec![Op::Write("/data/a".into(), Some(TypedValue::plain(vec![1])))])
            .script(2, vec![Op::Write("/data/b".into(), Some(TypedValue::plain(vec![2])))])
            .script(3, vec![Op::Write("/data/c".into(), Some(TypedValue::plain(vec![3])))]);
        let ctx = ctx(interpreter);
        let store = store();
        let mut sequence = JobSequence::with_jobs(1, vec![job(1), job(2), job(3)]);
        sequence.run(&ctx, &store, 0).unwrap();

        let flagged = sequence.flag_conflict(&BTreeSet::from([2, 99]), JobError::AccessConflict);
        assert_eq!(flagged, 2);
        assert_eq!(sequence.state(), SequenceState::ConflictFlagged);
        assert!(sequence.jobs()[0].successful());
        assert!(!sequence.jobs()[1].successful());
        assert!(!sequence.jobs()[2].successful());

        let paths: Vec<_> = sequence
            .get_cleared_transitions()
            .into_iter()
            .map(|t| t.path)
            .collect();
        assert!(paths.contains(&"/data/a".to_string()));
        assert!(!paths.contains(&"/data/b".to_string()));
        assert!(!paths.contains(&"/data/c".to_string()));
    }

    #[test]
    fn test_flag_conflict_without_match_is_noop() {
        let ctx = ctx(ScriptedInterpreter::new());
        let store = store();
        let mut sequence = JobSequence::with_jobs(1, vec![job(1)]);
        sequence.run(&ctx, &store, 0).unwrap();
        assert_eq!(sequence.flag_conflict(&BTreeSet::from([5]), JobError::AccessConflict), 0);
        assert_eq!(sequence.state(), SequenceState::Completed);
    }

    #[test]
    fn test_unrun_sequence_clears_nothing() {
        let sequence = JobSequence::with_jobs(1, vec![job(1)]);
        assert!(sequence.get_cleared_transitions().is_empty());
    }
}
