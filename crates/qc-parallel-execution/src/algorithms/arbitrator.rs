//! Arbitrator
//!
//! Detects conflicting accesses across the sequences of one generation.
//!
//! Sequences are replayed in ascending id order against a ledger of what
//! the lower ids kept, one job at a time. A job is kept unless one of its
//! accesses clashes with an access another sequence kept:
//! - an absolute write clashes with every other access of the path
//! - a container overwrite clashes with every access beneath the container
//! - delta writes and reads never clash with each other, but a delta that
//!   moves the combined total out of the accumulator bounds loses
//!
//! The first clashing job truncates its sequence. From there on only the
//! immune transitions of each job enter the ledger; a job whose immune
//! deltas no longer fit is voided.

use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, trace, warn};

use crate::domain::conflicts::{Conflict, ConflictKind, ConflictSet};
use crate::domain::path::parent_of;
use crate::domain::value_objects::{Accumulator, NumericDelta, SequenceId, TxIndex};
use crate::domain::versioned::VersionedValue;

use super::bounds;

/// Entries one job put before arbitration.
#[derive(Default)]
struct JobEntries<'a> {
    entries: Vec<&'a VersionedValue>,
}

impl<'a> JobEntries<'a> {
    /// What the job emits when kept: per path the plain entry, or the
    /// persistent one when the job has nothing else there.
    fn kept(&self) -> Vec<&'a VersionedValue> {
        let mut by_path: BTreeMap<&'a str, &'a VersionedValue> = BTreeMap::new();
        for entry in self.entries.iter().copied() {
            let slot = by_path.entry(entry.path.as_str()).or_insert(entry);
            if slot.persistent && !entry.persistent {
                *slot = entry;
            }
        }
        by_path.into_values().collect()
    }

    /// What the job still emits once its sequence is truncated.
    fn immune(&self) -> Vec<&'a VersionedValue> {
        let mut by_path: BTreeMap<&'a str, &'a VersionedValue> = BTreeMap::new();
        for entry in self.entries.iter().copied().filter(|entry| entry.persistent) {
            by_path.entry(entry.path.as_str()).or_insert(entry);
        }
        by_path.into_values().collect()
    }
}

type Jobs<'a> = BTreeMap<TxIndex, JobEntries<'a>>;

/// What the sequences kept so far did to one path.
#[derive(Default)]
struct Ledger {
    absolute: BTreeSet<SequenceId>,
    readers: BTreeSet<SequenceId>,
    delta_writers: BTreeSet<SequenceId>,
    /// Kept an access beneath this container
    beneath: BTreeSet<SequenceId>,
    /// Sum of the kept numeric deltas
    total: NumericDelta,
}

fn first_other(ids: &BTreeSet<SequenceId>, own: SequenceId) -> Option<SequenceId> {
    ids.iter().copied().find(|id| *id != own)
}

/// Cross-sequence conflict detection.
pub struct Arbitrator;

impl Arbitrator {
    /// Detect conflicts among `accesses`, where `ids[i]` is the sequence
    /// that exported `accesses[i]` and each entry's origin is the job that
    /// produced it.
    ///
    /// Lower sequence ids always win. Deterministic for a given input
    /// regardless of its order.
    pub fn detect(ids: &[SequenceId], accesses: &[VersionedValue]) -> ConflictSet {
        debug_assert_eq!(ids.len(), accesses.len());
        let sequences = group(ids, accesses);
        let mut replay = Replay {
            snapshot: snapshot_accumulators(&sequences),
            ledger: BTreeMap::new(),
            conflicts: ConflictSet::new(),
        };
        for (&id, jobs) in &sequences {
            replay.sequence(id, jobs);
        }
        debug!(
            sequences = sequences.len(),
            conflicts = replay.conflicts.len(),
            voided = replay.conflicts.voided().len(),
            "Arbitration complete"
        );
        replay.conflicts
    }
}

fn group<'a>(ids: &[SequenceId], accesses: &'a [VersionedValue]) -> BTreeMap<SequenceId, Jobs<'a>> {
    let mut sequences: BTreeMap<SequenceId, Jobs<'a>> = BTreeMap::new();
    for (id, access) in ids.iter().copied().zip(accesses) {
        if access.is_untouched() {
            continue;
        }
        sequences
            .entry(id)
            .or_default()
            .entry(access.origin)
            .or_default()
            .entries
            .push(access);
    }
    sequences
}

/// Accumulator of every numeric path as the parent snapshot holds it.
///
/// Taken from the first job of a sequence to reach the path, unless that
/// job wrote it absolutely; later jobs see the sequence's own changes.
fn snapshot_accumulators<'a>(
    sequences: &BTreeMap<SequenceId, Jobs<'a>>,
) -> BTreeMap<&'a str, &'a Accumulator> {
    let mut snapshot = BTreeMap::new();
    for jobs in sequences.values() {
        let mut reached: BTreeSet<&'a str> = BTreeSet::new();
        for job in jobs.values() {
            let fresh: Vec<&'a VersionedValue> = job
                .entries
                .iter()
                .copied()
                .filter(|entry| !reached.contains(entry.path.as_str()))
                .collect();
            for entry in fresh {
                reached.insert(entry.path.as_str());
                if entry.is_absolute() {
                    continue;
                }
                if let Some(acc) = entry.accumulator() {
                    snapshot.entry(entry.path.as_str()).or_insert(acc);
                }
            }
        }
    }
    snapshot
}

struct Replay<'a> {
    snapshot: BTreeMap<&'a str, &'a Accumulator>,
    ledger: BTreeMap<&'a str, Ledger>,
    conflicts: ConflictSet,
}

impl<'a> Replay<'a> {
    fn sequence(&mut self, id: SequenceId, jobs: &Jobs<'a>) {
        let mut truncated = false;
        for (&tx_index, job) in jobs {
            if !truncated {
                let kept = job.kept();
                let clashes = self.clashes(id, tx_index, &kept);
                if clashes.is_empty() {
                    self.keep(id, &kept);
                    continue;
                }
                truncated = true;
                for conflict in clashes {
                    trace!(
                        path = %conflict.path,
                        winner = conflict.winner,
                        loser = conflict.loser,
                        kind = ?conflict.kind,
                        "Conflict detected"
                    );
                    self.conflicts.insert(conflict);
                }
            }

            let immune = job.immune();
            match self.overdrawn(&immune) {
                None => self.keep(id, &immune),
                Some(path) => {
                    warn!(
                        sequence = id,
                        tx_index,
                        path,
                        "Immune transitions no longer fit, voiding job"
                    );
                    self.conflicts.void(tx_index);
                }
            }
        }
    }

    /// Conflicts keeping this job would cause, at most one per path.
    fn clashes(
        &self,
        id: SequenceId,
        tx_index: TxIndex,
        entries: &[&'a VersionedValue],
    ) -> Vec<Conflict> {
        let mut found: BTreeMap<&'a str, Conflict> = BTreeMap::new();
        let mut note = |path: &'a str, winner: SequenceId, kind: ConflictKind| {
            let conflict = found.entry(path).or_insert_with(|| Conflict {
                path: path.to_string(),
                winner,
                loser: id,
                loser_tx: tx_index,
                kind,
            });
            if kind == ConflictKind::Wildcard {
                conflict.kind = kind;
            }
        };

        for entry in entries.iter().copied() {
            let path = entry.path.as_str();
            if let Some((winner, kind)) = self.clash_on(id, entry) {
                note(path, winner, kind);
            }
            let mut ancestor = parent_of(path);
            while let Some(container) = ancestor {
                let overwritten = self
                    .ledger
                    .get(container)
                    .and_then(|ledger| first_other(&ledger.absolute, id));
                if let Some(winner) = overwritten {
                    note(container, winner, ConflictKind::Wildcard);
                }
                ancestor = parent_of(container);
            }
            if let Some(winner) = self.overflows(id, entry) {
                note(path, winner, ConflictKind::BoundsViolation);
            }
        }
        found.into_values().collect()
    }

    fn clash_on(
        &self,
        id: SequenceId,
        entry: &VersionedValue,
    ) -> Option<(SequenceId, ConflictKind)> {
        let ledger = self.ledger.get(entry.path.as_str())?;
        if !entry.is_absolute() {
            let winner = first_other(&ledger.absolute, id)?;
            let kind = if entry.delta_writes > 0 {
                ConflictKind::WriteWrite
            } else {
                ConflictKind::ReadWrite
            };
            return Some((winner, kind));
        }

        let winner = [
            &ledger.absolute,
            &ledger.beneath,
            &ledger.delta_writers,
            &ledger.readers,
        ]
        .into_iter()
        .filter_map(|ids| first_other(ids, id))
        .min()?;
        let kind = if ledger.absolute.contains(&winner) {
            ConflictKind::WriteWrite
        } else if ledger.beneath.contains(&winner) {
            ConflictKind::Wildcard
        } else if ledger.delta_writers.contains(&winner) {
            ConflictKind::WriteWrite
        } else {
            ConflictKind::ReadWrite
        };
        Some((winner, kind))
    }

    /// Lowest other delta writer, when adding `entry` to the kept deltas
    /// leaves the bounds.
    fn overflows(&self, id: SequenceId, entry: &'a VersionedValue) -> Option<SequenceId> {
        if !entry.is_delta_only() {
            return None;
        }
        let delta = entry.accumulator()?.delta();
        let ledger = self.ledger.get(entry.path.as_str())?;
        if !ledger.absolute.is_empty() {
            return None;
        }
        let winner = first_other(&ledger.delta_writers, id)?;
        let acc = self.accumulator(entry)?;
        match bounds::extend(acc, &ledger.total, delta) {
            Some(_) => None,
            None => Some(winner),
        }
    }

    /// First immune delta that no longer fits on top of the kept deltas.
    fn overdrawn(&self, entries: &[&'a VersionedValue]) -> Option<&'a str> {
        entries.iter().copied().find_map(|entry| {
            if !entry.is_delta_only() {
                return None;
            }
            let delta = entry.accumulator()?.delta();
            let total = match self.ledger.get(entry.path.as_str()) {
                Some(ledger) if !ledger.absolute.is_empty() => return None,
                Some(ledger) => ledger.total,
                None => NumericDelta::zero(),
            };
            let acc = self.accumulator(entry)?;
            match bounds::extend(acc, &total, delta) {
                Some(_) => None,
                None => Some(entry.path.as_str()),
            }
        })
    }

    fn accumulator(&self, entry: &'a VersionedValue) -> Option<&'a Accumulator> {
        self.snapshot
            .get(entry.path.as_str())
            .copied()
            .or_else(|| entry.accumulator())
    }

    fn keep(&mut self, id: SequenceId, entries: &[&'a VersionedValue]) {
        for entry in entries.iter().copied() {
            let path = entry.path.as_str();
            let ledger = self.ledger.entry(path).or_default();
            if entry.reads > 0 {
                ledger.readers.insert(id);
            }
            if entry.writes > 0 {
                ledger.absolute.insert(id);
            }
            if entry.delta_writes > 0 {
                ledger.delta_writers.insert(id);
            }
            if entry.is_delta_only() {
                let sum = entry
                    .accumulator()
                    .and_then(|acc| ledger.total.checked_add(acc.delta()));
                if let Some(sum) = sum {
                    ledger.total = sum;
                }
            }
            let mut ancestor = parent_of(path);
            while let Some(container) = ancestor {
                self.ledger.entry(container).or_default().beneath.insert(id);
                ancestor = parent_of(container);
            }
        }
    }
}
