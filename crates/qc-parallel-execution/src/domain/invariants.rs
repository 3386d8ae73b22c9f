//! Domain invariants for parallel execution
//!
//! Checked by tests and, in debug builds, after arbitration.

use std::collections::{BTreeMap, BTreeSet};

use super::errors::JobError;
use super::value_objects::{Accumulator, NumericDelta};
use super::versioned::VersionedValue;

/// INVARIANT-1: Unique Paths
/// A cache export holds at most one entry per path.
pub fn invariant_unique_paths(entries: &[VersionedValue]) -> bool {
    let mut seen = BTreeSet::new();
    entries.iter().all(|entry| seen.insert(entry.path.as_str()))
}

/// INVARIANT-2: Bounds Respected
/// Every numeric transition stays within its accumulator bounds, and the
/// delta-only transitions of one path still fit once summed.
pub fn invariant_bounds_respected(transitions: &[VersionedValue]) -> bool {
    let mut summed: BTreeMap<&str, (&Accumulator, NumericDelta)> = BTreeMap::new();
    for transition in transitions {
        let Some(acc) = transition.accumulator() else {
            continue;
        };
        if !acc.admits(acc.delta()) {
            return false;
        }
        if !transition.is_delta_only() {
            continue;
        }
        match summed.get_mut(transition.path.as_str()) {
            Some((_, total)) => match total.checked_add(acc.delta()) {
                Some(sum) => *total = sum,
                None => return false,
            },
            None => {
                summed.insert(transition.path.as_str(), (acc, *acc.delta()));
            }
        }
    }
    summed.values().all(|(acc, total)| acc.admits(total))
}

/// INVARIANT-3: Sequence Atomicity
/// Once a job is flagged with `AccessConflict`, every later job of the
/// sequence carries an error too.
pub fn invariant_sequence_atomicity<'a, I>(errors: I) -> bool
where
    I: IntoIterator<Item = Option<&'a JobError>>,
{
    let mut truncated = false;
    for error in errors {
        match error {
            Some(JobError::AccessConflict) => truncated = true,
            Some(_) => {}
            None if truncated => return false,
            None => {}
        }
    }
    true
}
