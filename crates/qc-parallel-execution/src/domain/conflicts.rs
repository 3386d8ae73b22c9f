//! Arbitration output

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::path::Path;
use super::value_objects::{SequenceId, TxIndex};

/// Why two sequences conflict on a path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConflictKind {
    /// Read against an absolute write
    ReadWrite,
    /// Absolute write against an absolute or delta write
    WriteWrite,
    /// Container delete/overwrite against an access beneath it
    Wildcard,
    /// Combined deltas leave the accumulator bounds
    BoundsViolation,
}

/// One losing access.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    pub path: Path,
    pub winner: SequenceId,
    pub loser: SequenceId,
    /// Job of the loser that clashed, where its sequence is truncated
    pub loser_tx: TxIndex,
    pub kind: ConflictKind,
}

/// Per losing sequence summary.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub conflicts_with: BTreeSet<SequenceId>,
    pub tx_indices: BTreeSet<TxIndex>,
}

impl ConflictRecord {
    /// Truncation point of the sequence
    pub fn first_tx(&self) -> Option<TxIndex> {
        self.tx_indices.first().copied()
    }
}

/// Losing sequences and what they lost to.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictSet {
    conflicts: Vec<Conflict>,
    by_sequence: BTreeMap<SequenceId, ConflictRecord>,
    /// Truncated jobs whose immune transitions no longer fit
    voided: BTreeSet<TxIndex>,
}

impl ConflictSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, conflict: Conflict) {
        let record = self.by_sequence.entry(conflict.loser).or_default();
        record.conflicts_with.insert(conflict.winner);
        record.tx_indices.insert(conflict.loser_tx);
        self.conflicts.push(conflict);
    }

    pub fn is_empty(&self) -> bool {
        self.conflicts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.conflicts.len()
    }

    pub fn conflicts(&self) -> &[Conflict] {
        &self.conflicts
    }

    /// Whether `sequence` lost at least once
    pub fn contains(&self, sequence: SequenceId) -> bool {
        self.by_sequence.contains_key(&sequence)
    }

    pub fn record(&self, sequence: SequenceId) -> Option<&ConflictRecord> {
        self.by_sequence.get(&sequence)
    }

    /// Losing sequences in ascending order
    pub fn sequences(&self) -> impl Iterator<Item = SequenceId> + '_ {
        self.by_sequence.keys().copied()
    }

    /// Drop every transition of `tx_index`, immune ones included.
    pub fn void(&mut self, tx_index: TxIndex) {
        self.voided.insert(tx_index);
    }

    pub fn voided(&self) -> &BTreeSet<TxIndex> {
        &self.voided
    }

    /// Every conflicting tx index across all losers
    pub fn tx_ids(&self) -> BTreeSet<TxIndex> {
        self.by_sequence
            .values()
            .flat_map(|record| record.tx_indices.iter().copied())
            .collect()
    }
}

impl FromIterator<Conflict> for ConflictSet {
    fn from_iter<I: IntoIterator<Item = Conflict>>(iter: I) -> Self {
        let mut set = Self::new();
        for conflict in iter {
            set.insert(conflict);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conflict(winner: SequenceId, loser: SequenceId, tx: TxIndex) -> Conflict {
        Conflict {
            path: "/x".to_string(),
            winner,
            loser,
            loser_tx: tx,
            kind: ConflictKind::WriteWrite,
        }
    }

    #[test]
    fn test_records_group_by_loser() {
        let set: ConflictSet = vec![conflict(1, 3, 30), conflict(2, 3, 31), conflict(1, 2, 20)]
            .into_iter()
            .collect();

        assert_eq!(set.len(), 3);
        assert!(set.contains(3));
        assert!(set.contains(2));
        assert!(!set.contains(1));

        let record = set.record(3).unwrap();
        assert_eq!(record.conflicts_with, BTreeSet::from([1, 2]));
        assert_eq!(record.first_tx(), Some(30));
        assert_eq!(set.tx_ids(), BTreeSet::from([20, 30, 31]));
        assert_eq!(set.sequences().collect::<Vec<_>>(), vec![2, 3]);
    }
}
