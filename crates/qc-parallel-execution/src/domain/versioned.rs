//! Versioned state entries and their deterministic order

use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};

use super::errors::{ExecutionError, ValueError};
use super::path::{is_container, Path};
use super::value_objects::{Accumulator, Commutative, Delta, NumericDelta, TxIndex, TypedValue};

/// Sort key for access records: path ascending, then id ascending.
///
/// Exports and merges key by the entry origin; the arbitrator keys by
/// sequence id. Both use this ordering.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AccessKey<'a> {
    pub path: &'a str,
    pub id: u64,
}

impl<'a> AccessKey<'a> {
    pub fn new(path: &'a str, id: u64) -> Self {
        Self { path, id }
    }
}

/// One state cell as seen by a cache layer, with its access counters.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedValue {
    pub path: Path,
    /// `None` means deleted or absent
    pub value: Option<TypedValue>,
    /// Tx index of the first toucher
    pub origin: TxIndex,
    pub reads: u32,
    pub writes: u32,
    pub delta_writes: u32,
    /// Value existed below the layer that materialized this entry
    pub preexisting: bool,
    /// Survives conflict invalidation
    pub persistent: bool,
}

impl VersionedValue {
    pub fn new(origin: TxIndex, path: impl Into<Path>, value: Option<TypedValue>) -> Self {
        let preexisting = value.is_some();
        Self {
            path: path.into(),
            value,
            origin,
            reads: 0,
            writes: 0,
            delta_writes: 0,
            preexisting,
            persistent: false,
        }
    }

    pub fn key(&self) -> AccessKey<'_> {
        AccessKey::new(&self.path, self.origin)
    }

    pub fn is_read_only(&self) -> bool {
        self.writes == 0 && self.delta_writes == 0
    }

    /// Entry changes state
    pub fn is_transition(&self) -> bool {
        !self.is_read_only()
    }

    pub fn is_absolute(&self) -> bool {
        self.writes > 0
    }

    pub fn is_delta_only(&self) -> bool {
        self.writes == 0 && self.delta_writes > 0
    }

    /// No access was counted at all
    pub fn is_untouched(&self) -> bool {
        self.reads == 0 && self.is_read_only()
    }

    pub fn exists(&self) -> bool {
        self.value.is_some()
    }

    pub fn accumulator(&self) -> Option<&Accumulator> {
        self.value.as_ref().and_then(TypedValue::accumulator)
    }

    pub fn pending_delta(&self) -> Option<Delta> {
        self.value.as_ref().and_then(TypedValue::pending_delta)
    }

    /// Fold a later access to the same path into this entry.
    ///
    /// An absolute write replaces the value (pending deltas of the later
    /// entry folded in); a delta-only write accumulates its pending delta.
    /// Counters add up, `persistent` is sticky.
    pub fn absorb(&mut self, later: &VersionedValue) -> Result<(), ValueError> {
        if later.is_absolute() {
            self.value = later.value.as_ref().map(TypedValue::folded);
        } else if later.delta_writes > 0 {
            if let Some(delta) = later.pending_delta() {
                match self.value.as_mut() {
                    Some(value) => value.apply_delta(&delta)?,
                    None => {
                        let mut value = TypedValue::from_delta(&delta);
                        value.apply_delta(&delta)?;
                        self.value = Some(value);
                    }
                }
            }
        }
        self.reads = self.reads.saturating_add(later.reads);
        self.writes = self.writes.saturating_add(later.writes);
        self.delta_writes = self.delta_writes.saturating_add(later.delta_writes);
        self.persistent |= later.persistent;
        Ok(())
    }

    /// Value after applying this transition on top of `existing`.
    pub fn resolve_onto(
        &self,
        existing: Option<&TypedValue>,
    ) -> Result<Option<TypedValue>, ValueError> {
        if self.is_absolute() {
            return Ok(self.value.as_ref().map(TypedValue::folded));
        }
        if self.delta_writes == 0 {
            return Ok(existing.cloned());
        }
        let Some(delta) = self.pending_delta() else {
            return Ok(existing.cloned());
        };
        let mut value = existing
            .map(TypedValue::folded)
            .unwrap_or_else(|| TypedValue::from_delta(&delta));
        value.apply_delta(&delta)?;
        value.fold();
        Ok(Some(value))
    }

    /// Delta-only immune copy of a numeric entry carrying `delta`.
    ///
    /// Used for fee debits and credits.
    pub fn fee_transition(&self, delta: NumericDelta) -> Result<VersionedValue, ValueError> {
        let mut entry = self.clone();
        match entry.value.as_mut() {
            Some(TypedValue::Commutative(Commutative::Numeric(acc))) => acc.replace_delta(delta),
            Some(other) => {
                return Err(ValueError::KindMismatch {
                    expected: "numeric",
                    found: other.kind(),
                })
            }
            None => {
                let mut acc = Accumulator::unbounded(primitive_types::U256::zero());
                acc.replace_delta(delta);
                entry.value = Some(TypedValue::Commutative(Commutative::Numeric(acc)));
            }
        }
        entry.reads = 0;
        entry.writes = 0;
        entry.delta_writes = 1;
        entry.persistent = true;
        Ok(entry)
    }
}

/// Sort by `AccessKey`.
pub fn sort_by_access(entries: &mut [VersionedValue]) {
    entries.sort_by(|a, b| a.key().cmp(&b.key()));
}

/// Merge order: container entries first, then elements, each group by
/// `AccessKey`.
pub fn sort_for_merge(entries: &mut [VersionedValue]) {
    entries.sort_by(|a, b| {
        is_container(&b.path)
            .cmp(&is_container(&a.path))
            .then_with(|| a.key().cmp(&b.key()))
    });
}

/// Keccak-256 over the bincode encoding of `transitions`, in order.
pub fn transition_digest(transitions: &[VersionedValue]) -> Result<[u8; 32], ExecutionError> {
    let mut hasher = Keccak256::new();
    for transition in transitions {
        let bytes = bincode::serialize(transition)
            .map_err(|e| ExecutionError::Encoding(e.to_string()))?;
        hasher.update(&bytes);
    }
    Ok(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use primitive_types::U256;

    fn numeric(v: u64) -> Option<TypedValue> {
        Some(TypedValue::numeric(U256::from(v)))
    }

    fn delta_entry(origin: TxIndex, path: &str, base: u64, delta: NumericDelta) -> VersionedValue {
        let mut entry = VersionedValue::new(origin, path, numeric(base));
        if let Some(value) = entry.value.as_mut() {
            value.apply_delta(&Delta::Numeric(delta)).unwrap();
        }
        entry.delta_writes = 1;
        entry
    }

    #[test]
    fn test_access_key_order() {
        let mut keys = vec![
            AccessKey::new("/b", 1),
            AccessKey::new("/a", 9),
            AccessKey::new("/b", 0),
            AccessKey::new("/a", 2),
        ];
        keys.sort();
        assert_eq!(
            keys,
            vec![
                AccessKey::new("/a", 2),
                AccessKey::new("/a", 9),
                AccessKey::new("/b", 0),
                AccessKey::new("/b", 1),
            ]
        );
    }

    #[test]
    fn test_sort_for_merge_puts_containers_first() {
        let mut entries = vec![
            VersionedValue::new(1, "/a/x", None),
            VersionedValue::new(1, "/b/", None),
            VersionedValue::new(0, "/a/", None),
        ];
        sort_for_merge(&mut entries);
        let paths: Vec<_> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["/a/", "/b/", "/a/x"]);
    }

    #[test]
    fn test_absorb_accumulates_deltas() {
        let mut local = delta_entry(1, "/x", 10, NumericDelta::credit(U256::from(5)));
        let later = delta_entry(2, "/x", 15, NumericDelta::credit(U256::from(3)));
        local.absorb(&later).unwrap();
        assert_eq!(local.value.as_ref().and_then(TypedValue::as_u256), Some(U256::from(18)));
        assert_eq!(local.delta_writes, 2);
        assert_eq!(local.origin, 1);
    }

    #[test]
    fn test_absorb_absolute_replaces() {
        let mut local = delta_entry(1, "/x", 10, NumericDelta::credit(U256::from(5)));
        let mut later = VersionedValue::new(2, "/x", numeric(99));
        later.writes = 1;
        local.absorb(&later).unwrap();
        assert_eq!(local.value, numeric(99));
        assert!(local.is_absolute());
    }

    #[test]
    fn test_absorb_keeps_persistent() {
        let mut local = VersionedValue::new(1, "/x", numeric(1));
        let mut later = delta_entry(1, "/x", 1, NumericDelta::credit(U256::one()));
        later.persistent = true;
        local.absorb(&later).unwrap();
        assert!(local.persistent);
    }

    #[test]
    fn test_resolve_onto_applies_delta() {
        let entry = delta_entry(1, "/x", 0, NumericDelta::debit(U256::from(4)));
        // Base seen by the entry is irrelevant, only the delta is applied.
        let resolved = entry.resolve_onto(numeric(10).as_ref()).unwrap();
        assert_eq!(resolved, numeric(6));
        assert!(entry.resolve_onto(numeric(3).as_ref()).is_err());
    }

    #[test]
    fn test_fee_transition_replaces_delta() {
        let mut entry = delta_entry(4, "/bal", 100, NumericDelta::debit(U256::from(70)));
        entry.reads = 2;
        let fee = entry.fee_transition(NumericDelta::debit(U256::from(21))).unwrap();
        assert!(fee.persistent);
        assert_eq!((fee.reads, fee.writes, fee.delta_writes), (0, 0, 1));
        assert_eq!(fee.accumulator().map(Accumulator::current), Some(U256::from(79)));

        let plain = VersionedValue::new(4, "/code", Some(TypedValue::plain(vec![0u8])));
        assert!(plain.fee_transition(NumericDelta::zero()).is_err());
    }

    #[test]
    fn test_digest_is_order_sensitive() {
        let a = VersionedValue::new(1, "/a", numeric(1));
        let b = VersionedValue::new(2, "/b", numeric(2));
        let ab = transition_digest(&[a.clone(), b.clone()]).unwrap();
        let ba = transition_digest(&[b, a]).unwrap();
        assert_ne!(ab, ba);
    }
}
