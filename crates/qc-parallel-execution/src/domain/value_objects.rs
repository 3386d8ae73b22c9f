//! Value objects for parallel execution
//!
//! `TypedValue` is the closed set of state value kinds. Plain values are
//! opaque bytes; commutative values carry a committed base plus a pending
//! delta that can be merged with concurrent deltas:
//!
//! | Kind | Base | Pending delta |
//! |------|------|---------------|
//! | `Numeric` | `U256` within `[min, max]` | signed `NumericDelta` |
//! | `Set` | member keys | `SetDelta` (added / removed) |

use primitive_types::{H160, U256};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::errors::ValueError;

/// 20-byte account address
pub type Address = H160;

/// Job sequence identifier; lower ids win arbitration
pub type SequenceId = u64;

/// Transaction index of a job
pub type TxIndex = u64;

/// Writer id of genesis and bookkeeping writes. Exempt from the
/// container existence check.
pub const SYSTEM_WRITER: TxIndex = u64::MAX;

/// Signed 256-bit delta in sign-magnitude form. Zero is never negative.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NumericDelta {
    magnitude: U256,
    negative: bool,
}

impl NumericDelta {
    pub fn zero() -> Self {
        Self::default()
    }

    /// Positive delta
    pub fn credit(amount: U256) -> Self {
        Self {
            magnitude: amount,
            negative: false,
        }
    }

    /// Negative delta
    pub fn debit(amount: U256) -> Self {
        Self {
            magnitude: amount,
            negative: !amount.is_zero(),
        }
    }

    pub fn magnitude(&self) -> U256 {
        self.magnitude
    }

    pub fn is_negative(&self) -> bool {
        self.negative
    }

    pub fn is_zero(&self) -> bool {
        self.magnitude.is_zero()
    }

    /// Sum of two deltas, `None` if the magnitude overflows.
    pub fn checked_add(&self, other: &Self) -> Option<Self> {
        if self.negative == other.negative {
            let magnitude = self.magnitude.checked_add(other.magnitude)?;
            return Some(Self {
                magnitude,
                negative: self.negative && !magnitude.is_zero(),
            });
        }
        if self.magnitude >= other.magnitude {
            let magnitude = self.magnitude - other.magnitude;
            Some(Self {
                magnitude,
                negative: self.negative && !magnitude.is_zero(),
            })
        } else {
            Some(Self {
                magnitude: other.magnitude - self.magnitude,
                negative: other.negative,
            })
        }
    }

    /// Apply to `base`, `None` on underflow or overflow.
    pub fn apply_to(&self, base: U256) -> Option<U256> {
        if self.negative {
            base.checked_sub(self.magnitude)
        } else {
            base.checked_add(self.magnitude)
        }
    }
}

/// Bounded numeric accumulator.
///
/// `base + delta` always lies within `[min, max]`; every mutation that
/// would break this is rejected with `ValueError::BoundsExceeded`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Accumulator {
    base: U256,
    delta: NumericDelta,
    min: U256,
    max: U256,
}

impl Accumulator {
    /// Accumulator over the full `U256` range
    pub fn unbounded(value: U256) -> Self {
        Self {
            base: value,
            delta: NumericDelta::zero(),
            min: U256::zero(),
            max: U256::MAX,
        }
    }

    pub fn bounded(value: U256, min: U256, max: U256) -> Result<Self, ValueError> {
        if min > max {
            return Err(ValueError::InvalidBounds { min, max });
        }
        if value < min || value > max {
            return Err(ValueError::OutOfBounds { value, min, max });
        }
        Ok(Self {
            base: value,
            delta: NumericDelta::zero(),
            min,
            max,
        })
    }

    pub fn base(&self) -> U256 {
        self.base
    }

    pub fn delta(&self) -> &NumericDelta {
        &self.delta
    }

    pub fn min(&self) -> U256 {
        self.min
    }

    pub fn max(&self) -> U256 {
        self.max
    }

    /// Base with the pending delta applied.
    pub fn current(&self) -> U256 {
        // In range by construction, saturation never kicks in.
        if self.delta.negative {
            self.base.saturating_sub(self.delta.magnitude)
        } else {
            self.base.saturating_add(self.delta.magnitude)
        }
    }

    /// Whether `base + total` stays within bounds.
    pub fn admits(&self, total: &NumericDelta) -> bool {
        total
            .apply_to(self.base)
            .is_some_and(|value| value >= self.min && value <= self.max)
    }

    /// Accumulate `delta` on top of the pending delta.
    pub fn apply(&mut self, delta: &NumericDelta) -> Result<(), ValueError> {
        let combined = self.delta.checked_add(delta).ok_or(ValueError::Overflow)?;
        if !self.admits(&combined) {
            return Err(ValueError::BoundsExceeded {
                min: self.min,
                max: self.max,
            });
        }
        self.delta = combined;
        Ok(())
    }

    /// Replace the pending delta without a bounds check; the check happens
    /// when the delta is merged.
    pub fn replace_delta(&mut self, delta: NumericDelta) {
        self.delta = delta;
    }

    /// Commit the pending delta into the base.
    pub fn fold(&mut self) {
        self.base = self.current();
        self.delta = NumericDelta::zero();
    }
}

/// Pending membership changes of a set.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetDelta {
    pub added: BTreeSet<String>,
    pub removed: BTreeSet<String>,
}

impl SetDelta {
    pub fn insert(key: impl Into<String>) -> Self {
        let mut delta = Self::default();
        delta.added.insert(key.into());
        delta
    }

    pub fn remove(key: impl Into<String>) -> Self {
        let mut delta = Self::default();
        delta.removed.insert(key.into());
        delta
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Grow/shrink set. `pending.added` never overlaps the committed members and
/// `pending.removed` is always a subset of them.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberSet {
    members: BTreeSet<String>,
    pending: SetDelta,
}

impl MemberSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_members<I, K>(members: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        Self {
            members: members.into_iter().map(Into::into).collect(),
            pending: SetDelta::default(),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        (self.members.contains(key) && !self.pending.removed.contains(key))
            || self.pending.added.contains(key)
    }

    /// Membership with the pending delta applied.
    pub fn current(&self) -> BTreeSet<String> {
        self.members
            .difference(&self.pending.removed)
            .chain(self.pending.added.iter())
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.members.len() - self.pending.removed.len() + self.pending.added.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pending(&self) -> &SetDelta {
        &self.pending
    }

    pub fn apply(&mut self, delta: &SetDelta) {
        for key in &delta.removed {
            if !self.pending.added.remove(key) && self.members.contains(key) {
                self.pending.removed.insert(key.clone());
            }
        }
        for key in &delta.added {
            if !self.pending.removed.remove(key) && !self.members.contains(key) {
                self.pending.added.insert(key.clone());
            }
        }
    }

    pub fn fold(&mut self) {
        self.members = self.current();
        self.pending = SetDelta::default();
    }
}

/// Commutative write payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Delta {
    Numeric(NumericDelta),
    Set(SetDelta),
}

impl Delta {
    pub fn credit(amount: U256) -> Self {
        Self::Numeric(NumericDelta::credit(amount))
    }

    pub fn debit(amount: U256) -> Self {
        Self::Numeric(NumericDelta::debit(amount))
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Numeric(_) => "numeric",
            Self::Set(_) => "set",
        }
    }

    /// Approximate payload size in bytes.
    pub fn encoded_size(&self) -> usize {
        match self {
            Self::Numeric(_) => 33,
            Self::Set(delta) => delta
                .added
                .iter()
                .chain(delta.removed.iter())
                .map(String::len)
                .sum(),
        }
    }
}

/// Commutative value kinds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Commutative {
    Numeric(Accumulator),
    Set(MemberSet),
}

/// State value held at a path.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TypedValue {
    /// Opaque payload; concurrent writes always conflict
    Plain(Vec<u8>),
    /// Delta-mergeable payload
    Commutative(Commutative),
}

impl TypedValue {
    pub fn plain(bytes: impl Into<Vec<u8>>) -> Self {
        Self::Plain(bytes.into())
    }

    pub fn numeric(value: U256) -> Self {
        Self::Commutative(Commutative::Numeric(Accumulator::unbounded(value)))
    }

    pub fn bounded(value: U256, min: U256, max: U256) -> Result<Self, ValueError> {
        Accumulator::bounded(value, min, max)
            .map(|acc| Self::Commutative(Commutative::Numeric(acc)))
    }

    /// Empty member set, the value of a freshly created container
    pub fn container() -> Self {
        Self::Commutative(Commutative::Set(MemberSet::new()))
    }

    /// Default base for a delta written to an absent path
    pub fn from_delta(delta: &Delta) -> Self {
        match delta {
            Delta::Numeric(_) => Self::numeric(U256::zero()),
            Delta::Set(_) => Self::container(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Plain(_) => "plain",
            Self::Commutative(Commutative::Numeric(_)) => "numeric",
            Self::Commutative(Commutative::Set(_)) => "set",
        }
    }

    pub fn is_commutative(&self) -> bool {
        matches!(self, Self::Commutative(_))
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Plain(bytes) => Some(bytes),
            Self::Commutative(_) => None,
        }
    }

    /// Current numeric value, pending delta included
    pub fn as_u256(&self) -> Option<U256> {
        self.accumulator().map(Accumulator::current)
    }

    pub fn accumulator(&self) -> Option<&Accumulator> {
        match self {
            Self::Commutative(Commutative::Numeric(acc)) => Some(acc),
            _ => None,
        }
    }

    pub fn members(&self) -> Option<&MemberSet> {
        match self {
            Self::Commutative(Commutative::Set(set)) => Some(set),
            _ => None,
        }
    }

    /// Pending delta of a commutative value.
    pub fn pending_delta(&self) -> Option<Delta> {
        match self {
            Self::Plain(_) => None,
            Self::Commutative(Commutative::Numeric(acc)) => Some(Delta::Numeric(*acc.delta())),
            Self::Commutative(Commutative::Set(set)) => Some(Delta::Set(set.pending().clone())),
        }
    }

    pub fn apply_delta(&mut self, delta: &Delta) -> Result<(), ValueError> {
        match (self, delta) {
            (Self::Commutative(Commutative::Numeric(acc)), Delta::Numeric(d)) => acc.apply(d),
            (Self::Commutative(Commutative::Set(set)), Delta::Set(d)) => {
                set.apply(d);
                Ok(())
            }
            (value, delta) => Err(ValueError::KindMismatch {
                expected: delta.kind(),
                found: value.kind(),
            }),
        }
    }

    pub fn fold(&mut self) {
        match self {
            Self::Plain(_) => {}
            Self::Commutative(Commutative::Numeric(acc)) => acc.fold(),
            Self::Commutative(Commutative::Set(set)) => set.fold(),
        }
    }

    /// Copy with the pending delta committed.
    pub fn folded(&self) -> Self {
        let mut value = self.clone();
        value.fold();
        value
    }

    /// Approximate payload size in bytes.
    pub fn encoded_size(&self) -> usize {
        match self {
            Self::Plain(bytes) => bytes.len(),
            Self::Commutative(Commutative::Numeric(_)) => 32,
            Self::Commutative(Commutative::Set(set)) => set.current().iter().map(String::len).sum(),
        }
    }
}
