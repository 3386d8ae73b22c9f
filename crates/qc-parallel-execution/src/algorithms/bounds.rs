//! Bounds pass for concurrent deltas
//!
//! Deltas from different sequences to one accumulator commute, so the
//! merged value only depends on their sum. Arbitration keeps a running sum
//! per path and admits each further delta only while the sum stays inside
//! the accumulator bounds.

use crate::domain::value_objects::{Accumulator, NumericDelta};

/// Sum of `deltas`, `None` on overflow.
pub fn combined_delta<'a, I>(deltas: I) -> Option<NumericDelta>
where
    I: IntoIterator<Item = &'a NumericDelta>,
{
    deltas
        .into_iter()
        .try_fold(NumericDelta::zero(), |total, delta| total.checked_add(delta))
}

/// Running total after adding `delta`, or `None` when `acc` no longer
/// admits it.
pub fn extend(
    acc: &Accumulator,
    total: &NumericDelta,
    delta: &NumericDelta,
) -> Option<NumericDelta> {
    combined_delta([total, delta]).filter(|sum| acc.admits(sum))
}
