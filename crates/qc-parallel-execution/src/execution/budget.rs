//! Worker budget shared by nested generations

use parking_lot::Mutex;

/// Upper bound on worker threads in use at once across every generation
/// running under one `ExecutionContext`.
///
/// Reservations never block: a caller gets what is left, possibly nothing,
/// and runs sequentially on its own thread in that case.
#[derive(Debug)]
pub struct ResourceBudget {
    capacity: usize,
    in_use: Mutex<usize>,
}

impl ResourceBudget {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            in_use: Mutex::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_use(&self) -> usize {
        *self.in_use.lock()
    }

    pub fn available(&self) -> usize {
        self.capacity.saturating_sub(self.in_use())
    }

    /// Reserve up to `wanted` workers. Released when the reservation drops.
    pub fn reserve(&self, wanted: usize) -> Reservation<'_> {
        let mut in_use = self.in_use.lock();
        let granted = wanted.min(self.capacity.saturating_sub(*in_use));
        *in_use += granted;
        Reservation {
            budget: self,
            granted,
        }
    }
}

/// Workers held from a `ResourceBudget`.
#[derive(Debug)]
pub struct Reservation<'a> {
    budget: &'a ResourceBudget,
    granted: usize,
}

impl Reservation<'_> {
    pub fn granted(&self) -> usize {
        self.granted
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        let mut in_use = self.budget.in_use.lock();
        *in_use = in_use.saturating_sub(self.granted);
    }
}
