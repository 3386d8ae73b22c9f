//! Cache layer exposed as a `StateView`

use crate::domain::path::ROOT;
use crate::domain::value_objects::TypedValue;
use crate::ports::outbound::StateView;

use super::write_cache::{LayerId, WriteCache};

/// Read-only view of one layer and everything below it.
///
/// Nested generations use it as their parent, so their sequences read
/// through the spawning job's uncommitted writes.
pub struct LayerView<'c, 'p> {
    cache: &'c WriteCache<'p>,
    layer: LayerId,
}

impl<'c, 'p> LayerView<'c, 'p> {
    pub(crate) fn new(cache: &'c WriteCache<'p>, layer: LayerId) -> Self {
        Self { cache, layer }
    }

    pub fn layer(&self) -> LayerId {
        self.layer
    }
}

impl StateView for LayerView<'_, '_> {
    fn retrieve(&self, path: &str) -> Option<TypedValue> {
        // The layer was checked when the view was built and cannot be
        // released while the view borrows the cache.
        self.cache.peek(self.layer, path).ok().flatten()
    }

    fn exists(&self, path: &str) -> bool {
        path == ROOT || self.retrieve(path).is_some()
    }
}
