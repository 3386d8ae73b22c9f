//! Layered write cache
//!
//! Layers live in an arena and refer to their parent by `LayerId`. Reads
//! walk the chain of parents down to the backing `StateView`; writes stay in
//! the layer they were made in until the owner merges them elsewhere.

use std::collections::{BTreeMap, BTreeSet};
use tracing::trace;

use crate::domain::errors::CacheError;
use crate::domain::path::{self, Path, ROOT};
use crate::domain::value_objects::{
    Commutative, Delta, SetDelta, TxIndex, TypedValue, SYSTEM_WRITER,
};
use crate::domain::versioned::{sort_by_access, sort_for_merge, VersionedValue};
use crate::ports::outbound::StateView;

use super::view::LayerView;

/// Handle of a cache layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LayerId(usize);

impl LayerId {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Selects which entries `export` returns.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExportFilter {
    pub include_reads: bool,
    pub prefix: Option<Path>,
}

impl ExportFilter {
    /// State-changing entries only
    pub fn transitions() -> Self {
        Self::default()
    }

    /// State-changing entries plus pure reads
    pub fn accesses() -> Self {
        Self {
            include_reads: true,
            prefix: None,
        }
    }

    /// Restrict to `prefix` and everything beneath it
    pub fn under(mut self, prefix: impl Into<Path>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    fn admits(&self, entry: &VersionedValue) -> bool {
        if let Some(prefix) = &self.prefix {
            if !entry.path.starts_with(prefix.as_str()) {
                return false;
            }
        }
        if entry.is_read_only() {
            return self.include_reads && entry.reads > 0;
        }
        true
    }
}

#[derive(Debug, Default)]
struct Layer {
    parent: Option<LayerId>,
    entries: BTreeMap<Path, VersionedValue>,
    children: usize,
}

/// Cascading versioned cache over a read-only `StateView`.
pub struct WriteCache<'p> {
    store: &'p dyn StateView,
    layers: Vec<Option<Layer>>,
    free: Vec<usize>,
}

impl<'p> WriteCache<'p> {
    /// Cache with a single root layer over `store`.
    pub fn new(store: &'p dyn StateView) -> Self {
        Self {
            store,
            layers: vec![Some(Layer::default())],
            free: Vec::new(),
        }
    }

    /// Root layer, never released
    pub fn root(&self) -> LayerId {
        LayerId(0)
    }

    /// Number of live layers
    pub fn depth(&self) -> usize {
        self.layers.iter().filter(|slot| slot.is_some()).count()
    }

    /// New empty layer reading through `parent`.
    pub fn derive(&mut self, parent: LayerId) -> Result<LayerId, CacheError> {
        self.layer_mut(parent)?.children += 1;
        let layer = Layer {
            parent: Some(parent),
            ..Layer::default()
        };
        let id = match self.free.pop() {
            Some(slot) => {
                self.layers[slot] = Some(layer);
                slot
            }
            None => {
                self.layers.push(Some(layer));
                self.layers.len() - 1
            }
        };
        Ok(LayerId(id))
    }

    /// Drop `layer` and everything written in it.
    pub fn release(&mut self, layer: LayerId) -> Result<(), CacheError> {
        let current = self.layer(layer)?;
        if current.children > 0 {
            return Err(CacheError::LayerInUse {
                layer: layer.0,
                children: current.children,
            });
        }
        let Some(parent) = current.parent else {
            return Err(CacheError::InvariantViolation(
                "root layer cannot be released".to_string(),
            ));
        };
        self.layers[layer.0] = None;
        self.free.push(layer.0);
        let parent = self.layer_mut(parent)?;
        parent.children = parent.children.saturating_sub(1);
        Ok(())
    }

    /// Merge every access of `layer` into its parent, then release it.
    pub fn fold(&mut self, layer: LayerId) -> Result<(), CacheError> {
        let parent = self.layer(layer)?.parent.ok_or_else(|| {
            CacheError::InvariantViolation("root layer cannot be folded".to_string())
        })?;
        let entries = self.export(layer, &ExportFilter::accesses())?;
        self.merge(parent, entries)?;
        self.release(layer)
    }

    /// Read-only view of `layer` usable as a `StateView`.
    pub fn view(&self, layer: LayerId) -> Result<LayerView<'_, 'p>, CacheError> {
        self.layer(layer)?;
        Ok(LayerView::new(self, layer))
    }

    // =========================================================================
    // ACCESS
    // =========================================================================

    /// Current value at `path`, counting a read in `layer`.
    pub fn read(
        &mut self,
        layer: LayerId,
        writer: TxIndex,
        path: &str,
    ) -> Result<Option<TypedValue>, CacheError> {
        let entry = self.materialize(layer, writer, path)?;
        entry.reads = entry.reads.saturating_add(1);
        Ok(entry.value.clone())
    }

    /// Current value at `path` without counting an access.
    pub fn peek(&self, layer: LayerId, path: &str) -> Result<Option<TypedValue>, CacheError> {
        let mut cursor = Some(layer);
        while let Some(id) = cursor {
            let current = self.layer(id)?;
            if let Some(entry) = current.entries.get(path) {
                return Ok(entry.value.clone());
            }
            cursor = current.parent;
        }
        Ok(self.store.retrieve(path))
    }

    /// Whether a non-deleted value at `path` is visible from `layer`.
    pub fn exists(&self, layer: LayerId, path: &str) -> Result<bool, CacheError> {
        if path == ROOT {
            return Ok(true);
        }
        Ok(self.peek(layer, path)?.is_some())
    }

    /// Absolute write; `None` deletes. Returns the bytes written.
    ///
    /// Deleting or overwriting a container deletes the elements that are no
    /// longer members.
    pub fn write(
        &mut self,
        layer: LayerId,
        writer: TxIndex,
        path: &str,
        value: Option<TypedValue>,
    ) -> Result<usize, CacheError> {
        self.check_parent(layer, writer, path)?;
        if path::is_container(path) {
            if let Some(value) = &value {
                if value.members().is_none() {
                    return Err(CacheError::TypeMismatch {
                        path: path.to_string(),
                        reason: format!("container requires a set, got {}", value.kind()),
                    });
                }
            }
        }

        let previous = self.materialize(layer, writer, path)?.value.clone();

        let old_members = previous
            .as_ref()
            .and_then(TypedValue::members)
            .filter(|_| path::is_container(path));
        if let Some(old) = old_members {
            let keep = value
                .as_ref()
                .and_then(TypedValue::members)
                .map(|set| set.current())
                .unwrap_or_default();
            let dropped: Vec<String> = old.current().difference(&keep).cloned().collect();
            for key in dropped {
                self.write(layer, writer, &path::child(path, &key), None)?;
            }
        }

        let size = value.as_ref().map_or(0, TypedValue::encoded_size);
        let exists_now = value.is_some();
        {
            let entry = self.entry_mut(layer, path)?;
            entry.value = value.map(|v| v.folded());
            entry.writes = entry.writes.saturating_add(1);
        }
        if previous.is_some() != exists_now {
            self.update_membership(layer, writer, path, exists_now)?;
        }
        trace!(path, writer, size, "cache write");
        Ok(size)
    }

    /// Commutative write. Fails with `BoundsViolation` when the accumulated
    /// delta leaves the value's bounds; the entry is left untouched then.
    pub fn write_delta(
        &mut self,
        layer: LayerId,
        writer: TxIndex,
        path: &str,
        delta: Delta,
    ) -> Result<usize, CacheError> {
        self.check_parent(layer, writer, path)?;
        if path::is_container(path) && !matches!(delta, Delta::Set(_)) {
            return Err(CacheError::TypeMismatch {
                path: path.to_string(),
                reason: "container accepts set deltas only".to_string(),
            });
        }
        let created = self.apply_delta(layer, writer, path, &delta)?;
        if created {
            self.update_membership(layer, writer, path, true)?;
        }
        Ok(delta.encoded_size())
    }

    // =========================================================================
    // EXPORT / MERGE
    // =========================================================================

    /// Entries touched in `layer`, sorted by access key.
    pub fn export(
        &self,
        layer: LayerId,
        filter: &ExportFilter,
    ) -> Result<Vec<VersionedValue>, CacheError> {
        let mut entries: Vec<VersionedValue> = self
            .layer(layer)?
            .entries
            .values()
            .filter(|entry| filter.admits(entry))
            .cloned()
            .collect();
        sort_by_access(&mut entries);
        Ok(entries)
    }

    /// Fold `entries` into `layer`: containers first, then elements.
    ///
    /// All or nothing: on error the layer is unchanged.
    pub fn merge<I>(&mut self, layer: LayerId, entries: I) -> Result<(), CacheError>
    where
        I: IntoIterator<Item = VersionedValue>,
    {
        let mut incoming: Vec<VersionedValue> = entries.into_iter().collect();
        sort_for_merge(&mut incoming);

        let parent = self.layer(layer)?.parent;
        let mut staged: BTreeMap<Path, VersionedValue> = BTreeMap::new();
        for entry in incoming {
            let mut merged = match staged.remove(&entry.path) {
                Some(pending) => pending,
                None => match self.layer(layer)?.entries.get(&entry.path) {
                    Some(local) => local.clone(),
                    None => {
                        let below = self.visible_below(parent, &entry.path)?;
                        VersionedValue::new(entry.origin, entry.path.clone(), below)
                    }
                },
            };
            merged
                .absorb(&entry)
                .map_err(|err| CacheError::at(&entry.path, err))?;
            staged.insert(entry.path, merged);
        }

        self.layer_mut(layer)?.entries.extend(staged);
        Ok(())
    }

    // =========================================================================
    // INTERNALS
    // =========================================================================

    fn layer(&self, id: LayerId) -> Result<&Layer, CacheError> {
        self.layers
            .get(id.0)
            .and_then(Option::as_ref)
            .ok_or(CacheError::UnknownLayer(id.0))
    }

    fn layer_mut(&mut self, id: LayerId) -> Result<&mut Layer, CacheError> {
        self.layers
            .get_mut(id.0)
            .and_then(Option::as_mut)
            .ok_or(CacheError::UnknownLayer(id.0))
    }

    fn entry_mut(&mut self, layer: LayerId, path: &str) -> Result<&mut VersionedValue, CacheError> {
        self.layer_mut(layer)?
            .entries
            .get_mut(path)
            .ok_or_else(|| CacheError::InvariantViolation(format!("{path} not materialized")))
    }

    /// Folded value visible from `from`, or the store when `from` is `None`.
    fn visible_below(
        &self,
        from: Option<LayerId>,
        path: &str,
    ) -> Result<Option<TypedValue>, CacheError> {
        let value = match from {
            Some(id) => self.peek(id, path)?,
            None => self.store.retrieve(path),
        };
        Ok(value.map(|v| v.folded()))
    }

    /// Local entry for `path`, created from the value visible below.
    fn materialize(
        &mut self,
        layer: LayerId,
        writer: TxIndex,
        path: &str,
    ) -> Result<&mut VersionedValue, CacheError> {
        let current = self.layer(layer)?;
        if !current.entries.contains_key(path) {
            let below = self.visible_below(current.parent, path)?;
            self.layer_mut(layer)?
                .entries
                .insert(path.to_string(), VersionedValue::new(writer, path, below));
        }
        self.entry_mut(layer, path)
    }

    fn check_parent(&self, layer: LayerId, writer: TxIndex, path: &str) -> Result<(), CacheError> {
        if writer == SYSTEM_WRITER {
            return Ok(());
        }
        let Some(container) = path::parent_of(path) else {
            return Ok(());
        };
        if self.exists(layer, container)? {
            Ok(())
        } else {
            Err(CacheError::ParentPathMissing {
                path: path.to_string(),
            })
        }
    }

    /// Apply `delta` at `path`; returns whether the value was created.
    fn apply_delta(
        &mut self,
        layer: LayerId,
        writer: TxIndex,
        path: &str,
        delta: &Delta,
    ) -> Result<bool, CacheError> {
        let entry = self.materialize(layer, writer, path)?;
        let created = entry.value.is_none();
        let mut value = entry
            .value
            .clone()
            .unwrap_or_else(|| TypedValue::from_delta(delta));
        value
            .apply_delta(delta)
            .map_err(|err| CacheError::at(path, err))?;
        entry.value = Some(value);
        entry.delta_writes = entry.delta_writes.saturating_add(1);
        Ok(created)
    }

    /// Record `path` joining or leaving its container's member set.
    fn update_membership(
        &mut self,
        layer: LayerId,
        writer: TxIndex,
        path: &str,
        added: bool,
    ) -> Result<(), CacheError> {
        let (Some(container), Some(key)) = (path::parent_of(path), path::element_key(path)) else {
            return Ok(());
        };
        if container == ROOT {
            return Ok(());
        }
        let delta = Delta::Set(if added {
            SetDelta::insert(key)
        } else {
            SetDelta::remove(key)
        });
        let container = container.to_string();
        let created = self.apply_delta(layer, writer, &container, &delta)?;
        if created {
            self.update_membership(layer, writer, &container, true)?;
        }
        Ok(())
    }

    /// Members of the container at `path` visible from `layer`.
    pub fn members(&self, layer: LayerId, path: &str) -> Result<BTreeSet<String>, CacheError> {
        Ok(match self.peek(layer, path)? {
            Some(TypedValue::Commutative(Commutative::Set(set))) => set.current(),
            _ => BTreeSet::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::value_objects::{MemberSet, NumericDelta};
    use crate::ports::outbound::mocks::MockStateView;
    use primitive_types::U256;

    const TX: TxIndex = 7;

    fn store() -> MockStateView {
        MockStateView::default()
            .with("/accounts/", TypedValue::container())
            .with(
                "/pool/",
                TypedValue::Commutative(Commutative::Set(MemberSet::from_members(["reserve"]))),
            )
            .with(
                "/pool/reserve",
                TypedValue::bounded(U256::from(10), U256::zero(), U256::from(100)).unwrap(),
            )
    }

    fn u(v: u64) -> U256 {
        U256::from(v)
    }

    #[test]
    fn test_read_counts_and_falls_through() {
        let store = store();
        let mut cache = WriteCache::new(&store);
        let root = cache.root();

        let value = cache.read(root, TX, "/pool/reserve").unwrap();
        assert_eq!(value.and_then(|v| v.as_u256()), Some(u(10)));

        let exported = cache.export(root, &ExportFilter::accesses()).unwrap();
        assert_eq!(exported.len(), 1);
        assert_eq!(exported[0].reads, 1);
        assert!(exported[0].preexisting);
        assert!(cache.export(root, &ExportFilter::transitions()).unwrap().is_empty());
    }

    #[test]
    fn test_peek_does_not_materialize() {
        let store = store();
        let cache = WriteCache::new(&store);
        assert!(cache.peek(cache.root(), "/pool/reserve").unwrap().is_some());
        assert!(cache.export(cache.root(), &ExportFilter::accesses()).unwrap().is_empty());
    }

    #[test]
    fn test_write_requires_parent() {
        let store = store();
        let mut cache = WriteCache::new(&store);
        let root = cache.root();
        let err = cache
            .write(root, TX, "/missing/item", Some(TypedValue::plain(vec![1])))
            .unwrap_err();
        assert_eq!(
            err,
            CacheError::ParentPathMissing {
                path: "/missing/item".to_string()
            }
        );

        // The system writer creates the container on the fly.
        cache
            .write(root, SYSTEM_WRITER, "/missing/item", Some(TypedValue::plain(vec![1])))
            .unwrap();
        assert!(cache.exists(root, "/missing/").unwrap());
        assert!(cache.members(root, "/missing/").unwrap().contains("item"));
    }

    #[test]
    fn test_element_write_updates_membership() {
        let store = store();
        let mut cache = WriteCache::new(&store);
        let root = cache.root();
        cache
            .write(root, TX, "/pool/fee", Some(TypedValue::plain(vec![3])))
            .unwrap();

        let container = cache.export(root, &ExportFilter::transitions().under("/pool/")).unwrap();
        let entry = container.iter().find(|e| e.path == "/pool/").unwrap();
        assert!(entry.is_delta_only());
        assert!(cache.members(root, "/pool/").unwrap().contains("fee"));

        // Overwriting an existing element leaves membership alone.
        cache
            .write(root, TX, "/pool/fee", Some(TypedValue::plain(vec![4])))
            .unwrap();
        let entry = cache
            .export(root, &ExportFilter::transitions())
            .unwrap()
            .into_iter()
            .find(|e| e.path == "/pool/")
            .unwrap();
        assert_eq!(entry.delta_writes, 1);
    }

    #[test]
    fn test_container_delete_cascades() {
        let store = store()
            .with(
                "/registry/",
                TypedValue::Commutative(Commutative::Set(MemberSet::from_members(["a", "b"]))),
            )
            .with("/registry/a", TypedValue::plain(vec![1]))
            .with("/registry/b", TypedValue::plain(vec![2]));
        let mut cache = WriteCache::new(&store);
        let root = cache.root();

        cache.write(root, TX, "/registry/", None).unwrap();

        assert!(!cache.exists(root, "/registry/").unwrap());
        assert!(!cache.exists(root, "/registry/a").unwrap());
        assert!(!cache.exists(root, "/registry/b").unwrap());
        let deleted: Vec<_> = cache
            .export(root, &ExportFilter::transitions())
            .unwrap()
            .into_iter()
            .filter(|e| e.is_absolute() && e.value.is_none())
            .map(|e| e.path)
            .collect();
        assert_eq!(deleted, vec!["/registry/", "/registry/a", "/registry/b"]);
    }

    #[test]
    fn test_container_rejects_plain_value() {
        let store = store();
        let mut cache = WriteCache::new(&store);
        let root = cache.root();
        assert!(matches!(
            cache.write(root, TX, "/pool/", Some(TypedValue::plain(vec![]))),
            Err(CacheError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_delta_bounds_checked_at_write() {
        let store = store();
        let mut cache = WriteCache::new(&store);
        let root = cache.root();
        cache
            .write_delta(root, TX, "/pool/reserve", Delta::credit(u(80)))
            .unwrap();
        let err = cache
            .write_delta(root, TX, "/pool/reserve", Delta::credit(u(20)))
            .unwrap_err();
        assert!(matches!(err, CacheError::BoundsViolation { .. }));
        let value = cache.peek(root, "/pool/reserve").unwrap().unwrap();
        assert_eq!(value.as_u256(), Some(u(90)));
    }

    #[test]
    fn test_child_writes_invisible_to_parent() {
        let store = store();
        let mut cache = WriteCache::new(&store);
        let root = cache.root();
        let child = cache.derive(root).unwrap();

        cache
            .write(child, TX, "/pool/new", Some(TypedValue::plain(vec![9])))
            .unwrap();
        assert!(cache.exists(child, "/pool/new").unwrap());
        assert!(!cache.exists(root, "/pool/new").unwrap());
        assert!(cache.read(root, TX, "/pool/new").unwrap().is_none());

        let entries = cache.export(child, &ExportFilter::transitions()).unwrap();
        cache.merge(root, entries).unwrap();
        assert!(cache.exists(root, "/pool/new").unwrap());
    }

    #[test]
    fn test_child_sees_parent_writes() {
        let store = store();
        let mut cache = WriteCache::new(&store);
        let root = cache.root();
        cache
            .write_delta(root, TX, "/pool/reserve", Delta::credit(u(5)))
            .unwrap();
        let child = cache.derive(root).unwrap();
        let seen = cache.read(child, TX, "/pool/reserve").unwrap().unwrap();
        assert_eq!(seen.as_u256(), Some(u(15)));
        // The child base is folded, so its own export carries no delta.
        assert_eq!(seen.accumulator().map(|a| *a.delta()), Some(NumericDelta::zero()));
    }

    #[test]
    fn test_merge_accumulates_deltas() {
        let store = store();
        let mut cache = WriteCache::new(&store);
        let root = cache.root();
        for amount in [5u64, 7] {
            let child = cache.derive(root).unwrap();
            cache
                .write_delta(child, TX, "/pool/reserve", Delta::credit(u(amount)))
                .unwrap();
            cache.fold(child).unwrap();
        }
        let value = cache.peek(root, "/pool/reserve").unwrap().unwrap();
        assert_eq!(value.as_u256(), Some(u(22)));
        let entry = &cache.export(root, &ExportFilter::transitions()).unwrap()[0];
        assert_eq!(entry.delta_writes, 2);
        assert!(entry.is_delta_only());
    }

    #[test]
    fn test_merge_is_atomic() {
        let store = store();
        let mut cache = WriteCache::new(&store);
        let root = cache.root();

        let mut good = VersionedValue::new(TX, "/pool/a", Some(TypedValue::plain(vec![1])));
        good.writes = 1;
        let mut bad = VersionedValue::new(TX, "/pool/reserve", Some(
            TypedValue::bounded(u(10), u(0), u(100)).unwrap(),
        ));
        if let Some(TypedValue::Commutative(Commutative::Numeric(acc))) = bad.value.as_mut() {
            acc.replace_delta(NumericDelta::credit(u(500)));
        }
        bad.delta_writes = 1;

        assert!(cache.merge(root, vec![good, bad]).is_err());
        assert!(cache.export(root, &ExportFilter::accesses()).unwrap().is_empty());
    }

    #[test]
    fn test_release_and_slot_reuse() {
        let store = store();
        let mut cache = WriteCache::new(&store);
        let root = cache.root();
        let child = cache.derive(root).unwrap();
        let grandchild = cache.derive(child).unwrap();

        assert!(matches!(cache.release(child), Err(CacheError::LayerInUse { .. })));
        cache.release(grandchild).unwrap();
        cache.release(child).unwrap();
        assert_eq!(cache.depth(), 1);
        assert!(matches!(
            cache.read(child, TX, "/pool/reserve"),
            Err(CacheError::UnknownLayer(_))
        ));

        let reused = cache.derive(root).unwrap();
        assert!(reused == child || reused == grandchild);
        assert!(cache.release(root).is_err());
    }

    #[test]
    fn test_delete_then_recreate_element() {
        let store = store();
        let mut cache = WriteCache::new(&store);
        let root = cache.root();
        cache.write(root, TX, "/pool/reserve", None).unwrap();
        assert!(!cache.members(root, "/pool/").unwrap().contains("reserve"));
        cache
            .write_delta(root, TX, "/pool/reserve", Delta::credit(u(3)))
            .unwrap();
        let value = cache.peek(root, "/pool/reserve").unwrap().unwrap();
        assert_eq!(value.as_u256(), Some(u(3)));
    }
}
