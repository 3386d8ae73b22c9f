//! In-memory backing store
//!
//! Serves as the parent state of top-level generations and as the commit
//! sink their cleared transitions land in.

use parking_lot::RwLock;
use primitive_types::U256;
use std::collections::BTreeMap;
use tracing::debug;

use crate::cache::{ExportFilter, LayerId, WriteCache};
use crate::domain::errors::{CacheError, CommitError};
use crate::domain::path::{self, Path};
use crate::domain::value_objects::{Address, TypedValue, SYSTEM_WRITER};
use crate::domain::versioned::{sort_for_merge, VersionedValue};
use crate::ports::outbound::{CommitKey, CommitSink, StateView};

/// Path/value table behind a lock.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    values: RwLock<BTreeMap<Path, TypedValue>>,
    commits: RwLock<Vec<CommitKey>>,
}

impl InMemoryStore {
    /// Store holding the empty `/accounts/` container.
    pub fn new() -> Self {
        let store = Self::default();
        store
            .values
            .write()
            .insert(path::AccountPath::ACCOUNTS.to_string(), TypedValue::container());
        store
    }

    pub fn value(&self, path: &str) -> Option<TypedValue> {
        self.values.read().get(path).cloned()
    }

    /// Numeric value at `path`, zero when absent.
    pub fn number(&self, path: &str) -> U256 {
        self.value(path).and_then(|v| v.as_u256()).unwrap_or_default()
    }

    pub fn balance(&self, address: &Address) -> U256 {
        self.number(&path::balance(address))
    }

    pub fn nonce(&self, address: &Address) -> U256 {
        self.number(&path::nonce(address))
    }

    pub fn len(&self) -> usize {
        self.values.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.read().is_empty()
    }

    /// Copy of every stored value.
    pub fn snapshot(&self) -> BTreeMap<Path, TypedValue> {
        self.values.read().clone()
    }

    /// Keys of the commits applied so far, in order.
    pub fn commits(&self) -> Vec<CommitKey> {
        self.commits.read().clone()
    }

    /// Create an empty container at `path` unless one exists.
    pub fn create_container(&self, container: &str) -> Result<(), CacheError> {
        if self.exists(container) {
            return Ok(());
        }
        self.system_write(|cache, root| {
            cache.write(root, SYSTEM_WRITER, container, Some(TypedValue::container()))?;
            Ok(())
        })
    }

    /// Store `value` at `path`, creating the owning container if needed.
    pub fn insert(&self, path: &str, value: TypedValue) -> Result<(), CacheError> {
        if let Some(parent) = path::parent_of(path) {
            if parent != path::ROOT {
                self.create_container(parent)?;
            }
        }
        self.system_write(|cache, root| {
            cache.write(root, SYSTEM_WRITER, path, Some(value))?;
            Ok(())
        })
    }

    /// Create the account container of `address` with `balance`, a zero
    /// nonce and empty storage.
    pub fn fund_account(&self, address: &Address, balance: U256) -> Result<(), CacheError> {
        self.system_write(|cache, root| {
            let account = path::account(address);
            if !cache.exists(root, &account)? {
                cache.write(root, SYSTEM_WRITER, &account, Some(TypedValue::container()))?;
                cache.write(
                    root,
                    SYSTEM_WRITER,
                    &path::nonce(address),
                    Some(TypedValue::numeric(U256::zero())),
                )?;
                cache.write(
                    root,
                    SYSTEM_WRITER,
                    &path::storage(address),
                    Some(TypedValue::container()),
                )?;
            }
            cache.write(
                root,
                SYSTEM_WRITER,
                &path::balance(address),
                Some(TypedValue::numeric(balance)),
            )?;
            Ok(())
        })
    }

    /// Run bookkeeping writes through a cache so container membership is
    /// maintained, then apply them.
    fn system_write<F>(&self, f: F) -> Result<(), CacheError>
    where
        F: FnOnce(&mut WriteCache<'_>, LayerId) -> Result<(), CacheError>,
    {
        let transitions = {
            let mut cache = WriteCache::new(self);
            let root = cache.root();
            f(&mut cache, root)?;
            cache.export(root, &ExportFilter::transitions())?
        };
        self.apply(transitions)
            .map_err(|err| CacheError::InvariantViolation(err.to_string()))
    }

    /// Resolve every transition against stored values, then swap them in.
    fn apply(&self, mut transitions: Vec<VersionedValue>) -> Result<(), CommitError> {
        sort_for_merge(&mut transitions);
        let mut values = self.values.write();
        let mut staged: BTreeMap<Path, Option<TypedValue>> = BTreeMap::new();
        for transition in transitions.iter().filter(|t| t.is_transition()) {
            let existing = match staged.get(&transition.path) {
                Some(value) => value.clone(),
                None => values.get(&transition.path).cloned(),
            };
            let resolved = transition
                .resolve_onto(existing.as_ref())
                .map_err(|err| CommitError::Rejected {
                    path: transition.path.clone(),
                    reason: err.to_string(),
                })?;
            staged.insert(transition.path.clone(), resolved);
        }
        for (path, value) in staged {
            match value {
                Some(value) => values.insert(path, value),
                None => values.remove(&path),
            };
        }
        Ok(())
    }
}

impl StateView for InMemoryStore {
    fn retrieve(&self, path: &str) -> Option<TypedValue> {
        self.value(path)
    }

    fn exists(&self, path: &str) -> bool {
        path == path::ROOT || self.values.read().contains_key(path)
    }
}

impl CommitSink for InMemoryStore {
    fn commit(&self, key: CommitKey, transitions: &[VersionedValue]) -> Result<(), CommitError> {
        self.apply(transitions.to_vec())?;
        self.commits.write().push(key);
        debug!(
            block = key.block,
            generation = key.generation,
            transitions = transitions.len(),
            "Transitions committed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::value_objects::{Delta, NumericDelta};

    fn addr(v: u64) -> Address {
        Address::from_low_u64_be(v)
    }

    fn delta_transition(path: &str, base: u64, delta: NumericDelta) -> VersionedValue {
        let mut value = TypedValue::numeric(U256::from(base));
        value.apply_delta(&Delta::Numeric(delta)).unwrap();
        let mut entry = VersionedValue::new(1, path, Some(value));
        entry.delta_writes = 1;
        entry
    }

    #[test]
    fn test_fund_account_creates_layout() {
        let store = InMemoryStore::new();
        store.fund_account(&addr(1), U256::from(500)).unwrap();

        assert_eq!(store.balance(&addr(1)), U256::from(500));
        assert_eq!(store.nonce(&addr(1)), U256::zero());
        assert!(store.exists(&path::storage(&addr(1))));

        let accounts = store.value(path::AccountPath::ACCOUNTS).unwrap();
        let key = path::element_key(&path::account(&addr(1))).unwrap().to_string();
        assert!(accounts.members().unwrap().contains(&key));

        let account = store.value(&path::account(&addr(1))).unwrap();
        assert_eq!(account.members().unwrap().len(), 3);
    }

    #[test]
    fn test_fund_account_twice_updates_balance() {
        let store = InMemoryStore::new();
        store.fund_account(&addr(1), U256::from(5)).unwrap();
        store.fund_account(&addr(1), U256::from(9)).unwrap();
        assert_eq!(store.balance(&addr(1)), U256::from(9));
    }

    #[test]
    fn test_insert_creates_container() {
        let store = InMemoryStore::new();
        store.insert("/pool/reserve", TypedValue::numeric(U256::from(3))).unwrap();
        assert!(store.exists("/pool/"));
        assert_eq!(store.number("/pool/reserve"), U256::from(3));
    }

    #[test]
    fn test_commit_applies_deltas_onto_stored_value() {
        let store = InMemoryStore::new();
        store.insert("/pool/reserve", TypedValue::numeric(U256::from(10))).unwrap();

        // Bases seen by the writers differ from the stored value; only the
        // deltas count.
        let transitions = vec![
            delta_transition("/pool/reserve", 0, NumericDelta::credit(U256::from(5))),
            delta_transition("/pool/reserve", 7, NumericDelta::debit(U256::from(2))),
        ];
        store
            .commit(CommitKey { block: 1, generation: 0 }, &transitions)
            .unwrap();
        assert_eq!(store.number("/pool/reserve"), U256::from(13));
        assert_eq!(store.commits(), vec![CommitKey { block: 1, generation: 0 }]);
    }

    #[test]
    fn test_rejected_commit_changes_nothing() {
        let store = InMemoryStore::new();
        store.insert("/pool/reserve", TypedValue::numeric(U256::from(1))).unwrap();
        let before = store.snapshot();

        let mut deleted = VersionedValue::new(1, "/pool/other", None);
        deleted.writes = 1;
        let transitions = vec![
            deleted,
            delta_transition("/pool/reserve", 1, NumericDelta::debit(U256::from(1))),
            delta_transition("/pool/reserve", 1, NumericDelta::debit(U256::from(1))),
        ];
        let err = store
            .commit(CommitKey { block: 1, generation: 0 }, &transitions)
            .unwrap_err();
        assert!(matches!(err, CommitError::Rejected { ref path, .. } if path == "/pool/reserve"));
        assert_eq!(store.snapshot(), before);
        assert!(store.commits().is_empty());
    }
}
