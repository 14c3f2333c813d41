use std::sync::{Mutex, MutexGuard};

use hashbrown::HashSet;

use crate::cell::CellKey;

/// Thread-safe set of cell keys. Every method is one atomic step on the set.
#[derive(Debug, Default)]
pub struct KeySet {
    inner: Mutex<HashSet<CellKey>>,
}

impl KeySet {
    pub fn new() -> Self {
        Self::default()
    }

    fn guard(&self) -> MutexGuard<'_, HashSet<CellKey>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns `true` when the key was not yet present.
    pub fn insert(&self, key: CellKey) -> bool {
        self.guard().insert(key)
    }

    /// Returns `true` when the key was present.
    pub fn remove(&self, key: CellKey) -> bool {
        self.guard().remove(&key)
    }

    pub fn contains(&self, key: CellKey) -> bool {
        self.guard().contains(&key)
    }

    pub fn len(&self) -> usize {
        self.guard().len()
    }

    pub fn is_empty(&self) -> bool {
        self.guard().is_empty()
    }

    pub fn clear(&self) {
        self.guard().clear();
    }

    pub fn extend(&self, keys: impl IntoIterator<Item = CellKey>) {
        self.guard().extend(keys);
    }

    /// Replaces the whole content in one step.
    pub fn replace(&self, keys: impl IntoIterator<Item = CellKey>) {
        let mut set = self.guard();
        set.clear();
        set.extend(keys);
    }

    pub fn snapshot(&self) -> Vec<CellKey> {
        self.guard().iter().copied().collect()
    }

    /// Empties the set and returns what it held.
    pub fn drain(&self) -> Vec<CellKey> {
        self.guard().drain().collect()
    }

    /// Runs `f` with the set locked, for read-heavy scans that must see one consistent state.
    pub fn with<R>(&self, f: impl FnOnce(&HashSet<CellKey>) -> R) -> R {
        f(&self.guard())
    }
}

impl FromIterator<CellKey> for KeySet {
    fn from_iter<T: IntoIterator<Item = CellKey>>(iter: T) -> Self {
        Self {
            inner: Mutex::new(iter.into_iter().collect()),
        }
    }
}
