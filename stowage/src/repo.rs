use crate::pk::{self, Key};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub const DEFAULT_GROUPS: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
pub struct RepoOptions {
    pub groups: usize,
}

impl Default for RepoOptions {
    fn default() -> Self {
        RepoOptions { groups: DEFAULT_GROUPS }
    }
}

/// Cached state of one key.
pub enum Slot<V> {
    Live(Arc<V>),
    /// Confirmed absent in storage.
    Missing,
}

impl<V> Clone for Slot<V> {
    fn clone(&self) -> Self {
        match self {
            Slot::Live(v) => Slot::Live(Arc::clone(v)),
            Slot::Missing => Slot::Missing,
        }
    }
}

impl<V> Slot<V> {
    pub fn live(self) -> Option<Arc<V>> {
        match self {
            Slot::Live(v) => Some(v),
            Slot::Missing => None,
        }
    }
}

type Group<K, V> = RwLock<HashMap<K, Slot<V>>>;

/// Sharded identity cache: at most one live instance per key.
pub struct Repo<K, V> {
    groups: Vec<Group<K, V>>,
    volatile: bool,
}

impl<K: Key, V> Repo<K, V> {
    /// `groups` is rounded up to a power of two. Volatile repos never cache absence.
    pub fn new(groups: usize, volatile: bool) -> Self {
        assert!(groups > 0, "group count must be > 0");
        let n = groups.next_power_of_two();
        Repo { groups: (0..n).map(|_| RwLock::new(HashMap::new())).collect(), volatile }
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn group_of(&self, key: &K) -> usize {
        pk::group_of(key.hash_group(), self.groups.len())
    }

    fn read(&self, key: &K) -> RwLockReadGuard<'_, HashMap<K, Slot<V>>> {
        self.groups[self.group_of(key)].read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self, key: &K) -> RwLockWriteGuard<'_, HashMap<K, Slot<V>>> {
        self.groups[self.group_of(key)].write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: &K) -> Option<Slot<V>> {
        self.read(key).get(key).cloned()
    }

    pub fn exists(&self, key: &K) -> bool {
        matches!(self.read(key).get(key), Some(Slot::Live(_)))
    }

    /// Publishes a freshly fetched instance. An existing entry wins and is returned instead;
    /// `on_first_insert` runs only when `obj` becomes the cached instance.
    pub fn set_on_fetch<F>(&self, key: K, obj: Option<Arc<V>>, on_first_insert: F) -> Option<Arc<V>>
    where
        F: FnOnce(&Arc<V>),
    {
        let mut group = self.write(&key);
        if let Some(existing) = group.get(&key) {
            return existing.clone().live();
        }
        match obj {
            Some(obj) => {
                group.insert(key, Slot::Live(Arc::clone(&obj)));
                on_first_insert(&obj);
                Some(obj)
            }
            None => {
                if !self.volatile {
                    group.insert(key, Slot::Missing);
                }
                None
            }
        }
    }

    /// Caches `obj` under `key` unless a different live instance holds it.
    pub fn set_on_store(&self, key: K, obj: &Arc<V>) -> bool {
        let mut group = self.write(&key);
        match group.get(&key) {
            Some(Slot::Live(existing)) => Arc::ptr_eq(existing, obj),
            _ => {
                group.insert(key, Slot::Live(Arc::clone(obj)));
                true
            }
        }
    }

    /// Replaces the cached instance by an absence marker, if `obj` is the cached instance.
    pub fn set_on_delete(&self, key: &K, obj: &Arc<V>) -> bool {
        let mut group = self.write(key);
        let cached = matches!(group.get(key), Some(Slot::Live(existing)) if Arc::ptr_eq(existing, obj));
        if !cached {
            return false;
        }
        if self.volatile {
            group.remove(key);
        } else {
            group.insert(key.clone(), Slot::Missing);
        }
        true
    }

    /// Drops whatever is cached for `key`.
    pub fn expire(&self, key: &K) -> Option<Arc<V>> {
        self.write(key).remove(key).and_then(Slot::live)
    }

    /// Live instances whose key `prefix` is a prefix of.
    pub fn get_all(&self, prefix: &K) -> Vec<Arc<V>> {
        self.read(prefix)
            .iter()
            .filter(|(k, _)| prefix.prefix_of(k))
            .filter_map(|(_, slot)| slot.clone().live())
            .collect()
    }

    /// Splits `keys` into cached instances and keys to fetch. Keys cached as absent are in neither.
    pub fn get_multi(&self, keys: &[K]) -> (Vec<Arc<V>>, Vec<K>) {
        let mut cached = Vec::with_capacity(keys.len());
        let mut uncached = Vec::new();
        for key in keys {
            match self.get(key) {
                Some(Slot::Live(v)) => cached.push(v),
                Some(Slot::Missing) => {}
                None => uncached.push(key.clone()),
            }
        }
        (cached, uncached)
    }

    pub fn len(&self) -> usize {
        self.groups
            .iter()
            .map(|g| g.read().unwrap_or_else(PoisonError::into_inner).values().filter(|s| matches!(s, Slot::Live(_))).count())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
