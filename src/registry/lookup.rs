//! Key hashing and the key to slot index table

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rustc_hash::{FxBuildHasher, FxHasher};
use std::hash::Hasher;

/// Hash of a resource name
pub type Key = u64;

/// Hash a resource name into its registry key
pub fn hash(name: &str) -> Key {
    let mut hasher = FxHasher::default();
    hasher.write(name.as_bytes());
    hasher.finish()
}

/// Sharded key to slot index map
///
/// Updates for one key are serialised by its shard lock; the registry
/// relies on that to keep slot reuse and key insertion from interleaving.
#[derive(Debug, Default)]
pub(crate) struct Lookup {
    map: DashMap<Key, u32, FxBuildHasher>,
}

impl Lookup {
    pub fn new() -> Self {
        Self {
            map: DashMap::with_hasher(FxBuildHasher),
        }
    }

    pub fn get(&self, key: Key) -> Option<u32> {
        self.map.get(&key).map(|index| *index)
    }

    /// Resolve `key` under its shard lock
    ///
    /// `occupied` gets the mapped index. `vacant` may return an index to
    /// insert along with its result; the insert happens before the lock is
    /// dropped.
    pub fn with_key<R>(
        &self,
        key: Key,
        occupied: impl FnOnce(u32) -> R,
        vacant: impl FnOnce() -> (Option<u32>, R),
    ) -> R {
        match self.map.entry(key) {
            Entry::Occupied(entry) => occupied(*entry.get()),
            Entry::Vacant(entry) => {
                let (index, result) = vacant();
                if let Some(index) = index {
                    entry.insert(index);
                }
                result
            }
        }
    }

    /// Remove `key` if it maps to `index` and `confirm` agrees, all under the
    /// shard lock
    pub fn remove_if(&self, key: Key, index: u32, confirm: impl FnOnce() -> bool) -> bool {
        self.map
            .remove_if(&key, |_, mapped| *mapped == index && confirm())
            .is_some()
    }

    /// Keep only the mappings `keep` accepts; returns how many were dropped
    pub fn retain(&self, mut keep: impl FnMut(Key, u32) -> bool) -> usize {
        let before = self.map.len();
        self.map.retain(|key, index| keep(*key, *index));
        before.saturating_sub(self.map.len())
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Hold `key`'s shard lock until the returned guard drops
    #[cfg(test)]
    pub fn lock_key(&self, key: Key) -> impl Sized + '_ {
        self.map.get_mut(&key)
    }

    pub fn clear(&self) {
        self.map.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_stable() {
        assert_eq!(hash("shaders/blit"), hash("shaders/blit"));
        assert_ne!(hash("shaders/blit"), hash("shaders/blur"));
    }

    #[test]
    fn test_with_key_inserts_on_vacant() {
        let lookup = Lookup::new();
        let key = hash("a");

        let inserted = lookup.with_key(key, |_| false, || (Some(3), true));
        assert!(inserted);
        assert_eq!(lookup.get(key), Some(3));

        let seen = lookup.with_key(key, |index| index, || (None, u32::MAX));
        assert_eq!(seen, 3);

        // A vacant closure that declines leaves no mapping behind
        lookup.with_key(hash("b"), |_| (), || (None, ()));
        assert_eq!(lookup.len(), 1);
    }

    #[test]
    fn test_remove_if_checks_index_and_confirm() {
        let lookup = Lookup::new();
        let key = hash("a");
        lookup.with_key(key, |_| (), || (Some(1), ()));

        assert!(!lookup.remove_if(key, 2, || true));
        assert!(!lookup.remove_if(key, 1, || false));
        assert!(lookup.remove_if(key, 1, || true));
        assert!(lookup.is_empty());
    }

    #[test]
    fn test_retain_counts_dropped() {
        let lookup = Lookup::new();
        for i in 0..10u32 {
            lookup.with_key(u64::from(i), |_| (), || (Some(i), ()));
        }
        assert_eq!(lookup.retain(|_, index| index % 2 == 0), 5);
        assert_eq!(lookup.len(), 5);
        lookup.clear();
        assert!(lookup.is_empty());
    }
}
