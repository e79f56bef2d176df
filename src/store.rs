//! Keyed storage for mesh elements.
//!
//! Every vertex, edge, face and loop is addressed by an opaque `u64` key
//! handed out by a [`Storage`]. Keys are never reused, so a key held across
//! a topology change either still resolves or cleanly fails to; stale work
//! items are detected by a failed lookup rather than by generation counters.

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;

use ahash::RandomState;

/// Hash state with fixed seeds.
///
/// Iteration order of these maps feeds the scan merge, so the seeds must not
/// vary between runs of the same input.
pub(crate) fn fixed_state() -> RandomState {
    RandomState::with_seeds(
        0x9e37_79b9_7f4a_7c15,
        0x6a09_e667_f3bc_c909,
        0xb7e1_5162_8aed_2a6b,
        0x243f_6a88_85a3_08d3,
    )
}

pub type FixedMap<K, V> = HashMap<K, V, RandomState>;
pub type FixedSet<K> = HashSet<K, RandomState>;

pub(crate) fn new_map<K, V>() -> FixedMap<K, V> {
    HashMap::with_hasher(fixed_state())
}

pub(crate) fn new_set<K>() -> FixedSet<K> {
    HashSet::with_hasher(fixed_state())
}

/// A key that uniquely identifies one element within a mesh.
pub trait ElemKey: Copy + Clone + PartialEq + Eq + Hash + PartialOrd + Ord + Debug {
    /// A key that is guaranteed to never resolve.
    const INVALID: Self;

    fn new(id: u64) -> Self;
    fn raw(self) -> u64;
}

macro_rules! elem_key {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u64);

        impl ElemKey for $name {
            const INVALID: Self = $name(u64::MAX);
            fn new(id: u64) -> Self {
                $name(id)
            }
            fn raw(self) -> u64 {
                self.0
            }
        }
    };
}

elem_key!(
    /// Identifies a vertex.
    VertRef
);
elem_key!(
    /// Identifies an edge.
    EdgeRef
);
elem_key!(
    /// Identifies a face.
    FaceRef
);
elem_key!(
    /// Identifies a loop (a face corner).
    LoopRef
);

/// A storage container for mesh elements.
#[derive(Debug)]
pub struct Storage<K: ElemKey, T> {
    map: FixedMap<K, T>,
    next_id: u64,
}

impl<K: ElemKey, T> Storage<K, T> {
    pub fn new() -> Self {
        Self {
            map: new_map(),
            next_id: 0,
        }
    }

    /// Adds a new element and returns its key.
    pub fn insert(&mut self, value: T) -> K {
        let key = K::new(self.next_id);
        self.next_id += 1;
        self.map.insert(key, value);
        key
    }

    pub fn get(&self, key: K) -> Option<&T> {
        self.map.get(&key)
    }

    pub fn get_mut(&mut self, key: K) -> Option<&mut T> {
        self.map.get_mut(&key)
    }

    pub fn contains(&self, key: K) -> bool {
        self.map.contains_key(&key)
    }

    pub fn remove(&mut self, key: K) -> Option<T> {
        self.map.remove(&key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (K, &T)> {
        self.map.iter().map(|(k, v)| (*k, v))
    }

    /// Keys in creation order. Walks that must be reproducible use this
    /// rather than raw map iteration.
    pub fn keys_sorted(&self) -> Vec<K> {
        let mut keys: Vec<K> = self.map.keys().copied().collect();
        keys.sort();
        keys
    }
}

impl<K: ElemKey, T> Default for Storage<K, T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_never_reused() {
        let mut s: Storage<VertRef, i32> = Storage::new();
        let a = s.insert(1);
        s.remove(a);
        let b = s.insert(2);
        assert_ne!(a, b);
        assert!(s.get(a).is_none());
        assert_eq!(s.get(b), Some(&2));
    }

    #[test]
    fn test_keys_sorted_is_creation_order() {
        let mut s: Storage<EdgeRef, ()> = Storage::new();
        let keys: Vec<_> = (0..16).map(|_| s.insert(())).collect();
        assert_eq!(s.keys_sorted(), keys);
    }
}
