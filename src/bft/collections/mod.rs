//! Collection type aliases used throughout the crate.
//!
//! `HashMap`/`HashSet` use a faster, non-cryptographic hasher
//! (`twox-hash`) than the standard library's default, since none of
//! this crate's maps are keyed by attacker-controlled strings -- only
//! `NodeId`s, `SeqNo`s and `Digest`s, which are already the output of
//! a cryptographic hash or a small bounded integer.

use std::collections::{HashMap as StdHashMap, HashSet as StdHashSet};

#[cfg(feature = "collections_randomstate_twox_hash")]
type RandomState = std::hash::BuildHasherDefault<twox_hash::XxHash64>;

#[cfg(feature = "collections_randomstate_std")]
type RandomState = std::collections::hash_map::RandomState;

/// A `HashMap`, using this crate's chosen hasher.
pub type HashMap<K, V> = StdHashMap<K, V, RandomState>;

/// A `HashSet`, using this crate's chosen hasher.
pub type HashSet<K> = StdHashSet<K, RandomState>;

/// An insertion-ordered map, used where iteration order must match
/// the order slots were first observed (e.g. `PC_Set` per sequence
/// number).
pub type OrderedMap<K, V> = linked_hash_map::LinkedHashMap<K, V>;

/// Returns a new, empty `HashMap`.
pub fn hash_map<K, V>() -> HashMap<K, V> {
    HashMap::default()
}

/// Returns a new, empty `HashMap`, with the given initial capacity.
pub fn hash_map_capacity<K, V>(capacity: usize) -> HashMap<K, V> {
    HashMap::with_capacity_and_hasher(capacity, RandomState::default())
}

/// Returns a new, empty `HashSet`.
pub fn hash_set<K>() -> HashSet<K> {
    HashSet::default()
}

/// Returns a new, empty `OrderedMap`.
pub fn ordered_map<K, V>() -> OrderedMap<K, V> {
    OrderedMap::new()
}
