//! Collection aliases used throughout the crate.
//!
//! Anything that needs deterministic iteration order -- checkpoint
//! digests, range queries, the KV map itself -- is built on `BTreeMap`
//! rather than a hash map, since hash iteration order is not stable
//! across replicas and would make digests diverge for no protocol reason.

use std::collections::{BTreeMap, BTreeSet};

pub type HashMap<K, V> = std::collections::HashMap<K, V>;
pub type HashSet<T> = std::collections::HashSet<T>;

/// An iteration-order-stable map, used wherever replicas must agree on
/// the order keys are walked (e.g. computing a checkpoint digest).
pub type OrderedMap<K, V> = BTreeMap<K, V>;
pub type OrderedSet<T> = BTreeSet<T>;

pub fn hash_map<K, V>() -> HashMap<K, V> {
    HashMap::new()
}

pub fn hash_map_capacity<K, V>(capacity: usize) -> HashMap<K, V> {
    HashMap::with_capacity(capacity)
}

pub fn hash_set<T>() -> HashSet<T> {
    HashSet::new()
}

pub fn ordered_map<K: Ord, V>() -> OrderedMap<K, V> {
    OrderedMap::new()
}

pub fn ordered_set<T: Ord>() -> OrderedSet<T> {
    OrderedSet::new()
}
