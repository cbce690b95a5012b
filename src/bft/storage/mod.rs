//! Versioned key-value storage engine.
//!
//! Two disjoint interfaces share one backend: a plain `set`/`get` pair for
//! values with no optimistic-concurrency requirements, and a versioned
//! pair (`set_with_version`/`get_with_version`) that appends to a
//! per-key history and enforces monotonic version numbers. A key used
//! through one interface must never be touched through the other --
//! [`ErrorKind::VersionedKeyExists`] and [`ErrorKind::NonVersionedKeyExists`]
//! guard the boundary.
//!
//! All iteration (`get_all_items`, `get_key_range`) walks an
//! [`crate::bft::collections::OrderedMap`] so replicas agree on key
//! order when folding a checkpoint digest.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::bft::collections::{self, OrderedMap};
use crate::bft::error::*;

/// A value together with the version it was written at.
pub type VersionedValue = (String, u64);

/// Storage backends pluggable beneath the versioned KV engine.
///
/// Only [`MemoryBackend`] is implemented; the others are recognized by
/// [`crate::bft::config::ReplicaConfig`] as a forward-looking selector,
/// matching the plurality of backends the original storage interface
/// abstracted over, but none of them have bindings in this crate.
pub trait Storage: Send + Sync {
    /// Sets a plain, non-versioned value. Fails if `key` already has a
    /// versioned history.
    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Gets a plain value, or `None` if `key` has never been set.
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Returns every non-versioned value currently stored, in key order.
    fn get_all_values(&self) -> Result<Vec<String>>;

    /// Returns every non-versioned value whose key falls in
    /// `[min_key, max_key]`, in key order.
    fn get_range(&self, min_key: &str, max_key: &str) -> Result<Vec<String>>;

    /// Appends a new version of `key`. `version` must equal the key's
    /// current latest version (0 for a key with no history yet);
    /// otherwise returns [`ErrorKind::VersionMismatch`]. The value is
    /// stored under `version + 1`.
    fn set_with_version(&self, key: &str, value: &str, version: u64) -> Result<u64>;

    /// Returns the value at exactly `version`, or the latest version if
    /// no entry has that exact version (including `version == 0`).
    /// Returns `None` if `key` has no history.
    fn get_with_version(&self, key: &str, version: u64) -> Result<Option<VersionedValue>>;

    /// Returns the latest `(value, version)` of every versioned key, in
    /// key order.
    fn get_all_items(&self) -> Result<OrderedMap<String, VersionedValue>>;

    /// Returns the latest `(value, version)` of every versioned key in
    /// `[min_key, max_key]`, in key order.
    fn get_key_range(
        &self,
        min_key: &str,
        max_key: &str,
    ) -> Result<OrderedMap<String, VersionedValue>>;

    /// Returns every `(value, version)` pair for `key` whose version
    /// falls in `[min_version, max_version]`, sorted by version in
    /// descending order. Empty if `key` has no history.
    fn get_history(
        &self,
        key: &str,
        min_version: u64,
        max_version: u64,
    ) -> Result<Vec<VersionedValue>>;

    /// Returns up to `count` of the most recent `(value, version)` pairs
    /// for `key`, sorted by version in descending order.
    fn get_top_history(&self, key: &str, count: usize) -> Result<Vec<VersionedValue>>;

    /// Removes `key` entirely. For a versioned key this appends a
    /// tombstone version rather than truncating history, so
    /// `get_history` still accounts for the deletion; a plain key is
    /// removed outright.
    fn delete(&self, key: &str) -> Result<()>;

    /// Persists buffered writes to durable storage. The in-memory
    /// backend is always durable once a write returns, so this is a
    /// no-op; other backends would flush here.
    fn flush(&self) -> Result<()>;
}

#[derive(Clone, Default)]
struct Inner {
    plain: OrderedMap<String, String>,
    versioned: OrderedMap<String, Vec<VersionedValue>>,
    tombstoned: collections::HashSet<String>,
}

/// An in-memory [`Storage`] backend, backed by two ordered maps guarded
/// by a single `RwLock`.
///
/// Cloning an [`MemoryBackend`] handle is cheap -- it shares the same
/// underlying map via `Arc` -- which is what lets the executable layer
/// hand out a storage handle per request without copying the whole KV
/// state.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

fn latest(history: &[VersionedValue]) -> VersionedValue {
    history.last().cloned().expect("history is never left empty")
}

impl Storage for MemoryBackend {
    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.versioned.contains_key(key) {
            return Err("key has a versioned history").simple(ErrorKind::VersionedKeyExists);
        }
        inner.plain.insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        let inner = self.inner.read();
        Ok(inner.plain.get(key).cloned())
    }

    fn get_all_values(&self) -> Result<Vec<String>> {
        let inner = self.inner.read();
        Ok(inner.plain.values().cloned().collect())
    }

    fn get_range(&self, min_key: &str, max_key: &str) -> Result<Vec<String>> {
        if min_key > max_key {
            return Ok(Vec::new());
        }
        let inner = self.inner.read();
        Ok(inner
            .plain
            .range(min_key.to_owned()..=max_key.to_owned())
            .map(|(_, v)| v.clone())
            .collect())
    }

    fn set_with_version(&self, key: &str, value: &str, version: u64) -> Result<u64> {
        let mut inner = self.inner.write();
        if inner.plain.contains_key(key) {
            return Err("key has a non-versioned value").simple(ErrorKind::NonVersionedKeyExists);
        }

        let current = inner
            .versioned
            .get(key)
            .map(|history| latest(history).1)
            .unwrap_or(0);

        if current != version {
            return Err("version does not match the key's latest version")
                .simple(ErrorKind::VersionMismatch);
        }

        let next_version = version + 1;
        inner
            .versioned
            .entry(key.to_owned())
            .or_insert_with(Vec::new)
            .push((value.to_owned(), next_version));
        inner.tombstoned.remove(key);
        Ok(next_version)
    }

    fn get_with_version(&self, key: &str, version: u64) -> Result<Option<VersionedValue>> {
        let inner = self.inner.read();
        let history = match inner.versioned.get(key) {
            Some(history) if !history.is_empty() => history,
            _ => return Ok(None),
        };

        if version == 0 {
            return Ok(Some(latest(history)));
        }

        for entry in history.iter().rev() {
            if entry.1 == version {
                return Ok(Some(entry.clone()));
            }
            if entry.1 < version {
                break;
            }
        }

        Ok(Some(latest(history)))
    }

    fn get_all_items(&self) -> Result<OrderedMap<String, VersionedValue>> {
        let inner = self.inner.read();
        let mut out = collections::ordered_map();
        for (key, history) in inner.versioned.iter() {
            if let Some(entry) = history.last() {
                out.insert(key.clone(), entry.clone());
            }
        }
        Ok(out)
    }

    fn get_key_range(
        &self,
        min_key: &str,
        max_key: &str,
    ) -> Result<OrderedMap<String, VersionedValue>> {
        if min_key > max_key {
            return Ok(collections::ordered_map());
        }
        let inner = self.inner.read();
        let mut out = collections::ordered_map();
        for (key, history) in inner.versioned.range(min_key.to_owned()..=max_key.to_owned()) {
            if let Some(entry) = history.last() {
                out.insert(key.clone(), entry.clone());
            }
        }
        Ok(out)
    }

    fn get_history(
        &self,
        key: &str,
        min_version: u64,
        max_version: u64,
    ) -> Result<Vec<VersionedValue>> {
        let inner = self.inner.read();
        let mut out: Vec<VersionedValue> = match inner.versioned.get(key) {
            Some(history) => history
                .iter()
                .filter(|(_, v)| *v >= min_version && *v <= max_version)
                .cloned()
                .collect(),
            None => Vec::new(),
        };
        out.sort_by(|a, b| b.1.cmp(&a.1));
        Ok(out)
    }

    fn get_top_history(&self, key: &str, count: usize) -> Result<Vec<VersionedValue>> {
        let inner = self.inner.read();
        let mut out: Vec<VersionedValue> = match inner.versioned.get(key) {
            Some(history) => history.clone(),
            None => Vec::new(),
        };
        out.sort_by(|a, b| b.1.cmp(&a.1));
        out.truncate(count);
        Ok(out)
    }

    fn delete(&self, key: &str) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.plain.remove(key).is_some() {
            return Ok(());
        }
        if let Some(history) = inner.versioned.get(key) {
            let next_version = latest(history).1 + 1;
            inner
                .versioned
                .get_mut(key)
                .unwrap()
                .push((String::new(), next_version));
            inner.tombstoned.insert(key.to_owned());
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_set_get_roundtrip() {
        let s = MemoryBackend::new();
        s.set("a", "1").unwrap();
        assert_eq!(s.get("a").unwrap(), Some("1".to_owned()));
    }

    #[test]
    fn plain_and_versioned_interfaces_are_exclusive() {
        let s = MemoryBackend::new();
        s.set("a", "1").unwrap();
        let err = s.set_with_version("a", "2", 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NonVersionedKeyExists);

        let s2 = MemoryBackend::new();
        s2.set_with_version("b", "1", 0).unwrap();
        let err2 = s2.set("b", "2").unwrap_err();
        assert_eq!(err2.kind(), ErrorKind::VersionedKeyExists);
    }

    #[test]
    fn versioned_set_enforces_occ() {
        let s = MemoryBackend::new();
        assert_eq!(s.set_with_version("k", "v1", 0).unwrap(), 1);
        let err = s.set_with_version("k", "v2", 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::VersionMismatch);
        assert_eq!(s.set_with_version("k", "v2", 1).unwrap(), 2);
    }

    #[test]
    fn get_with_version_zero_returns_latest() {
        let s = MemoryBackend::new();
        s.set_with_version("k", "v1", 0).unwrap();
        s.set_with_version("k", "v2", 1).unwrap();
        assert_eq!(
            s.get_with_version("k", 0).unwrap(),
            Some(("v2".to_owned(), 2))
        );
    }

    #[test]
    fn get_with_version_oversized_falls_back_to_latest() {
        let s = MemoryBackend::new();
        s.set_with_version("k", "v1", 0).unwrap();
        assert_eq!(
            s.get_with_version("k", 99).unwrap(),
            Some(("v1".to_owned(), 1))
        );
    }

    #[test]
    fn history_is_descending_by_version() {
        let s = MemoryBackend::new();
        s.set_with_version("k", "v1", 0).unwrap();
        s.set_with_version("k", "v2", 1).unwrap();
        s.set_with_version("k", "v3", 2).unwrap();
        let history = s.get_history("k", 1, 3).unwrap();
        assert_eq!(
            history,
            vec![("v3".to_owned(), 3), ("v2".to_owned(), 2)]
        );
    }

    #[test]
    fn top_history_truncates() {
        let s = MemoryBackend::new();
        for i in 0..5u64 {
            s.set_with_version("k", &format!("v{}", i + 1), i).unwrap();
        }
        let top = s.get_top_history("k", 2).unwrap();
        assert_eq!(top, vec![("v5".to_owned(), 5), ("v4".to_owned(), 4)]);
    }

    #[test]
    fn range_query_is_inclusive_and_ordered() {
        let s = MemoryBackend::new();
        s.set_with_version("a", "1", 0).unwrap();
        s.set_with_version("b", "2", 0).unwrap();
        s.set_with_version("c", "3", 0).unwrap();
        let range = s.get_key_range("a", "b").unwrap();
        assert_eq!(range.keys().cloned().collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn reversed_bounds_return_empty_rather_than_panicking() {
        let s = MemoryBackend::new();
        s.set("a", "1").unwrap();
        s.set_with_version("b", "2", 0).unwrap();
        assert!(s.get_range("z", "a").unwrap().is_empty());
        assert!(s.get_key_range("z", "a").unwrap().is_empty());
    }

    #[test]
    fn delete_appends_tombstone_version() {
        let s = MemoryBackend::new();
        s.set_with_version("k", "v1", 0).unwrap();
        s.delete("k").unwrap();
        let items = s.get_all_items().unwrap();
        assert_eq!(items.get("k").unwrap().1, 2);
        assert!(items.get("k").unwrap().0.is_empty());
    }

    #[test]
    fn delete_plain_key_removes_outright() {
        let s = MemoryBackend::new();
        s.set("k", "v").unwrap();
        s.delete("k").unwrap();
        assert_eq!(s.get("k").unwrap(), None);
    }
}
