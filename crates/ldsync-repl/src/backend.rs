//! Key-value backend contract used by the changelog and the entry store.
//!
//! The storage engine itself is external. Replication only needs ordered
//! byte keys, point reads and writes, an atomic read-modify-write, atomic
//! batches, and bulk export/import of a key prefix for full updates.
//! [`MemoryBackend`] is the in-process implementation used by tests and the
//! demo binary.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, RwLock};

use crate::error::{ReplError, Result};

/// Key type for the backend.
pub type Key = Vec<u8>;
/// Value type for the backend.
pub type Value = Vec<u8>;
/// A key-value pair.
pub type KvPair = (Key, Value);

/// Number of pairs fetched per page by [`ExportIter`].
pub const EXPORT_PAGE_SIZE: usize = 256;

/// A single operation in a write batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    /// Put a key-value pair.
    Put {
        /// The key to insert or update.
        key: Key,
        /// The value to store.
        value: Value,
    },
    /// Delete a key.
    Delete {
        /// The key to delete.
        key: Key,
    },
}

/// Storage contract required by replication.
pub trait KvBackend: Send + Sync {
    /// Get a value by key. Returns None if the key doesn't exist.
    fn get(&self, key: &[u8]) -> Result<Option<Value>>;

    /// Put a key-value pair. Overwrites any existing value.
    fn put(&self, key: Key, value: Value) -> Result<()>;

    /// Delete a key. Returns Ok(()) even if the key didn't exist.
    fn delete(&self, key: &[u8]) -> Result<()>;

    /// Reads `key` and applies the batch `f` builds from its value, with no
    /// other write in between.
    ///
    /// An error from `f` leaves the store untouched.
    fn read_modify_write(
        &self,
        key: &[u8],
        f: &mut dyn FnMut(Option<&[u8]>) -> Result<Vec<BatchOp>>,
    ) -> Result<()>;

    /// Scan all keys with the given prefix, in sorted order.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<KvPair>>;

    /// Up to `limit` pairs under `prefix` with keys strictly greater than `after`.
    fn scan_page(&self, prefix: &[u8], after: Option<&[u8]>, limit: usize) -> Result<Vec<KvPair>>;

    /// Atomically apply a batch of puts and deletes.
    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<()>;

    /// Atomically replaces every key under `prefix` with `pairs`.
    fn import_all(&self, prefix: &[u8], pairs: Vec<KvPair>) -> Result<()>;

    /// Lazily iterates every pair under `prefix` in key order.
    fn export_all(&self, prefix: &[u8]) -> ExportIter<'_>;
}

/// Paging iterator returned by [`KvBackend::export_all`].
pub struct ExportIter<'a> {
    backend: &'a dyn KvBackend,
    prefix: Vec<u8>,
    last_key: Option<Key>,
    page: std::vec::IntoIter<KvPair>,
    done: bool,
}

impl<'a> ExportIter<'a> {
    /// Starts an export of `prefix` from `backend`.
    pub fn new(backend: &'a dyn KvBackend, prefix: &[u8]) -> Self {
        Self {
            backend,
            prefix: prefix.to_vec(),
            last_key: None,
            page: Vec::new().into_iter(),
            done: false,
        }
    }
}

impl Iterator for ExportIter<'_> {
    type Item = Result<KvPair>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some((key, value)) = self.page.next() {
                self.last_key = Some(key.clone());
                return Some(Ok((key, value)));
            }
            if self.done {
                return None;
            }
            match self
                .backend
                .scan_page(&self.prefix, self.last_key.as_deref(), EXPORT_PAGE_SIZE)
            {
                Ok(page) => {
                    if page.len() < EXPORT_PAGE_SIZE {
                        self.done = true;
                    }
                    if page.is_empty() {
                        return None;
                    }
                    self.page = page.into_iter();
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

/// In-memory backend backed by a BTreeMap. Thread-safe via RwLock.
///
/// Does not persist data across restarts.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    data: Arc<RwLock<BTreeMap<Key, Value>>>,
}

impl MemoryBackend {
    /// Creates a new empty in-memory backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys stored.
    pub fn len(&self) -> usize {
        self.data.read().map(|d| d.len()).unwrap_or(0)
    }

    /// Returns true if no key is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned<E: std::fmt::Display>(e: E) -> ReplError {
    ReplError::backend(e.to_string())
}

fn range_from(prefix: &[u8], after: Option<&[u8]>) -> (Bound<Key>, Bound<Key>) {
    match after {
        Some(after) if after >= prefix => (Bound::Excluded(after.to_vec()), Bound::Unbounded),
        _ => (Bound::Included(prefix.to_vec()), Bound::Unbounded),
    }
}

fn apply_ops(data: &mut BTreeMap<Key, Value>, ops: Vec<BatchOp>) {
    for op in ops {
        match op {
            BatchOp::Put { key, value } => {
                data.insert(key, value);
            }
            BatchOp::Delete { key } => {
                data.remove(&key);
            }
        }
    }
}

impl KvBackend for MemoryBackend {
    fn get(&self, key: &[u8]) -> Result<Option<Value>> {
        let data = self.data.read().map_err(poisoned)?;
        Ok(data.get(key).cloned())
    }

    fn put(&self, key: Key, value: Value) -> Result<()> {
        let mut data = self.data.write().map_err(poisoned)?;
        data.insert(key, value);
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        let mut data = self.data.write().map_err(poisoned)?;
        data.remove(key);
        Ok(())
    }

    fn read_modify_write(
        &self,
        key: &[u8],
        f: &mut dyn FnMut(Option<&[u8]>) -> Result<Vec<BatchOp>>,
    ) -> Result<()> {
        let mut data = self.data.write().map_err(poisoned)?;
        let ops = f(data.get(key).map(|v| v.as_slice()))?;
        apply_ops(&mut data, ops);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<KvPair>> {
        let data = self.data.read().map_err(poisoned)?;
        let mut result = Vec::new();
        for (k, v) in data.range::<Key, _>(prefix.to_vec()..) {
            if !k.starts_with(prefix) {
                break;
            }
            result.push((k.clone(), v.clone()));
        }
        Ok(result)
    }

    fn scan_page(&self, prefix: &[u8], after: Option<&[u8]>, limit: usize) -> Result<Vec<KvPair>> {
        let data = self.data.read().map_err(poisoned)?;
        let result = data
            .range::<Key, _>(range_from(prefix, after))
            .take_while(|(k, _)| k.starts_with(prefix))
            .take(limit)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(result)
    }

    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<()> {
        let mut data = self.data.write().map_err(poisoned)?;
        apply_ops(&mut data, ops);
        Ok(())
    }

    fn import_all(&self, prefix: &[u8], pairs: Vec<KvPair>) -> Result<()> {
        if let Some((key, _)) = pairs.iter().find(|(k, _)| !k.starts_with(prefix)) {
            return Err(ReplError::backend(format!(
                "imported key {:?} is outside prefix {:?}",
                String::from_utf8_lossy(key),
                String::from_utf8_lossy(prefix)
            )));
        }
        let mut data = self.data.write().map_err(poisoned)?;
        let stale: Vec<Key> = data
            .range::<Key, _>(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in stale {
            data.remove(&key);
        }
        data.extend(pairs);
        Ok(())
    }

    fn export_all(&self, prefix: &[u8]) -> ExportIter<'_> {
        ExportIter::new(self, prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get() {
        let store = MemoryBackend::new();
        store.put(b"key1".to_vec(), b"value1".to_vec()).unwrap();
        assert_eq!(store.get(b"key1").unwrap(), Some(b"value1".to_vec()));
        assert_eq!(store.get(b"key2").unwrap(), None);
    }

    #[test]
    fn test_delete() {
        let store = MemoryBackend::new();
        store.put(b"key1".to_vec(), b"value1".to_vec()).unwrap();
        store.delete(b"key1").unwrap();
        assert_eq!(store.get(b"key1").unwrap(), None);
    }

    #[test]
    fn test_scan_prefix() {
        let store = MemoryBackend::new();
        store.put(b"dir/a".to_vec(), b"1".to_vec()).unwrap();
        store.put(b"dir/b".to_vec(), b"2".to_vec()).unwrap();
        store.put(b"other/x".to_vec(), b"4".to_vec()).unwrap();

        let result = store.scan_prefix(b"dir/").unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].0, b"dir/a");
        assert_eq!(result[1].0, b"dir/b");
    }

    fn bump(key: &'static [u8]) -> impl FnMut(Option<&[u8]>) -> Result<Vec<BatchOp>> {
        move |cur| {
            let n = cur.map(|b| b[0]).unwrap_or(0);
            Ok(vec![BatchOp::Put {
                key: key.to_vec(),
                value: vec![n + 1],
            }])
        }
    }

    #[test]
    fn test_read_modify_write_counter() {
        let store = MemoryBackend::new();
        for _ in 0..3 {
            store.read_modify_write(b"ctr", &mut bump(b"ctr")).unwrap();
        }
        assert_eq!(store.get(b"ctr").unwrap(), Some(vec![3]));

        store
            .read_modify_write(b"ctr", &mut |_| {
                Ok(vec![
                    BatchOp::Delete { key: b"ctr".to_vec() },
                    BatchOp::Put {
                        key: b"side".to_vec(),
                        value: vec![9],
                    },
                ])
            })
            .unwrap();
        assert_eq!(store.get(b"ctr").unwrap(), None);
        assert_eq!(store.get(b"side").unwrap(), Some(vec![9]));
    }

    #[test]
    fn test_read_modify_write_is_atomic_across_threads() {
        let store = MemoryBackend::new();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        store.read_modify_write(b"ctr", &mut bump(b"ctr")).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.get(b"ctr").unwrap(), Some(vec![200]));
    }

    #[test]
    fn test_read_modify_write_error_leaves_value() {
        let store = MemoryBackend::new();
        store.put(b"k".to_vec(), b"v".to_vec()).unwrap();
        let res = store.read_modify_write(b"k", &mut |_| Err(ReplError::backend("nope")));
        assert!(res.is_err());
        assert_eq!(store.get(b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn test_export_all_pages_lazily() {
        let store = MemoryBackend::new();
        for i in 0..(EXPORT_PAGE_SIZE * 2 + 7) {
            store
                .put(format!("e/{:06}", i).into_bytes(), vec![1])
                .unwrap();
        }
        store.put(b"f/zzz".to_vec(), vec![2]).unwrap();

        let keys: Vec<Key> = store
            .export_all(b"e/")
            .map(|r| r.unwrap().0)
            .collect();
        assert_eq!(keys.len(), EXPORT_PAGE_SIZE * 2 + 7);
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_import_all_replaces_prefix() {
        let store = MemoryBackend::new();
        store.put(b"e/old".to_vec(), vec![1]).unwrap();
        store.put(b"x/keep".to_vec(), vec![1]).unwrap();
        store
            .import_all(b"e/", vec![(b"e/new".to_vec(), vec![2])])
            .unwrap();
        assert_eq!(store.get(b"e/old").unwrap(), None);
        assert_eq!(store.get(b"e/new").unwrap(), Some(vec![2]));
        assert_eq!(store.get(b"x/keep").unwrap(), Some(vec![1]));
    }

    #[test]
    fn test_import_all_rejects_foreign_keys() {
        let store = MemoryBackend::new();
        store.put(b"e/old".to_vec(), vec![1]).unwrap();
        let res = store.import_all(b"e/", vec![(b"z/bad".to_vec(), vec![2])]);
        assert!(res.is_err());
        assert_eq!(store.get(b"e/old").unwrap(), Some(vec![1]));
    }

    #[test]
    fn test_write_batch() {
        let store = MemoryBackend::new();
        store.put(b"a".to_vec(), vec![1]).unwrap();
        store
            .write_batch(vec![
                BatchOp::Put {
                    key: b"b".to_vec(),
                    value: vec![2],
                },
                BatchOp::Delete { key: b"a".to_vec() },
            ])
            .unwrap();
        assert_eq!(store.get(b"a").unwrap(), None);
        assert_eq!(store.get(b"b").unwrap(), Some(vec![2]));
    }
}
