//! Generic write-through cache.
//!
//! A bounded [`LruCache`] in front of one column family of a
//! [`KeyValueStore`]. Reads fall through to the store and refill the cache;
//! writes go to both. Every method takes the cache lock for its whole
//! duration, so [`WriteThroughCache::upsert`] is an atomic read-modify-write
//! with respect to other callers of the same cache.

use crate::{KeyValueStore, Result, StorageError};
use dposbft_types::{Block, BlockIdentifier, H256};
use lru::LruCache;
use parking_lot::Mutex;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Arc;

/// Stable byte encoding of a cache key.
pub trait CacheKey: Clone + Eq + Hash {
    /// Bytes used as the store key.
    fn cache_key(&self) -> Vec<u8>;
}

/// Byte encoding of a cached value.
pub trait CacheCodec: Clone + Sized {
    /// Serialize for the store.
    fn encode_value(&self) -> Vec<u8>;

    /// Deserialize bytes read back from the store.
    fn decode_value(bytes: &[u8]) -> Result<Self>;
}

impl CacheKey for H256 {
    fn cache_key(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }
}

impl CacheKey for u64 {
    fn cache_key(&self) -> Vec<u8> {
        self.to_le_bytes().to_vec()
    }
}

impl CacheKey for BlockIdentifier {
    fn cache_key(&self) -> Vec<u8> {
        let mut key = Vec::with_capacity(40);
        key.extend_from_slice(&self.number.to_be_bytes());
        key.extend_from_slice(self.hash.as_bytes());
        key
    }
}

impl CacheCodec for H256 {
    fn encode_value(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }

    fn decode_value(bytes: &[u8]) -> Result<Self> {
        H256::from_slice(bytes).map_err(|e| StorageError::Serialization(e.to_string()))
    }
}

impl CacheCodec for Block {
    fn encode_value(&self) -> Vec<u8> {
        self.rlp_encode()
    }

    fn decode_value(bytes: &[u8]) -> Result<Self> {
        Block::rlp_decode(bytes).map_err(|e| StorageError::Serialization(e.to_string()))
    }
}

/// LRU cache backed by a column family.
pub struct WriteThroughCache<K: CacheKey, V: CacheCodec> {
    entries: Mutex<LruCache<K, V>>,
    store: Arc<dyn KeyValueStore>,
    column: &'static str,
}

impl<K: CacheKey, V: CacheCodec> WriteThroughCache<K, V> {
    /// Create a cache holding at most `capacity` entries (minimum 1).
    pub fn new(store: Arc<dyn KeyValueStore>, column: &'static str, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            store,
            column,
        }
    }

    /// Column family this cache writes to.
    pub fn column(&self) -> &'static str {
        self.column
    }

    /// Look up a value, falling back to the store.
    pub fn get(&self, key: &K) -> Result<Option<V>> {
        let mut entries = self.entries.lock();
        self.load(&mut entries, key)
    }

    /// Look up a value in memory only.
    pub fn peek_cached(&self, key: &K) -> Option<V> {
        self.entries.lock().peek(key).cloned()
    }

    /// Write to the store, then the cache.
    pub fn insert(&self, key: K, value: V) -> Result<()> {
        let mut entries = self.entries.lock();
        self.store
            .put(self.column, &key.cache_key(), &value.encode_value())?;
        entries.put(key, value);
        Ok(())
    }

    /// Read-modify-write under the cache lock.
    ///
    /// `f` receives the current value (cache or store) and returns the value
    /// to persist. The persisted value is returned.
    pub fn upsert<F>(&self, key: K, f: F) -> Result<V>
    where
        F: FnOnce(Option<V>) -> V,
    {
        let mut entries = self.entries.lock();
        let current = self.load(&mut entries, &key)?;
        let next = f(current);
        self.store
            .put(self.column, &key.cache_key(), &next.encode_value())?;
        entries.put(key, next.clone());
        Ok(next)
    }

    /// Whether a value exists in the cache or the store.
    pub fn contains(&self, key: &K) -> Result<bool> {
        if self.entries.lock().contains(key) {
            return Ok(true);
        }
        self.store.exists(self.column, &key.cache_key())
    }

    /// Remove from both the cache and the store.
    pub fn remove(&self, key: &K) -> Result<()> {
        let mut entries = self.entries.lock();
        entries.pop(key);
        self.store.delete(self.column, &key.cache_key())
    }

    /// Number of entries held in memory.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing is held in memory.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys held in memory, most recently used first.
    pub fn cached_keys(&self) -> Vec<K> {
        self.entries.lock().iter().map(|(k, _)| k.clone()).collect()
    }

    fn load(&self, entries: &mut LruCache<K, V>, key: &K) -> Result<Option<V>> {
        if let Some(value) = entries.get(key) {
            return Ok(Some(value.clone()));
        }
        match self.store.get(self.column, &key.cache_key())? {
            Some(bytes) => {
                let value = V::decode_value(&bytes)?;
                entries.put(key.clone(), value.clone());
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryDatabase;

    fn cache(capacity: usize) -> (Arc<MemoryDatabase>, WriteThroughCache<u64, H256>) {
        let db = Arc::new(MemoryDatabase::new());
        let cache = WriteThroughCache::new(db.clone(), "test", capacity);
        (db, cache)
    }

    #[test]
    fn test_insert_writes_through() {
        let (db, cache) = cache(4);
        let hash = H256::keccak256(b"one");
        cache.insert(1, hash).unwrap();

        assert_eq!(db.get("test", &1u64.to_le_bytes()).unwrap(), Some(hash.as_bytes().to_vec()));
        assert_eq!(cache.get(&1).unwrap(), Some(hash));
    }

    #[test]
    fn test_evicted_entries_reload_from_store() {
        let (_db, cache) = cache(2);
        for n in 0..5u64 {
            cache.insert(n, H256::keccak256(&n.to_be_bytes())).unwrap();
        }
        assert_eq!(cache.len(), 2);
        assert!(cache.peek_cached(&0).is_none());

        assert_eq!(cache.get(&0).unwrap(), Some(H256::keccak256(&0u64.to_be_bytes())));
        assert!(cache.peek_cached(&0).is_some());
        assert!(cache.contains(&1).unwrap());
        assert!(!cache.contains(&9).unwrap());
    }

    #[test]
    fn test_upsert_sees_stored_value() {
        let (_db, cache) = cache(1);
        let first = H256::keccak256(b"first");
        cache.insert(7, first).unwrap();
        cache.insert(8, H256::ZERO).unwrap();

        let mut seen = None;
        cache
            .upsert(7, |current| {
                seen = current;
                H256::keccak256(b"second")
            })
            .unwrap();
        assert_eq!(seen, Some(first));
        assert_eq!(cache.get(&7).unwrap(), Some(H256::keccak256(b"second")));
    }

    #[test]
    fn test_remove_clears_both_layers() {
        let (db, cache) = cache(4);
        cache.insert(3, H256::ZERO).unwrap();
        cache.remove(&3).unwrap();
        assert!(cache.get(&3).unwrap().is_none());
        assert!(db.is_empty("test"));
    }

    #[test]
    fn test_corrupt_store_value_is_error() {
        let (db, cache) = cache(4);
        db.put("test", &5u64.to_le_bytes(), b"short").unwrap();
        assert!(matches!(cache.get(&5), Err(StorageError::Serialization(_))));
    }
}
