//! In-process [`KeyValueStore`] for dev mode and tests.

use crate::{KeyValueStore, Result};
use parking_lot::RwLock;
use std::collections::HashMap;

/// HashMap-backed store. Column families are created on first write.
#[derive(Debug, Default)]
pub struct MemoryDatabase {
    columns: RwLock<HashMap<String, HashMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryDatabase {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries in a column family.
    pub fn len(&self, cf_name: &str) -> usize {
        self.columns.read().get(cf_name).map_or(0, |c| c.len())
    }

    /// Whether a column family holds no entries.
    pub fn is_empty(&self, cf_name: &str) -> bool {
        self.len(cf_name) == 0
    }
}

impl KeyValueStore for MemoryDatabase {
    fn get(&self, cf_name: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self
            .columns
            .read()
            .get(cf_name)
            .and_then(|c| c.get(key).cloned()))
    }

    fn put(&self, cf_name: &str, key: &[u8], value: &[u8]) -> Result<()> {
        self.columns
            .write()
            .entry(cf_name.to_string())
            .or_default()
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, cf_name: &str, key: &[u8]) -> Result<()> {
        if let Some(column) = self.columns.write().get_mut(cf_name) {
            column.remove(key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_columns_are_isolated() {
        let db = MemoryDatabase::new();
        db.put("a", b"k", b"1").unwrap();
        db.put("b", b"k", b"2").unwrap();

        assert_eq!(db.get("a", b"k").unwrap(), Some(b"1".to_vec()));
        assert_eq!(db.get("b", b"k").unwrap(), Some(b"2".to_vec()));
        assert_eq!(db.get("c", b"k").unwrap(), None);

        db.delete("a", b"k").unwrap();
        assert!(!db.exists("a", b"k").unwrap());
        assert!(db.exists("b", b"k").unwrap());
        assert!(db.is_empty("a"));
        assert_eq!(db.len("b"), 1);
    }
}
