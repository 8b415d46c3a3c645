//! Integration tests for the RocksDB wrapper

use dposbft_storage::{cf, Database, DatabaseConfig, KeyValueStore, WriteThroughCache};
use dposbft_types::{Block, BlockIdentifier, Header, H256};
use std::sync::Arc;
use tempfile::TempDir;

fn create_test_db() -> (Database, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let config = DatabaseConfig {
        path: temp_dir.path().to_string_lossy().to_string(),
        ..Default::default()
    };
    let db = Database::open(config).unwrap();
    (db, temp_dir)
}

#[test]
fn test_put_get_delete() {
    let (db, _temp_dir) = create_test_db();

    db.put(cf::SNAPSHOTS, b"key1", b"value1").unwrap();
    assert_eq!(db.get(cf::SNAPSHOTS, b"key1").unwrap(), Some(b"value1".to_vec()));
    assert!(db.exists(cf::SNAPSHOTS, b"key1").unwrap());
    assert!(!db.exists(cf::SIGNATURES, b"key1").unwrap());

    db.delete(cf::SNAPSHOTS, b"key1").unwrap();
    assert_eq!(db.get(cf::SNAPSHOTS, b"key1").unwrap(), None);
}

#[test]
fn test_unknown_column_family() {
    let (db, _temp_dir) = create_test_db();
    assert!(db.get("no_such_cf", b"k").is_err());
}

#[test]
fn test_values_survive_reopen() {
    let temp_dir = TempDir::new().unwrap();
    {
        let db = Database::open_default(temp_dir.path()).unwrap();
        db.put(cf::SIGNED_BLOCKS, &9u64.to_le_bytes(), H256::keccak256(b"nine").as_bytes())
            .unwrap();
        db.flush_all().unwrap();
    }
    let db = Database::open_default(temp_dir.path()).unwrap();
    assert_eq!(
        db.get(cf::SIGNED_BLOCKS, &9u64.to_le_bytes()).unwrap(),
        Some(H256::keccak256(b"nine").as_bytes().to_vec())
    );
}

#[test]
fn test_write_through_cache_over_rocksdb() {
    let (db, _temp_dir) = create_test_db();
    let store: Arc<dyn KeyValueStore> = Arc::new(db);
    let cache: WriteThroughCache<BlockIdentifier, Block> =
        WriteThroughCache::new(store.clone(), cf::RECENT_BLOCKS, 1);

    let mut header = Header::default();
    header.number = 12;
    let first = Block::new(header.clone(), vec![vec![1]], &[]);
    header.number = 13;
    let second = Block::new(header, Vec::new(), &[]);

    cache.insert(first.identifier(), first.clone()).unwrap();
    cache.insert(second.identifier(), second.clone()).unwrap();

    assert_eq!(cache.len(), 1);
    assert_eq!(cache.get(&first.identifier()).unwrap(), Some(first));
    assert!(store
        .exists(cf::RECENT_BLOCKS, &dposbft_storage::CacheKey::cache_key(&second.identifier()))
        .unwrap());
}
