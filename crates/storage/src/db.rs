//! RocksDB wrapper with column families for consensus records
//!
//! Each write-through cache owns one column family; `metadata` keeps
//! engine-wide values such as the last known head.

use parking_lot::RwLock;
use rocksdb::{BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, MultiThreaded, Options};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::{KeyValueStore, Result, StorageError};

/// Column family names
pub mod cf {
    /// Committee snapshots, JSON, keyed by block hash
    pub const SNAPSHOTS: &str = "snapshots";
    /// Commit-phase signature sets keyed by block hash
    pub const SIGNATURES: &str = "signatures";
    /// Prepare-phase signature sets keyed by block hash
    pub const PREPARE_SIGNATURES: &str = "prepare_signatures";
    /// Height (little-endian u64) to the hash this node committed to
    pub const SIGNED_BLOCKS: &str = "signed_blocks";
    /// Blocks waiting for a missing ancestor
    pub const RECENT_BLOCKS: &str = "recent_blocks";
    /// Engine metadata
    pub const METADATA: &str = "metadata";

    /// All column families
    pub const ALL: &[&str] = &[
        SNAPSHOTS,
        SIGNATURES,
        PREPARE_SIGNATURES,
        SIGNED_BLOCKS,
        RECENT_BLOCKS,
        METADATA,
    ];
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Path to the database directory
    pub path: String,
    /// Enable compression (LZ4)
    pub enable_compression: bool,
    /// Maximum number of open files
    pub max_open_files: i32,
    /// Write buffer size in bytes
    pub write_buffer_size: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: String::from("./data/dposbft"),
            enable_compression: true,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

/// RocksDB wrapper with column families
pub struct Database {
    inner: DBWithThreadMode<MultiThreaded>,
    config: DatabaseConfig,
    write_lock: RwLock<()>,
}

impl Database {
    /// Open or create a database at the configured path
    pub fn open(config: DatabaseConfig) -> Result<Self> {
        info!(path = %config.path, "opening consensus database");

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        opts.set_max_open_files(config.max_open_files);
        opts.set_write_buffer_size(config.write_buffer_size);
        if config.enable_compression {
            opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        }

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = cf::ALL
            .iter()
            .map(|name| {
                let mut cf_opts = Options::default();
                if config.enable_compression {
                    cf_opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
                }
                ColumnFamilyDescriptor::new(*name, cf_opts)
            })
            .collect();

        let db = DBWithThreadMode::<MultiThreaded>::open_cf_descriptors(
            &opts,
            Path::new(&config.path),
            cf_descriptors,
        )
        .map_err(|e| StorageError::Database(e.to_string()))?;

        info!(column_families = cf::ALL.len(), "consensus database opened");

        Ok(Self {
            inner: db,
            config,
            write_lock: RwLock::new(()),
        })
    }

    /// Open with default tuning at `path`
    pub fn open_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open(DatabaseConfig {
            path: path.as_ref().to_string_lossy().to_string(),
            ..Default::default()
        })
    }

    fn cf_handle(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.inner
            .cf_handle(name)
            .ok_or_else(|| StorageError::ColumnFamilyNotFound(name.to_string()))
    }

    /// Flush all memtables to disk
    pub fn flush_all(&self) -> Result<()> {
        for name in cf::ALL {
            let cf = self.cf_handle(name)?;
            self.inner
                .flush_cf(&cf)
                .map_err(|e| StorageError::Database(e.to_string()))?;
        }
        Ok(())
    }

    /// Path to the database directory
    pub fn path(&self) -> &str {
        &self.config.path
    }
}

impl KeyValueStore for Database {
    fn get(&self, cf_name: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let cf = self.cf_handle(cf_name)?;
        self.inner
            .get_cf(&cf, key)
            .map_err(|e| StorageError::Database(e.to_string()))
    }

    fn put(&self, cf_name: &str, key: &[u8], value: &[u8]) -> Result<()> {
        let cf = self.cf_handle(cf_name)?;
        let _guard = self.write_lock.write();
        self.inner
            .put_cf(&cf, key, value)
            .map_err(|e| StorageError::Database(e.to_string()))
    }

    fn delete(&self, cf_name: &str, key: &[u8]) -> Result<()> {
        let cf = self.cf_handle(cf_name)?;
        let _guard = self.write_lock.write();
        self.inner
            .delete_cf(&cf, key)
            .map_err(|e| StorageError::Database(e.to_string()))
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        debug!(path = %self.config.path, "closing consensus database");
    }
}
