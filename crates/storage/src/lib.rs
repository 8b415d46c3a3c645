//! DPoS-BFT Storage Layer
//!
//! Persistence for the consensus engine's own records:
//!
//! - **KeyValueStore**: column-family keyed byte store, implemented by the
//!   RocksDB [`Database`] and the in-process [`MemoryDatabase`]
//! - **WriteThroughCache**: bounded LRU in front of one column family, used for
//!   committee snapshots, signature sets, the signed-blocks record and the
//!   recent-blocks pool

#![deny(missing_docs)]
#![deny(unsafe_code)]

pub mod cache;
pub mod db;
pub mod memory;

pub use cache::{CacheCodec, CacheKey, WriteThroughCache};
pub use db::{cf, Database, DatabaseConfig};
pub use memory::MemoryDatabase;

use thiserror::Error;

/// Storage error types
#[derive(Error, Debug)]
pub enum StorageError {
    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// Stored bytes could not be decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Column family not found
    #[error("Column family not found: {0}")]
    ColumnFamilyNotFound(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for storage operations
pub type Result<T> = std::result::Result<T, StorageError>;

/// Byte store addressed by column family and key.
pub trait KeyValueStore: Send + Sync {
    /// Read a value.
    fn get(&self, cf_name: &str, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Write a value, replacing any previous one.
    fn put(&self, cf_name: &str, key: &[u8], value: &[u8]) -> Result<()>;

    /// Remove a value. Missing keys are not an error.
    fn delete(&self, cf_name: &str, key: &[u8]) -> Result<()>;

    /// Whether a value is stored under `key`.
    fn exists(&self, cf_name: &str, key: &[u8]) -> Result<bool> {
        self.get(cf_name, key).map(|v| v.is_some())
    }
}
