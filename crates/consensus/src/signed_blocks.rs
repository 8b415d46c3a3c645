//! Record of the block each height was commit-signed for.
//!
//! A validator must never commit-sign two different blocks at one height.
//! The record survives restarts: it is written through to the
//! `signed_blocks` column, keyed by little-endian height.

use crate::error::{DposError, Result};
use dposbft_storage::{cf, KeyValueStore, WriteThroughCache};
use dposbft_types::H256;
use std::sync::Arc;
use tracing::error;

/// Heights kept in memory.
pub const MAX_SIGNED_BLOCKS_RECORD_IN_CACHE: usize = 1024;

/// Height to signed-hash record.
pub struct SignedBlocksRecord {
    cache: WriteThroughCache<u64, H256>,
}

impl SignedBlocksRecord {
    /// Create a record over `store`.
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            cache: WriteThroughCache::new(store, cf::SIGNED_BLOCKS, MAX_SIGNED_BLOCKS_RECORD_IN_CACHE),
        }
    }

    /// Hash signed at `number`, if any.
    pub fn if_already_signed(&self, number: u64) -> Option<H256> {
        self.cache.get(&number).ok().flatten()
    }

    /// Record `hash` as signed at `number`.
    ///
    /// Fails with [`DposError::MultiBlocksInOneHeight`] when a different hash
    /// is already recorded; re-marking the same hash succeeds. The check and
    /// the write happen under one lock.
    pub fn check_and_mark(&self, number: u64, hash: H256) -> Result<()> {
        let mut conflict = None;
        self.cache.upsert(number, |existing| match existing {
            Some(signed) if signed != hash => {
                conflict = Some(signed);
                signed
            }
            _ => hash,
        })?;

        if let Some(signed) = conflict {
            error!(number, %signed, requested = %hash, "refusing to sign a second block at one height");
            return Err(DposError::MultiBlocksInOneHeight {
                number,
                signed,
                requested: hash,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dposbft_storage::MemoryDatabase;

    #[test]
    fn test_check_and_mark() {
        let record = SignedBlocksRecord::new(Arc::new(MemoryDatabase::new()));
        let a = H256::keccak256(b"a");
        let b = H256::keccak256(b"b");

        assert_eq!(record.if_already_signed(5), None);
        record.check_and_mark(5, a).unwrap();
        record.check_and_mark(5, a).unwrap();
        assert!(matches!(
            record.check_and_mark(5, b),
            Err(DposError::MultiBlocksInOneHeight { number: 5, .. })
        ));
        assert_eq!(record.if_already_signed(5), Some(a));
        record.check_and_mark(6, b).unwrap();
    }

    #[test]
    fn test_record_survives_restart() {
        let db: Arc<dyn KeyValueStore> = Arc::new(MemoryDatabase::new());
        let a = H256::keccak256(b"a");
        SignedBlocksRecord::new(db.clone()).check_and_mark(9, a).unwrap();

        let record = SignedBlocksRecord::new(db.clone());
        assert_eq!(record.if_already_signed(9), Some(a));
        assert!(record.check_and_mark(9, H256::keccak256(b"b")).is_err());
        assert_eq!(
            db.get(cf::SIGNED_BLOCKS, &9u64.to_le_bytes()).unwrap(),
            Some(a.as_bytes().to_vec())
        );
    }
}
