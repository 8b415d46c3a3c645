//! Signature aggregation caches.
//!
//! Prepare and commit signatures arrive one validator at a time; the engine
//! collects them per block in a [`SignatureCache`] until a certificate is
//! reached. Each block's set is written through to the store so a restarted
//! node keeps what it has already collected.

use crate::error::Result;
use dposbft_storage::{CacheCodec, KeyValueStore, StorageError, WriteThroughCache};
use dposbft_types::{Address, BlockIdentifier, DposSignature, Header, H256};
use rlp::{Rlp, RlpStream};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Blocks whose signature sets stay in memory.
pub const SIGNATURE_CACHE_SIZE: usize = 100;

/// Signatures collected for one block, by signer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Signatures {
    inner: BTreeMap<Address, DposSignature>,
}

impl Signatures {
    /// Record `signer`'s signature.
    pub fn set(&mut self, signer: Address, signature: DposSignature) {
        self.inner.insert(signer, signature);
    }

    /// Signature of `signer`, if collected.
    pub fn get(&self, signer: &Address) -> Option<DposSignature> {
        self.inner.get(signer).copied()
    }

    /// Number of collected signatures.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether nothing has been collected.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl CacheCodec for Signatures {
    fn encode_value(&self) -> Vec<u8> {
        let mut s = RlpStream::new_list(self.inner.len());
        for (signer, signature) in &self.inner {
            s.begin_list(2);
            s.append(signer);
            s.append(signature);
        }
        s.out().to_vec()
    }

    fn decode_value(bytes: &[u8]) -> dposbft_storage::Result<Self> {
        let decode = || -> std::result::Result<Self, rlp::DecoderError> {
            let rlp = Rlp::new(bytes);
            let mut inner = BTreeMap::new();
            for pair in rlp.iter() {
                inner.insert(pair.val_at(0)?, pair.val_at(1)?);
            }
            Ok(Self { inner })
        };
        decode().map_err(|e| StorageError::Serialization(e.to_string()))
    }
}

/// Per-block signature sets in front of one column family.
pub struct SignatureCache {
    cache: WriteThroughCache<H256, Signatures>,
}

impl SignatureCache {
    /// Create a cache over `column` of `store`.
    pub fn new(store: Arc<dyn KeyValueStore>, column: &'static str) -> Self {
        Self {
            cache: WriteThroughCache::new(store, column, SIGNATURE_CACHE_SIZE),
        }
    }

    /// Record `signer`'s signature for block `bi`.
    pub fn add_signature_for(
        &self,
        bi: &BlockIdentifier,
        signer: Address,
        signature: DposSignature,
    ) -> Result<()> {
        self.cache.upsert(bi.hash, |existing| {
            let mut sigs = existing.unwrap_or_default();
            sigs.set(signer, signature);
            sigs
        })?;
        debug!(number = bi.number, hash = %bi.hash, %signer, column = self.cache.column(), "cached signature");
        Ok(())
    }

    /// `signer`'s signature for block `bi`, if collected.
    pub fn get_signature_for(&self, bi: &BlockIdentifier, signer: &Address) -> Option<DposSignature> {
        self.cache
            .get(&bi.hash)
            .ok()
            .flatten()
            .and_then(|sigs| sigs.get(signer))
    }

    /// Number of signatures collected for `bi`, read from the store when evicted.
    pub fn signatures_count_of(&self, bi: &BlockIdentifier) -> usize {
        self.cache
            .get(&bi.hash)
            .ok()
            .flatten()
            .map_or(0, |sigs| sigs.len())
    }

    /// Number of `validators` with a signature collected for `bi`.
    pub fn count_signed_by(&self, bi: &BlockIdentifier, validators: &[Address]) -> usize {
        let Some(sigs) = self.cache.get(&bi.hash).ok().flatten() else {
            return 0;
        };
        validators.iter().filter(|v| sigs.get(v).is_some()).count()
    }

    /// Cache the signatures recovered from `header`, keeping only validators.
    pub fn cache_signatures_from_header(
        &self,
        signers: &[Address],
        signatures: &[DposSignature],
        validators: &[Address],
        header: &Header,
    ) -> Result<()> {
        let bi = header.identifier();
        for (signer, signature) in signers.iter().zip(signatures) {
            if validators.contains(signer) {
                self.add_signature_for(&bi, *signer, *signature)?;
            }
        }
        Ok(())
    }

    /// Fill `header`'s signature slots, in validator order, from the cache.
    pub fn write_signatures_to_header(&self, validators: &[Address], header: &mut Header) {
        let bi = header.identifier();
        if header.dpos.sigs.len() < validators.len() {
            header.dpos.sigs.resize(validators.len(), DposSignature::EMPTY);
        }
        for (slot, validator) in validators.iter().enumerate() {
            if let Some(signature) = self.get_signature_for(&bi, validator) {
                header.dpos.sigs[slot] = signature;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dposbft_storage::{cf, MemoryDatabase};

    fn sig(b: u8) -> DposSignature {
        DposSignature::new([b; 65])
    }

    fn header() -> Header {
        Header {
            number: 3,
            coinbase: Address::from_low_u64(1),
            ..Default::default()
        }
    }

    #[test]
    fn test_signatures_codec_sorted_pairs() {
        let mut sigs = Signatures::default();
        sigs.set(Address::from_low_u64(2), sig(2));
        sigs.set(Address::from_low_u64(1), sig(1));
        let decoded = Signatures::decode_value(&sigs.encode_value()).unwrap();
        assert_eq!(decoded, sigs);

        let rlp = Rlp::new(&sigs.encode_value()).at(0).unwrap().val_at::<Address>(0).unwrap();
        assert_eq!(rlp, Address::from_low_u64(1));
    }

    #[test]
    fn test_collect_and_write_back() {
        let db = Arc::new(MemoryDatabase::new());
        let cache = SignatureCache::new(db.clone(), cf::SIGNATURES);
        let mut header = header();
        let bi = header.identifier();
        let validators: Vec<Address> = (11..=14).map(Address::from_low_u64).collect();

        let signers = vec![validators[2], Address::from_low_u64(99), validators[0]];
        let sigs = vec![sig(3), sig(9), sig(1)];
        cache
            .cache_signatures_from_header(&signers, &sigs, &validators, &header)
            .unwrap();
        assert_eq!(cache.signatures_count_of(&bi), 2);
        assert_eq!(cache.count_signed_by(&bi, &validators[..2]), 1);
        assert!(cache.get_signature_for(&bi, &Address::from_low_u64(99)).is_none());

        cache.write_signatures_to_header(&validators, &mut header);
        assert_eq!(
            header.dpos.sigs,
            vec![sig(1), DposSignature::EMPTY, sig(3), DposSignature::EMPTY]
        );
        // identity does not move with the signatures
        assert_eq!(header.identifier(), bi);
    }

    #[test]
    fn test_count_survives_restart() {
        let db = Arc::new(MemoryDatabase::new());
        let bi = header().identifier();
        {
            let cache = SignatureCache::new(db.clone(), cf::PREPARE_SIGNATURES);
            cache.add_signature_for(&bi, Address::from_low_u64(1), sig(1)).unwrap();
            cache.add_signature_for(&bi, Address::from_low_u64(2), sig(2)).unwrap();
            cache.add_signature_for(&bi, Address::from_low_u64(2), sig(7)).unwrap();
        }
        let cache = SignatureCache::new(db, cf::PREPARE_SIGNATURES);
        assert_eq!(cache.signatures_count_of(&bi), 2);
        assert_eq!(cache.get_signature_for(&bi, &Address::from_low_u64(2)), Some(sig(7)));
    }
}
