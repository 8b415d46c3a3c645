//! Header, seal and signature verification.
//!
//! Verification runs in stages (basic fields, proposer list, proposer seal,
//! validator signatures). A [`VerifyStrategy`] chosen at engine construction
//! may intercept any stage; test networks use this to skip or fail
//! verification without real keys.

use crate::engine::Dpos;
use crate::error::{DposError, Result};
use crate::types::{now_ms, LbftState};
use async_trait::async_trait;
use dposbft_crypto::recover_address;
use dposbft_types::{Address, Block, Header, H256, EMPTY_ROOT, SIGNATURE_LENGTH};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, warn};

/// Prefix mixed into prepare-phase digests.
pub const PREPARE_PREFIX: &[u8] = b"Prepare";

/// Extra data of an impeach block.
pub const IMPEACH_EXTRA: [u8; SIGNATURE_LENGTH] = [0u8; SIGNATURE_LENGTH];

/// Verification stages a strategy can intercept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VerifyStage {
    /// Parent linkage, timestamp, gas and impeach-block fields
    Basic,
    /// Declared proposer list
    Proposers,
    /// Proposer seal
    Seal,
    /// Validator signatures
    Signatures,
}

/// Verification policy.
#[async_trait]
pub trait VerifyStrategy: Send + Sync {
    /// Decide `stage` for `header` without running it. `None` runs the stage.
    async fn intercept(&self, _stage: VerifyStage, _header: &Header) -> Option<Result<()>> {
        None
    }

    /// Whether timestamps are checked against the parent and waited for.
    fn enforces_timing(&self) -> bool {
        true
    }

    /// Whether the genesis snapshot takes its committees from the genesis header.
    fn uses_genesis_committee(&self) -> bool {
        true
    }
}

/// Full verification.
#[derive(Debug, Clone, Copy, Default)]
pub struct Normal;

impl VerifyStrategy for Normal {}

/// Accepts every stage.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysPass;

#[async_trait]
impl VerifyStrategy for AlwaysPass {
    async fn intercept(&self, _stage: VerifyStage, _header: &Header) -> Option<Result<()>> {
        Some(Ok(()))
    }

    fn enforces_timing(&self) -> bool {
        false
    }

    fn uses_genesis_committee(&self) -> bool {
        false
    }
}

/// Rejects seals and signatures, at every height or only at `at`.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysFail {
    /// Only fail at this height
    pub at: Option<u64>,
}

#[async_trait]
impl VerifyStrategy for AlwaysFail {
    async fn intercept(&self, stage: VerifyStage, header: &Header) -> Option<Result<()>> {
        match stage {
            VerifyStage::Basic => None,
            VerifyStage::Proposers => Some(Ok(())),
            VerifyStage::Seal | VerifyStage::Signatures => {
                if self.at.map_or(true, |at| at == header.number) {
                    Some(Err(DposError::FakeFail(header.number)))
                } else {
                    Some(Ok(()))
                }
            }
        }
    }

    fn enforces_timing(&self) -> bool {
        false
    }

    fn uses_genesis_committee(&self) -> bool {
        false
    }
}

/// Accepts everything after sleeping on the seal and signature stages.
#[derive(Debug, Clone, Copy, Default)]
pub struct Delayed {
    /// Time spent per seal or signature check
    pub delay: Duration,
}

#[async_trait]
impl VerifyStrategy for Delayed {
    async fn intercept(&self, stage: VerifyStage, _header: &Header) -> Option<Result<()>> {
        if matches!(stage, VerifyStage::Seal | VerifyStage::Signatures) {
            tokio::time::sleep(self.delay).await;
        }
        Some(Ok(()))
    }

    fn enforces_timing(&self) -> bool {
        false
    }

    fn uses_genesis_committee(&self) -> bool {
        false
    }
}

/// Digest the proposer seals; identical to the block hash.
pub fn sig_hash(header: &Header) -> H256 {
    header.hash()
}

/// Digest a validator signs in `state`.
pub fn hash_with_state(hash: H256, state: LbftState) -> Result<H256> {
    match state {
        LbftState::Prepare | LbftState::ImpeachPrepare => {
            Ok(H256::keccak256_concat(&[PREPARE_PREFIX, hash.as_bytes()]))
        }
        LbftState::Commit | LbftState::ImpeachCommit => Ok(hash),
        other => Err(DposError::InvalidStateForSign(other)),
    }
}

impl Dpos {
    /// Check `header` against the consensus rules.
    ///
    /// `parents` optionally supplies the ancestors (ascending) that are not
    /// in the chain yet.
    pub async fn verify_header(
        &self,
        header: &Header,
        parents: &[Header],
        verify_sigs: bool,
        verify_proposers: bool,
    ) -> Result<()> {
        if header.number == 0 {
            return Ok(());
        }

        self.verify_basic(header, parents).await?;

        if verify_proposers {
            if header.is_impeachment() {
                self.verify_dpos_snap_impeach(header, parents).map_err(|e| {
                    warn!(number = header.number, error = %e, "impeach dpos snap check failed");
                    e
                })?;
            } else {
                self.verify_proposers(header, parents).await.map_err(|e| {
                    warn!(number = header.number, error = %e, "proposer check failed");
                    e
                })?;
                self.verify_seal_with(header, parents).await.map_err(|e| {
                    warn!(number = header.number, error = %e, "seal check failed");
                    e
                })?;
            }
        }

        if verify_sigs {
            self.verify_signatures(header, parents).await.map_err(|e| {
                debug!(number = header.number, error = %e, "signature check failed");
                e
            })?;
        }
        Ok(())
    }

    /// Reject blocks that declare validators, then verify header and body.
    pub async fn validate_block(
        &self,
        block: &Block,
        verify_sigs: bool,
        verify_proposers: bool,
    ) -> Result<()> {
        if !block.header.dpos.validators.is_empty() {
            return Err(DposError::InvalidValidatorsList);
        }
        self.verify_header(&block.header, &[], verify_sigs, verify_proposers)
            .await?;
        self.chain.validate_block_body(block)
    }

    pub(crate) fn parent_of(&self, header: &Header, parents: &[Header]) -> Option<Header> {
        if let Some(last) = parents.last() {
            return Some(last.clone());
        }
        let number = header.number.checked_sub(1)?;
        self.chain
            .get_block(&header.parent_hash, number)
            .map(|b| b.header)
            .or_else(|| self.chain.get_header_by_number(number))
    }

    async fn verify_basic(&self, header: &Header, parents: &[Header]) -> Result<()> {
        if let Some(verdict) = self.strategy.intercept(VerifyStage::Basic, header).await {
            return verdict;
        }

        let number = header.number;
        let parent = self
            .parent_of(header, parents)
            .ok_or(DposError::UnknownAncestor)?;
        if parent.number + 1 != number || parent.hash() != header.parent_hash {
            debug!(number, parent = parent.number, "parent does not link to header");
            return Err(DposError::UnknownAncestor);
        }

        let impeach = header.is_impeachment();
        if self.strategy.enforces_timing() && number > self.config.max_init_block_number && !impeach {
            let earliest = parent.timestamp + self.config.period_ms;
            let latest = earliest + self.config.impeach_timeout_ms;
            if header.timestamp < earliest || header.timestamp > latest {
                return Err(DposError::InvalidTimestamp);
            }
        }

        if header.gas_limit > self.config.max_gas_limit
            || header.gas_limit < self.config.min_gas_limit
            || header.gas_used > header.gas_limit
        {
            return Err(DposError::InvalidGasLimit);
        }

        if impeach {
            return verify_basic_impeach(header, &parent);
        }

        if self.strategy.enforces_timing() {
            let delay = header.timestamp.saturating_sub(now_ms());
            if delay > 0 {
                debug!(number, delay_ms = delay, "delaying verification until block time");
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
        }
        Ok(())
    }

    fn verify_dpos_snap_impeach(&self, header: &Header, parents: &[Header]) -> Result<()> {
        let parent = self
            .parent_of(header, parents)
            .ok_or(DposError::UnknownAncestor)?;
        let expected = self.impeach_block_on(&parent, parents)?;
        let expected = &expected.header.dpos;
        if header.dpos.seal != expected.seal
            || header.dpos.proposers != expected.proposers
            || header.dpos.validators != expected.validators
        {
            return Err(DposError::InvalidImpeachDposSnap);
        }
        Ok(())
    }

    async fn verify_proposers(&self, header: &Header, parents: &[Header]) -> Result<()> {
        if let Some(verdict) = self.strategy.intercept(VerifyStage::Proposers, header).await {
            return verdict;
        }
        let number = header.number;
        let snap = self.snapshot(number - 1, header.parent_hash, parents)?;
        let expected = snap.proposers_of(number);
        if header.dpos.proposers != expected {
            debug!(
                number,
                declared = ?header.dpos.proposers,
                expected = ?expected,
                "proposer list differs from snapshot"
            );
            return Err(DposError::InvalidSigners);
        }
        Ok(())
    }

    pub(crate) async fn verify_seal_with(&self, header: &Header, parents: &[Header]) -> Result<()> {
        let number = header.number;
        if number == 0 {
            return Err(DposError::UnknownBlock);
        }
        if let Some(verdict) = self.strategy.intercept(VerifyStage::Seal, header).await {
            return verdict;
        }

        let proposer = recover_address(&sig_hash(header), &header.dpos.seal)?;
        self.final_sigs
            .add_signature_for(&header.identifier(), proposer, header.dpos.seal)?;

        let snap = self.snapshot(number - 1, header.parent_hash, parents)?;
        if !snap.is_proposer_of(&proposer, number)? {
            return Err(DposError::Unauthorized);
        }
        Ok(())
    }

    pub(crate) async fn verify_signatures(&self, header: &Header, parents: &[Header]) -> Result<()> {
        let number = header.number;
        if number == 0 {
            return Err(DposError::UnknownBlock);
        }
        if let Some(verdict) = self.strategy.intercept(VerifyStage::Signatures, header).await {
            return verdict;
        }

        let validators_len = self.config.validators_len();
        if header.dpos.sigs.len() != validators_len {
            return Err(DposError::InvalidSigsLength {
                expected: validators_len,
                actual: header.dpos.sigs.len(),
            });
        }

        let bi = header.identifier();
        let digest = hash_with_state(sig_hash(header), LbftState::Commit)?;
        let mut signers = HashSet::new();
        for sig in header.dpos.sigs.iter().filter(|s| !s.is_empty()) {
            let Ok(signer) = recover_address(&digest, sig) else {
                continue;
            };
            self.final_sigs.add_signature_for(&bi, signer, *sig)?;
            signers.insert(signer);
        }

        let snap = self.snapshot(number - 1, header.parent_hash, parents)?;
        let validators = snap.validators_of(number);
        let count = signers.iter().filter(|s| validators.contains(s)).count();
        debug!(number, hash = %bi.hash, count, "counted validator signatures");

        let certified = if header.is_impeachment() {
            self.config.impeach_certificate(count)
        } else {
            self.config.certificate(count)
        };
        if !certified {
            return Err(DposError::NotEnoughSigs);
        }
        Ok(())
    }

    /// Fill `header`'s signature slots from the `state` cache and, when the
    /// local coinbase is a validator, add its own signature.
    ///
    /// Commit signatures are recorded per height; a second block at the same
    /// height is refused.
    pub fn sign_header(&self, header: &mut Header, state: LbftState) -> Result<()> {
        let number = header.number;
        if number == 0 {
            return Err(DposError::UnknownBlock);
        }
        let cache = match state {
            LbftState::Commit | LbftState::ImpeachCommit => &self.final_sigs,
            LbftState::Prepare | LbftState::ImpeachPrepare => &self.prepare_sigs,
            other => return Err(DposError::InvalidStateForSign(other)),
        };

        let snap = self.snapshot(number - 1, header.parent_hash, &[])?;
        let validators = snap.validators_of(number);
        let validators_len = self.config.validators_len();
        if validators.len() != validators_len {
            warn!(
                number,
                expected = validators_len,
                actual = validators.len(),
                "validator committee size differs from configuration"
            );
        }
        header.dpos.sigs = vec![Default::default(); validators_len];
        cache.write_signatures_to_header(&validators, header);
        header.dpos.sigs.truncate(validators_len);

        let coinbase = self.coinbase();
        if !snap.is_validator_of(&coinbase, number) {
            return Err(DposError::ValidatorNotInCommittee);
        }
        let position = snap.validator_view_of(&coinbase, number)?;
        if position >= validators_len {
            warn!(number, position, validators_len, "validator slot outside the signature list");
            return Err(DposError::ValidatorNotInCommittee);
        }

        let hash = header.hash();
        if state == LbftState::Commit {
            self.signed_blocks.check_and_mark(number, hash)?;
        }

        let digest = hash_with_state(sig_hash(header), state)?;
        let signature = self.sign_hash(&digest)?;
        header.dpos.sigs[position] = signature;
        cache.add_signature_for(&header.identifier(), coinbase, signature)?;

        debug!(number, hash = %hash, %state, position, "signed header");
        Ok(())
    }

    /// Recover the proposer from `header`'s seal.
    pub fn ec_recover_proposer(&self, header: &Header) -> Result<Address> {
        Ok(recover_address(&sig_hash(header), &header.dpos.seal)?)
    }
}

fn verify_basic_impeach(header: &Header, parent: &Header) -> Result<()> {
    if header.state_root != parent.state_root {
        return Err(DposError::InvalidImpeachStateRoot);
    }
    if header.txs_root != EMPTY_ROOT {
        return Err(DposError::InvalidImpeachTxsRoot);
    }
    if header.receipts_root != EMPTY_ROOT {
        return Err(DposError::InvalidImpeachReceiptsRoot);
    }
    if !header.logs_bloom.is_zero() {
        return Err(DposError::InvalidImpeachLogsBloom);
    }
    if header.gas_limit != parent.gas_limit {
        return Err(DposError::InvalidImpeachGasLimit);
    }
    if header.gas_used != 0 {
        return Err(DposError::InvalidImpeachGasUsed);
    }
    if header.extra != IMPEACH_EXTRA {
        return Err(DposError::InvalidImpeachExtra);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parent() -> Header {
        Header {
            number: 4,
            gas_limit: 10_000,
            state_root: H256::keccak256(b"state"),
            coinbase: Address::from_low_u64(1),
            ..Default::default()
        }
    }

    fn impeach_child(parent: &Header) -> Header {
        Header {
            parent_hash: parent.hash(),
            number: parent.number + 1,
            gas_limit: parent.gas_limit,
            state_root: parent.state_root,
            extra: IMPEACH_EXTRA.to_vec(),
            ..Default::default()
        }
    }

    #[test]
    fn test_hash_with_state() {
        let hash = H256::keccak256(b"block");
        assert_eq!(hash_with_state(hash, LbftState::Commit).unwrap(), hash);
        assert_eq!(hash_with_state(hash, LbftState::ImpeachCommit).unwrap(), hash);

        let prepare = hash_with_state(hash, LbftState::Prepare).unwrap();
        let mut bytes = b"Prepare".to_vec();
        bytes.extend_from_slice(hash.as_bytes());
        assert_eq!(prepare, H256::keccak256(&bytes));
        assert_eq!(hash_with_state(hash, LbftState::ImpeachPrepare).unwrap(), prepare);

        assert!(matches!(
            hash_with_state(hash, LbftState::Idle),
            Err(DposError::InvalidStateForSign(LbftState::Idle))
        ));
    }

    #[test]
    fn test_impeach_fields_mirror_parent() {
        let parent = parent();
        assert!(verify_basic_impeach(&impeach_child(&parent), &parent).is_ok());

        let mut h = impeach_child(&parent);
        h.state_root = H256::ZERO;
        assert!(matches!(verify_basic_impeach(&h, &parent), Err(DposError::InvalidImpeachStateRoot)));

        let mut h = impeach_child(&parent);
        h.txs_root = H256::ZERO;
        assert!(matches!(verify_basic_impeach(&h, &parent), Err(DposError::InvalidImpeachTxsRoot)));

        let mut h = impeach_child(&parent);
        h.gas_limit += 1;
        assert!(matches!(verify_basic_impeach(&h, &parent), Err(DposError::InvalidImpeachGasLimit)));

        let mut h = impeach_child(&parent);
        h.gas_used = 1;
        assert!(matches!(verify_basic_impeach(&h, &parent), Err(DposError::InvalidImpeachGasUsed)));

        let mut h = impeach_child(&parent);
        h.extra = vec![0u8; 32];
        assert!(matches!(verify_basic_impeach(&h, &parent), Err(DposError::InvalidImpeachExtra)));
        h.extra = vec![1u8; 65];
        assert!(matches!(verify_basic_impeach(&h, &parent), Err(DposError::InvalidImpeachExtra)));
    }

    #[tokio::test]
    async fn test_fail_strategy_targets_one_height() {
        let strategy = AlwaysFail { at: Some(5) };
        let mut header = Header {
            number: 5,
            ..Default::default()
        };
        assert!(strategy.intercept(VerifyStage::Basic, &header).await.is_none());
        assert!(matches!(
            strategy.intercept(VerifyStage::Seal, &header).await,
            Some(Err(DposError::FakeFail(5)))
        ));
        header.number = 6;
        assert!(matches!(
            strategy.intercept(VerifyStage::Signatures, &header).await,
            Some(Ok(()))
        ));
        assert!(!strategy.enforces_timing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_strategy_sleeps() {
        let strategy = Delayed {
            delay: Duration::from_secs(3),
        };
        let start = tokio::time::Instant::now();
        let header = Header::default();
        assert!(matches!(
            strategy.intercept(VerifyStage::Seal, &header).await,
            Some(Ok(()))
        ));
        assert!(start.elapsed() >= Duration::from_secs(3));
    }
}
