//! Committee queries, impeach block construction and chain access used by
//! the handler and the API.

use crate::dialer::PeerInfo;
use crate::engine::Dpos;
use crate::error::{DposError, Result};
use crate::types::{now_ms, DposStatus, LbftState};
use crate::verify::{hash_with_state, sig_hash, IMPEACH_EXTRA};
use dposbft_crypto::recover_address;
use dposbft_types::{Address, Block, DposSignature, DposSnap, Header, H256};
use tracing::{debug, info};

/// Prefix of the handshake MAC.
pub const MAC_PREFIX: &str = "gcchain";

impl Dpos {
    /// Term of block `number`.
    pub fn term_of(&self, number: u64) -> u64 {
        self.config.term_of(number)
    }

    /// Term whose committee is elected at block `number`.
    pub fn future_term_of(&self, number: u64) -> u64 {
        self.config.future_term_of(number)
    }

    /// Proposer of block `number`, by the head snapshot.
    pub fn proposer_of(&self, number: u64) -> Result<Address> {
        self.head_snapshot()?.proposer_of(number)
    }

    /// Proposer committee of block `number`, by the head snapshot.
    pub fn proposers_of(&self, number: u64) -> Result<Vec<Address>> {
        Ok(self.head_snapshot()?.proposers_of(number))
    }

    /// Validator committee of block `number`, by the head snapshot.
    pub fn validators_of(&self, number: u64) -> Result<Vec<Address>> {
        Ok(self.head_snapshot()?.validators_of(number))
    }

    /// Proposer committee of `term`.
    pub fn proposers_of_term(&self, term: u64) -> Result<Vec<Address>> {
        Ok(self.head_snapshot()?.recent_proposers(term))
    }

    /// Validator committee of `term`.
    pub fn validators_of_term(&self, term: u64) -> Result<Vec<Address>> {
        Ok(self.head_snapshot()?.recent_validators(term))
    }

    /// Whether `signer` is a proposer of `term`.
    pub fn verify_proposer_of(&self, signer: &Address, term: u64) -> Result<bool> {
        Ok(self.proposers_of_term(term)?.contains(signer))
    }

    /// Whether `signer` is a validator of `term`.
    pub fn verify_validator_of(&self, signer: &Address, term: u64) -> Result<bool> {
        Ok(self.validators_of_term(term)?.contains(signer))
    }

    /// Whether `signer` proposes in the head's term or the next elected one.
    pub fn is_current_or_future_proposer(&self, signer: &Address) -> Result<bool> {
        let snap = self.head_snapshot()?;
        let number = snap.number;
        Ok(snap.recent_proposers(snap.term_of(number)).contains(signer)
            || snap.recent_proposers(snap.future_term_of(number)).contains(signer))
    }

    /// Registered RNodes.
    pub fn get_rnodes(&self) -> Result<Vec<Address>> {
        let rnodes = self
            .rnodes
            .as_ref()
            .ok_or(DposError::ServiceUnavailable("rnode service"))?;
        rnodes.rnodes()
    }

    /// Connected remote signers.
    pub fn peer_infos(&self) -> Vec<PeerInfo> {
        self.dialer().map(|d| d.peer_infos()).unwrap_or_default()
    }

    fn head_snapshot(&self) -> Result<std::sync::Arc<crate::snapshot::DposSnapshot>> {
        let head = self.chain.current_header();
        self.snapshot(head.number, head.hash(), &[])
    }

    // -------------------------------------------------------------------------
    // Impeach blocks
    // -------------------------------------------------------------------------

    /// Impeach block on top of the chain head.
    pub fn create_impeach_block(&self) -> Result<Block> {
        let parent = self.chain.current_header();
        self.impeach_block_on(&parent, &[])
    }

    /// Impeach block on top of `parent`.
    pub fn create_impeach_block_at(&self, parent: &Header) -> Result<Block> {
        self.impeach_block_on(parent, &[])
    }

    /// Two impeach blocks on the chain head, timestamped on the next two
    /// multiples of the failback sample space.
    ///
    /// Nodes that lost track of time agree on these without talking to each
    /// other.
    pub fn create_failback_impeach_blocks(&self) -> Result<(Block, Block)> {
        let space = self.config.failback_timestamp_sample_space_ms.max(1);
        let first_ts = (now_ms() / space + 1) * space;
        let second_ts = first_ts + space;

        let parent = self.chain.current_header();
        let mut first = self.impeach_block_on(&parent, &[])?;
        first.header.timestamp = first_ts;
        let mut second = first.clone();
        second.header.timestamp = second_ts;

        info!(number = first.number(), first_ts, second_ts, "created failback impeach blocks");
        Ok((first, second))
    }

    /// Deterministic impeach block on `parent`.
    ///
    /// Every honest validator builds the byte-identical block, so their
    /// signatures aggregate without a proposer.
    pub(crate) fn impeach_block_on(&self, parent: &Header, chain_seg: &[Header]) -> Result<Block> {
        let number = parent.number + 1;
        let snap = self.snapshot(parent.number, parent.hash(), chain_seg)?;
        let header = Header {
            parent_hash: parent.hash(),
            coinbase: Address::ZERO,
            state_root: parent.state_root,
            number,
            gas_limit: parent.gas_limit,
            gas_used: 0,
            timestamp: parent.timestamp + self.config.period_ms + self.config.impeach_timeout_ms,
            extra: IMPEACH_EXTRA.to_vec(),
            dpos: DposSnap {
                seal: DposSignature::EMPTY,
                sigs: vec![DposSignature::EMPTY; self.config.validators_len()],
                proposers: snap.proposers_of(number),
                validators: Vec::new(),
            },
            ..Default::default()
        };
        Ok(Block::new(header, Vec::new(), &[]))
    }

    // -------------------------------------------------------------------------
    // Signature recovery
    // -------------------------------------------------------------------------

    /// Recover the signer of every filled signature slot, as signed in `state`.
    ///
    /// Returns the signers alongside their signatures; unrecoverable slots are
    /// skipped.
    pub fn ec_recover_sigs(
        &self,
        header: &Header,
        state: LbftState,
    ) -> Result<(Vec<Address>, Vec<DposSignature>)> {
        let digest = hash_with_state(sig_hash(header), state)?;
        let mut signers = Vec::new();
        let mut sigs = Vec::new();
        for sig in header.dpos.sigs.iter().filter(|s| !s.is_empty()) {
            match recover_address(&digest, sig) {
                Ok(signer) => {
                    signers.push(signer);
                    sigs.push(*sig);
                }
                Err(e) => debug!(number = header.number, error = %e, "skipping unrecoverable signature"),
            }
        }
        Ok((signers, sigs))
    }

    /// Cache the prepare signatures carried by `header`.
    pub fn update_prepare_sigs_cache(&self, header: &Header) -> Result<usize> {
        let state = if header.is_impeachment() {
            LbftState::ImpeachPrepare
        } else {
            LbftState::Prepare
        };
        self.update_sigs_cache(header, state)
    }

    /// Cache the commit signatures carried by `header`.
    pub fn update_final_sigs_cache(&self, header: &Header) -> Result<usize> {
        let state = if header.is_impeachment() {
            LbftState::ImpeachCommit
        } else {
            LbftState::Commit
        };
        self.update_sigs_cache(header, state)
    }

    fn update_sigs_cache(&self, header: &Header, state: LbftState) -> Result<usize> {
        let number = header.number;
        if number == 0 {
            return Err(DposError::UnknownBlock);
        }
        let (signers, sigs) = self.ec_recover_sigs(header, state)?;
        let snap = self.snapshot(number - 1, header.parent_hash, &[])?;
        let validators = snap.validators_of(number);

        let cache = if state.is_commit() {
            &self.final_sigs
        } else {
            &self.prepare_sigs
        };
        cache.cache_signatures_from_header(&signers, &sigs, &validators, header)?;
        Ok(cache.signatures_count_of(&header.identifier()))
    }

    /// Handshake MAC and its signature by the local account.
    pub fn get_mac(&self) -> Result<(String, DposSignature)> {
        let mac = compose_mac(&chrono::Utc::now().to_rfc3339());
        let sig = self.sign_hash(&H256::keccak256(mac.as_bytes()))?;
        Ok((mac, sig))
    }

    // -------------------------------------------------------------------------
    // Chain access
    // -------------------------------------------------------------------------

    /// Whether block `(hash, number)` is in the local chain.
    pub fn has_block_in_chain(&self, hash: &H256, number: u64) -> bool {
        self.chain.get_block(hash, number).is_some()
    }

    /// Block `(hash, number)` from the local chain.
    pub fn get_block_from_chain(&self, hash: &H256, number: u64) -> Option<Block> {
        self.chain.get_block(hash, number)
    }

    /// Insert a finished block and advance the current snapshot.
    pub fn insert_chain(&self, block: Block) -> Result<()> {
        let number = block.number();
        let hash = block.hash();
        if self.has_block_in_chain(&hash, number) {
            debug!(number, %hash, "block already in chain");
            return Ok(());
        }
        self.chain.insert_chain(vec![block])?;
        let snap = self.snapshot(number, hash, &[])?;
        self.set_current_snap(snap);
        info!(number, %hash, "inserted block");
        Ok(())
    }

    /// Reward for the producer of block `number`.
    pub fn block_reward(&self, number: u64) -> u128 {
        self.rewards.block_reward(number)
    }

    /// Phase and head of this node.
    pub fn status(&self) -> DposStatus {
        DposStatus {
            state: self.state(),
            head: self.chain.current_header().identifier(),
        }
    }
}

/// Handshake MAC for `timestamp`.
pub fn compose_mac(timestamp: &str) -> String {
    format!("{MAC_PREFIX}|{timestamp}")
}
