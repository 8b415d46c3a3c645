//! Committee snapshots.
//!
//! A [`DposSnapshot`] records, for one block, the proposer and validator
//! committees of recent terms. Snapshots are immutable: applying headers
//! yields a new snapshot. The engine keeps them in a write-through cache
//! keyed by block hash and rebuilds missing ones by replaying headers from
//! the nearest known snapshot (or genesis).

use crate::chain::CandidateService;
use crate::election::elect;
use crate::engine::Dpos;
use crate::error::{DposError, Result};
use crate::rpt::RptService;
use dposbft_config::{is_checkpoint, proposer_index_of, term_of, DposConfig};
use dposbft_storage::{CacheCodec, StorageError};
use dposbft_types::{Address, Header, H256};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Terms of committee history a snapshot keeps.
pub const MAX_RECENT_TERMS: u64 = 200;

/// Committee state as of one block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DposSnapshot {
    /// Block height
    pub number: u64,
    /// Block hash
    pub hash: H256,
    /// Proposers per term
    pub term_len: u64,
    /// Blocks per proposer per term
    pub view_len: u64,
    /// Candidates of the most recent election
    pub candidates: Vec<Address>,
    /// Proposer committee by term
    pub recent_proposers: BTreeMap<u64, Vec<Address>>,
    /// Validator committee by term
    pub recent_validators: BTreeMap<u64, Vec<Address>>,
}

impl DposSnapshot {
    /// Genesis snapshot: the genesis committees serve terms 0 and 1.
    pub fn genesis(
        config: &DposConfig,
        hash: H256,
        proposers: Vec<Address>,
        validators: Vec<Address>,
    ) -> Self {
        let mut recent_proposers = BTreeMap::new();
        let mut recent_validators = BTreeMap::new();
        for term in 0..=1 {
            recent_proposers.insert(term, proposers.clone());
            recent_validators.insert(term, validators.clone());
        }
        Self {
            number: 0,
            hash,
            term_len: config.term_len,
            view_len: config.view_len,
            candidates: Vec::new(),
            recent_proposers,
            recent_validators,
        }
    }

    /// Replay `headers` on top of this snapshot.
    ///
    /// Headers must continue this snapshot's chain in ascending order. At
    /// checkpoints, when `update_committee` is set and both services are
    /// available, the proposers of the future term are elected.
    pub fn apply(
        &self,
        headers: &[Header],
        update_committee: bool,
        config: &DposConfig,
        candidates: Option<&dyn CandidateService>,
        rpt: Option<&dyn RptService>,
    ) -> Result<DposSnapshot> {
        let mut snap = self.clone();
        for header in headers {
            let number = header.number;
            if number != snap.number + 1 || header.parent_hash != snap.hash {
                return Err(DposError::InvalidChain);
            }

            let term = snap.term_of(number);
            if !header.dpos.proposers.is_empty() {
                snap.recent_proposers
                    .insert(term, header.dpos.proposers.clone());
            }
            if !header.dpos.validators.is_empty() {
                snap.recent_validators
                    .insert(term + 1, header.dpos.validators.clone());
            }

            snap.number = number;
            snap.hash = header.hash();

            if update_committee && snap.is_about_to_campaign(number) {
                if let (Some(candidates), Some(rpt)) = (candidates, rpt) {
                    snap.elect_future_committee(header, config, candidates, rpt)?;
                }
            }
        }
        snap.prune();
        Ok(snap)
    }

    fn elect_future_committee(
        &mut self,
        header: &Header,
        config: &DposConfig,
        candidates: &dyn CandidateService,
        rpt: &dyn RptService,
    ) -> Result<()> {
        let number = header.number;
        let future_term = self.future_term_of(number);

        let list = match candidates.candidates_of(future_term) {
            Ok(list) => list,
            Err(e) => {
                warn!(number, error = %e, "failed to read candidates, keeping proposers");
                return Ok(());
            }
        };
        let rpts = rpt.calc_rpts(&list, number)?;
        let seed = header.hash().low_u64();
        let low_count = list.len() * config.low_rpt_percentage as usize / 100;

        let elected = elect(
            &rpts,
            seed,
            self.term_len as usize,
            low_count,
            config.low_rpt_seats,
        );
        debug!(number, future_term, seed, elected = elected.len(), "elected proposers");

        self.candidates = list;
        if elected.len() as u64 >= self.term_len {
            self.recent_proposers.insert(future_term, elected);
        }
        Ok(())
    }

    fn prune(&mut self) {
        prune_terms(&mut self.recent_proposers);
        prune_terms(&mut self.recent_validators);
    }

    /// Term of height `number`.
    pub fn term_of(&self, number: u64) -> u64 {
        term_of(number, self.term_len, self.view_len)
    }

    /// Term elected at height `number`.
    pub fn future_term_of(&self, number: u64) -> u64 {
        self.term_of(number) + dposbft_config::TERM_DISTANCE_BETWEEN_ELECTION_AND_MINING
    }

    /// Proposer committee of `term`, or of the nearest earlier known term.
    pub fn recent_proposers(&self, term: u64) -> Vec<Address> {
        nearest(&self.recent_proposers, term)
    }

    /// Validator committee of `term`, or of the nearest earlier known term.
    pub fn recent_validators(&self, term: u64) -> Vec<Address> {
        nearest(&self.recent_validators, term)
    }

    /// Proposers for height `number`.
    pub fn proposers_of(&self, number: u64) -> Vec<Address> {
        self.recent_proposers(self.term_of(number))
    }

    /// Validators for height `number`.
    pub fn validators_of(&self, number: u64) -> Vec<Address> {
        self.recent_validators(self.term_of(number))
    }

    /// The proposer that produces height `number`.
    pub fn proposer_of(&self, number: u64) -> Result<Address> {
        self.proposers_of(number)
            .get(proposer_index_of(number, self.term_len, self.view_len))
            .copied()
            .ok_or(DposError::ProposerNotInCommittee)
    }

    /// Position of `signer` in the proposer committee for `number`.
    pub fn proposer_view_of(&self, signer: &Address, number: u64) -> Result<usize> {
        self.proposers_of(number)
            .iter()
            .position(|p| p == signer)
            .ok_or(DposError::ProposerNotInCommittee)
    }

    /// Position of `signer` in the validator committee for `number`.
    pub fn validator_view_of(&self, signer: &Address, number: u64) -> Result<usize> {
        self.validators_of(number)
            .iter()
            .position(|v| v == signer)
            .ok_or(DposError::ValidatorNotInCommittee)
    }

    /// Whether `signer` produces height `number`.
    ///
    /// Fails with [`DposError::ProposerNotInCommittee`] when `signer` is not
    /// a proposer of that term at all.
    pub fn is_proposer_of(&self, signer: &Address, number: u64) -> Result<bool> {
        let view = self.proposer_view_of(signer, number)?;
        Ok(view == proposer_index_of(number, self.term_len, self.view_len))
    }

    /// Whether `signer` is in the validator committee for `number`.
    pub fn is_validator_of(&self, signer: &Address, number: u64) -> bool {
        self.validators_of(number).contains(signer)
    }

    /// Whether candidates register for the next election at `number`: the
    /// first block of a term.
    pub fn is_start_campaign(&self, number: u64) -> bool {
        let span = self.term_len * self.view_len;
        span != 0 && number % span == 1
    }

    /// Whether the election runs at `number`.
    pub fn is_about_to_campaign(&self, number: u64) -> bool {
        is_checkpoint(number, self.term_len, self.view_len)
    }
}

/// Drop terms older than `MAX_RECENT_TERMS` behind the newest one, keeping
/// the entry that still covers the oldest retained term.
fn prune_terms(terms: &mut BTreeMap<u64, Vec<Address>>) {
    let Some(&latest) = terms.keys().next_back() else {
        return;
    };
    let oldest = latest.saturating_sub(MAX_RECENT_TERMS);
    let floor = terms
        .range(..=oldest)
        .next_back()
        .map(|(term, _)| *term)
        .unwrap_or(oldest);
    *terms = terms.split_off(&floor);
}

fn nearest(map: &BTreeMap<u64, Vec<Address>>, term: u64) -> Vec<Address> {
    map.range(..=term)
        .next_back()
        .map(|(_, list)| list.clone())
        .unwrap_or_default()
}

impl CacheCodec for DposSnapshot {
    fn encode_value(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    fn decode_value(bytes: &[u8]) -> dposbft_storage::Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| StorageError::Serialization(e.to_string()))
    }
}

impl Dpos {
    /// Snapshot at block `(number, hash)`.
    ///
    /// `chain_seg` optionally supplies the headers ending at `hash` in
    /// ascending order, for blocks not yet in the chain.
    pub fn snapshot(&self, number: u64, hash: H256, chain_seg: &[Header]) -> Result<Arc<DposSnapshot>> {
        if let Some(current) = self.current_snap() {
            if current.hash == hash {
                return Ok(current);
            }
        }

        let mut headers = Vec::new();
        let mut seg = chain_seg;
        let mut number_iter = number;
        let mut hash_iter = hash;

        let base = loop {
            if let Some(snap) = self.snapshots.get(&hash_iter)? {
                break snap;
            }

            if number_iter == 0 {
                let genesis = self
                    .chain
                    .get_header_by_number(0)
                    .ok_or(DposError::UnknownAncestor)?;
                let (proposers, validators) = if self.strategy.uses_genesis_committee() {
                    (genesis.dpos.proposers.clone(), genesis.dpos.validators.clone())
                } else {
                    (Vec::new(), Vec::new())
                };
                let snap = DposSnapshot::genesis(&self.config, genesis.hash(), proposers, validators);
                self.snapshots.insert(snap.hash, snap.clone())?;
                debug!(hash = %snap.hash, "stored genesis snapshot");
                break snap;
            }

            let header = match seg.split_last() {
                Some((last, rest)) => {
                    if last.number != number_iter || last.hash() != hash_iter {
                        return Err(DposError::UnknownAncestor);
                    }
                    seg = rest;
                    last.clone()
                }
                None => self
                    .chain
                    .get_header(&hash_iter, number_iter)
                    .ok_or(DposError::UnknownAncestor)?,
            };
            number_iter -= 1;
            hash_iter = header.parent_hash;
            headers.push(header);
        };
        headers.reverse();

        let (_, known_head) = self.chain.known_head();
        let update_committee = (self.is_miner() || self.is_validator())
            && base.number > known_head.saturating_sub(self.config.full_sync_pivot);

        let snap = base.apply(
            &headers,
            update_committee,
            &self.config,
            self.candidates.as_deref(),
            self.rpt.as_deref(),
        )?;
        debug!(number = snap.number, hash = %snap.hash, applied = headers.len(), "created snapshot");

        self.snapshots.insert(snap.hash, snap.clone())?;
        let snap = Arc::new(snap);
        self.set_current_snap(snap.clone());
        Ok(snap)
    }
}
