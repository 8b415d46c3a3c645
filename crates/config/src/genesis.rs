//! Genesis committee and header
//!
//! The genesis header carries the first proposer and validator committees;
//! every committee snapshot chain starts from it.

use crate::dpos::DposConfig;
use crate::error::{ConfigError, ConfigResult};
use dposbft_types::{Address, DposSnap, Header, H256};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::debug;

/// Genesis configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenesisConfig {
    /// Genesis timestamp, Unix milliseconds
    pub timestamp_ms: u64,

    /// Genesis gas limit; impeach blocks inherit their parent's value
    pub gas_limit: u64,

    /// Genesis state root
    pub state_root: H256,

    /// Proposer committee for terms 0 and 1
    pub proposers: Vec<Address>,

    /// Validator committee
    pub validators: Vec<Address>,

    /// Initial campaign candidates
    pub candidates: Vec<Address>,
}

impl Default for GenesisConfig {
    fn default() -> Self {
        Self {
            timestamp_ms: 1_546_300_800_000,
            gas_limit: 4_712_388,
            state_root: H256::ZERO,
            proposers: (1..=4).map(Address::from_low_u64).collect(),
            validators: (101..=104).map(Address::from_low_u64).collect(),
            candidates: (1..=6).map(Address::from_low_u64).collect(),
        }
    }
}

impl GenesisConfig {
    /// Check the committees against the DPoS parameters.
    pub fn validate(&self, dpos: &DposConfig) -> ConfigResult<()> {
        debug!("Validating genesis configuration");

        if self.validators.len() != dpos.validators_len() {
            return Err(ConfigError::GenesisValidatorCount {
                expected: dpos.validators_len(),
                actual: self.validators.len(),
            });
        }
        if self.proposers.len() as u64 != dpos.term_len {
            return Err(ConfigError::GenesisProposerCount {
                expected: dpos.term_len as usize,
                actual: self.proposers.len(),
            });
        }
        if self.gas_limit < dpos.min_gas_limit || self.gas_limit > dpos.max_gas_limit {
            return Err(ConfigError::GenesisGasLimit(self.gas_limit));
        }

        check_unique("proposer", &self.proposers)?;
        check_unique("validator", &self.validators)?;
        check_unique("candidate", &self.candidates)?;
        Ok(())
    }

    /// Build the genesis header.
    pub fn header(&self) -> Header {
        Header {
            state_root: self.state_root,
            number: 0,
            gas_limit: self.gas_limit,
            timestamp: self.timestamp_ms,
            extra: vec![0u8; 32],
            dpos: DposSnap {
                proposers: self.proposers.clone(),
                validators: self.validators.clone(),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

fn check_unique(role: &'static str, members: &[Address]) -> ConfigResult<()> {
    let mut seen = HashSet::with_capacity(members.len());
    for member in members {
        if !seen.insert(*member) {
            return Err(ConfigError::DuplicateMember {
                role,
                address: member.to_string(),
            });
        }
    }
    Ok(())
}
