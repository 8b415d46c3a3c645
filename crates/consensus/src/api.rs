//! Read-only query surface of the engine.
//!
//! Every value returned here is serde-serializable, so an RPC layer can
//! expose [`DposApi`] without further mapping.

use crate::engine::Dpos;
use crate::error::{DposError, Result};
use crate::snapshot::DposSnapshot;
use dposbft_types::{Address, H256};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Block selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockNumber {
    /// Chain head
    #[default]
    Latest,
    /// Block at this height
    Number(u64),
}

impl FromStr for BlockNumber {
    type Err = DposError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("latest") {
            return Ok(BlockNumber::Latest);
        }
        let parsed = match s.strip_prefix("0x") {
            Some(hex) => u64::from_str_radix(hex, 16),
            None => s.parse(),
        };
        parsed
            .map(BlockNumber::Number)
            .map_err(|e| DposError::Chain(format!("invalid block number {s:?}: {e}")))
    }
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockNumber::Latest => f.write_str("latest"),
            BlockNumber::Number(n) => write!(f, "{n}"),
        }
    }
}

/// Query API over a [`Dpos`] engine.
#[derive(Clone)]
pub struct DposApi {
    dpos: Arc<Dpos>,
}

impl DposApi {
    /// Wrap `dpos`.
    pub fn new(dpos: Arc<Dpos>) -> Self {
        Self { dpos }
    }

    /// Snapshot at `number`.
    pub fn get_snapshot(&self, number: BlockNumber) -> Result<DposSnapshot> {
        let header = match number {
            BlockNumber::Latest => self.dpos.chain().current_header(),
            BlockNumber::Number(n) => self
                .dpos
                .chain()
                .get_header_by_number(n)
                .ok_or(DposError::UnknownBlock)?,
        };
        Ok((*self.dpos.snapshot(header.number, header.hash(), &[])?).clone())
    }

    /// Snapshot at the block with `hash`.
    pub fn get_snapshot_at_hash(&self, hash: H256) -> Result<DposSnapshot> {
        let header = self
            .dpos
            .chain()
            .get_header_by_hash(&hash)
            .ok_or(DposError::UnknownBlock)?;
        Ok((*self.dpos.snapshot(header.number, hash, &[])?).clone())
    }

    /// Proposer committee in force at `number`.
    pub fn get_proposers(&self, number: BlockNumber) -> Result<Vec<Address>> {
        let snap = self.get_snapshot(number)?;
        Ok(snap.proposers_of(snap.number))
    }

    /// Validator committee in force at `number`.
    pub fn get_validators(&self, number: BlockNumber) -> Result<Vec<Address>> {
        let snap = self.get_snapshot(number)?;
        Ok(snap.validators_of(snap.number))
    }

    /// Registered RNodes.
    pub fn get_rnodes(&self) -> Result<Vec<Address>> {
        self.dpos.get_rnodes()
    }
}
