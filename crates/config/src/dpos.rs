//! DPoS committee parameters and the quantities derived from them.

use crate::error::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Number of terms between the election at a checkpoint and the term the
/// elected committee proposes in.
pub const TERM_DISTANCE_BETWEEN_ELECTION_AND_MINING: u64 = 2;

/// Committee sizes, timing and election parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DposConfig {
    /// Target interval between blocks; zero seals only blocks with transactions
    pub period_ms: u64,

    /// Proposers per term
    pub term_len: u64,

    /// Blocks each proposer produces per term
    pub view_len: u64,

    /// Tolerated faulty validators `f`; the validator committee has `3f + 1` members
    pub faulty_number: u64,

    /// Extra time after `period` before the committee impeaches a silent proposer
    pub impeach_timeout_ms: u64,

    /// Blocks at or below this height skip the timestamp window check
    pub max_init_block_number: u64,

    /// How long past its timestamp a proposer keeps trying to reach validators
    pub block_delay_ms: u64,

    /// Committee updates only run for heights within this distance of the known head
    pub full_sync_pivot: u64,

    /// Failback impeach blocks use timestamps on multiples of this interval
    pub failback_timestamp_sample_space_ms: u64,

    /// Share of candidates (lowest reputation) forming the low tier
    pub low_rpt_percentage: u64,

    /// Seats reserved for the low tier
    pub low_rpt_seats: usize,

    /// Lower gas limit bound
    pub min_gas_limit: u64,

    /// Upper gas limit bound
    pub max_gas_limit: u64,
}

impl Default for DposConfig {
    fn default() -> Self {
        Self {
            period_ms: 1_000,
            term_len: 4,
            view_len: 3,
            faulty_number: 1,
            impeach_timeout_ms: 1_000,
            max_init_block_number: 1_000,
            block_delay_ms: 1_000,
            full_sync_pivot: 100,
            failback_timestamp_sample_space_ms: 5_000,
            low_rpt_percentage: 50,
            low_rpt_seats: 2,
            min_gas_limit: 5_000,
            max_gas_limit: 0x7fff_ffff_ffff_ffff,
        }
    }
}

impl DposConfig {
    /// Validate ranges and internal consistency.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.term_len == 0 {
            return Err(ConfigError::InvalidTermLen);
        }
        if self.view_len == 0 {
            return Err(ConfigError::InvalidViewLen);
        }
        if self.min_gas_limit > self.max_gas_limit {
            return Err(ConfigError::InvalidGasLimitRange {
                min: self.min_gas_limit,
                max: self.max_gas_limit,
            });
        }
        if self.low_rpt_percentage > 100 {
            return Err(ConfigError::InvalidPercentage {
                name: "low_rpt_percentage",
                value: self.low_rpt_percentage,
            });
        }
        if self.low_rpt_seats as u64 > self.term_len {
            return Err(ConfigError::InvalidLowRptSeats {
                seats: self.low_rpt_seats,
                term_len: self.term_len as usize,
            });
        }
        Ok(())
    }

    /// Size of the validator committee, `3f + 1`.
    pub fn validators_len(&self) -> usize {
        (3 * self.faulty_number + 1) as usize
    }

    /// Normal-path quorum: at least `2f + 1` signatures.
    pub fn certificate(&self, signed: usize) -> bool {
        signed as u64 >= 2 * self.faulty_number + 1
    }

    /// Impeach-path quorum: at least `f + 1` signatures.
    pub fn impeach_certificate(&self, signed: usize) -> bool {
        signed as u64 >= self.faulty_number + 1
    }

    /// Block period.
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }

    /// Impeach timeout.
    pub fn impeach_timeout(&self) -> Duration {
        Duration::from_millis(self.impeach_timeout_ms)
    }

    /// Block delay.
    pub fn block_delay(&self) -> Duration {
        Duration::from_millis(self.block_delay_ms)
    }

    /// Blocks per term, `term_len * view_len`.
    pub fn blocks_per_term(&self) -> u64 {
        self.term_len * self.view_len
    }

    /// Term that height `number` belongs to.
    pub fn term_of(&self, number: u64) -> u64 {
        term_of(number, self.term_len, self.view_len)
    }

    /// Term whose committee is elected at height `number`.
    pub fn future_term_of(&self, number: u64) -> u64 {
        self.term_of(number) + TERM_DISTANCE_BETWEEN_ELECTION_AND_MINING
    }

    /// Slot in the proposer list that produces height `number`.
    pub fn proposer_index_of(&self, number: u64) -> usize {
        proposer_index_of(number, self.term_len, self.view_len)
    }

    /// Whether `number` closes a term.
    pub fn is_checkpoint(&self, number: u64) -> bool {
        is_checkpoint(number, self.term_len, self.view_len)
    }
}

/// `0` for genesis, otherwise `(n - 1) / (view_len * term_len)`.
pub fn term_of(number: u64, term_len: u64, view_len: u64) -> u64 {
    let span = term_len * view_len;
    if number == 0 || span == 0 {
        return 0;
    }
    (number - 1) / span
}

/// `(n - 1) mod (view_len * term_len) mod term_len`.
pub fn proposer_index_of(number: u64, term_len: u64, view_len: u64) -> usize {
    let span = term_len * view_len;
    if number == 0 || span == 0 {
        return 0;
    }
    ((number - 1) % span % term_len) as usize
}

/// Genesis is never a checkpoint; a zero length makes every block one.
pub fn is_checkpoint(number: u64, term_len: u64, view_len: u64) -> bool {
    if number == 0 {
        return false;
    }
    if term_len == 0 || view_len == 0 {
        return true;
    }
    number % (term_len * view_len) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quorum_boundaries() {
        let config = DposConfig {
            faulty_number: 1,
            ..Default::default()
        };
        assert_eq!(config.validators_len(), 4);
        assert!(!config.certificate(2));
        assert!(config.certificate(3));
        assert!(!config.impeach_certificate(1));
        assert!(config.impeach_certificate(2));

        let config = DposConfig {
            faulty_number: 2,
            ..Default::default()
        };
        assert_eq!(config.validators_len(), 7);
        assert!(!config.certificate(4));
        assert!(config.certificate(5));
        assert!(config.impeach_certificate(3));
    }

    #[test]
    fn test_term_math() {
        // term_len 4, view_len 3: 12 blocks per term
        assert_eq!(term_of(0, 4, 3), 0);
        assert_eq!(term_of(1, 4, 3), 0);
        assert_eq!(term_of(12, 4, 3), 0);
        assert_eq!(term_of(13, 4, 3), 1);
        assert_eq!(term_of(25, 4, 3), 2);

        let config = DposConfig::default();
        assert_eq!(config.future_term_of(12), 2);
        assert_eq!(config.future_term_of(13), 3);
    }

    #[test]
    fn test_proposer_rotation() {
        let slots: Vec<usize> = (1..=12).map(|n| proposer_index_of(n, 4, 3)).collect();
        assert_eq!(slots, vec![0, 1, 2, 3, 0, 1, 2, 3, 0, 1, 2, 3]);
        assert_eq!(proposer_index_of(13, 4, 3), 0);
    }

    #[test]
    fn test_checkpoints() {
        assert!(!is_checkpoint(0, 4, 3));
        assert!(!is_checkpoint(11, 4, 3));
        assert!(is_checkpoint(12, 4, 3));
        assert!(is_checkpoint(24, 4, 3));
        assert!(is_checkpoint(5, 0, 3));
        assert!(is_checkpoint(5, 4, 0));
    }

    #[test]
    fn test_validation() {
        assert!(DposConfig::default().validate().is_ok());

        let bad = DposConfig {
            term_len: 0,
            ..Default::default()
        };
        assert!(matches!(bad.validate(), Err(ConfigError::InvalidTermLen)));

        let bad = DposConfig {
            min_gas_limit: 10,
            max_gas_limit: 5,
            ..Default::default()
        };
        assert!(matches!(
            bad.validate(),
            Err(ConfigError::InvalidGasLimitRange { min: 10, max: 5 })
        ));

        let bad = DposConfig {
            low_rpt_seats: 5,
            ..Default::default()
        };
        assert!(matches!(bad.validate(), Err(ConfigError::InvalidLowRptSeats { .. })));
    }
}
