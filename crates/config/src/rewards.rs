//! Block reward schedule.

use crate::error::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};

/// Base units per milli-token (tokens have 18 decimals).
pub const BASE_UNITS_PER_MILLI: u128 = 1_000_000_000_000_000;

/// Per-block coinbase reward, tiered by year.
///
/// Year `i` covers heights `(i * blocks_per_year, (i + 1) * blocks_per_year]`.
/// Heights past the last tier earn nothing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RewardsConfig {
    /// Blocks in one reward year
    pub blocks_per_year: u64,

    /// Per-block reward for each year, in milli-tokens
    pub yearly_rewards: Vec<u64>,
}

impl Default for RewardsConfig {
    fn default() -> Self {
        Self {
            blocks_per_year: 31_536_000,
            yearly_rewards: vec![12_650, 8_430, 5_620, 3_750, 2_500],
        }
    }
}

impl RewardsConfig {
    /// Validate the schedule.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.blocks_per_year == 0 {
            return Err(ConfigError::InvalidBlocksPerYear);
        }
        Ok(())
    }

    /// Reward for the block at `number`, in base units.
    pub fn block_reward(&self, number: u64) -> u128 {
        if number == 0 || self.blocks_per_year == 0 {
            return 0;
        }
        let year = ((number - 1) / self.blocks_per_year) as usize;
        self.yearly_rewards
            .get(year)
            .map_or(0, |milli| *milli as u128 * BASE_UNITS_PER_MILLI)
    }
}
