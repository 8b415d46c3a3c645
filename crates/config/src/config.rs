//! Main configuration module
//!
//! All node settings live in one `dposbft.toml` file. Every section falls
//! back to its dev-network defaults when omitted.

use crate::dpos::DposConfig;
use crate::error::{ConfigError, ConfigResult};
use crate::genesis::GenesisConfig;
use crate::rewards::RewardsConfig;
use dposbft_types::Address;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Main configuration struct.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Chain identity configuration
    pub chain: ChainConfig,

    /// DPoS committee parameters
    pub dpos: DposConfig,

    /// Genesis committees and header values
    pub genesis: GenesisConfig,

    /// Block reward schedule
    pub rewards: RewardsConfig,

    /// Validator networking
    pub network: NetworkConfig,

    /// Consensus database
    pub storage: StorageConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Load and validate configuration from a TOML file.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        info!(?path, "loading configuration");

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: Config = toml::from_str(&content)?;

        debug!("configuration parsed, validating");
        config.validate()?;

        info!(
            chain_id = config.chain.chain_id,
            term_len = config.dpos.term_len,
            validators = config.dpos.validators_len(),
            "configuration loaded"
        );

        Ok(config)
    }

    /// Parse and validate configuration from a TOML string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> ConfigResult<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Render as pretty TOML.
    pub fn to_toml(&self) -> ConfigResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Write the configuration to a TOML file.
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let content = self.to_toml()?;
        std::fs::write(path, content).map_err(|e| ConfigError::FileWrite {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Validate every section and their cross-section constraints.
    pub fn validate(&self) -> ConfigResult<()> {
        self.chain.validate()?;
        self.dpos.validate()?;
        self.genesis.validate(&self.dpos)?;
        self.rewards.validate()?;
        self.network.validate()?;
        self.logging.validate()?;

        debug!("configuration validation passed");
        Ok(())
    }
}

// =============================================================================
// Chain Configuration
// =============================================================================

/// Chain identity configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    /// Unique chain identifier
    pub chain_id: u64,

    /// Network identifier checked during the peer handshake
    pub network_id: u64,
}

impl ChainConfig {
    /// Validate the chain identity.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.chain_id == 0 {
            return Err(ConfigError::InvalidChainId);
        }
        Ok(())
    }
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            chain_id: 42,
            network_id: 42,
        }
    }
}

// =============================================================================
// Network Configuration
// =============================================================================

/// Validator networking configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Node URL of each validator, keyed by validator address
    pub validator_nodes: BTreeMap<Address, String>,

    /// Interval between reconnection sweeps
    pub keep_connection_interval_ms: u64,
}

impl NetworkConfig {
    /// Validate node URLs.
    pub fn validate(&self) -> ConfigResult<()> {
        for (address, url) in &self.validator_nodes {
            if url.trim().is_empty() {
                return Err(ConfigError::InvalidNodeUrl {
                    address: address.to_string(),
                    url: url.clone(),
                });
            }
        }
        Ok(())
    }

    /// Reconnection interval.
    pub fn keep_connection_interval(&self) -> Duration {
        Duration::from_millis(self.keep_connection_interval_ms)
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            validator_nodes: BTreeMap::new(),
            keep_connection_interval_ms: 5_000,
        }
    }
}

// =============================================================================
// Storage Configuration
// =============================================================================

/// Consensus database configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Data directory
    pub data_dir: String,

    /// Enable LZ4 compression
    pub enable_compression: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: "./data".to_string(),
            enable_compression: true,
        }
    }
}

// =============================================================================
// Logging Configuration
// =============================================================================

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json, compact)
    pub format: String,
}

impl LoggingConfig {
    /// Validate level and format names.
    pub fn validate(&self) -> ConfigResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.level.to_lowercase().as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.level.clone()));
        }

        let valid_formats = ["text", "json", "compact"];
        if !valid_formats.contains(&self.format.to_lowercase().as_str()) {
            return Err(ConfigError::InvalidLogFormat(self.format.clone()));
        }

        Ok(())
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}
