//! Configuration error types

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur during configuration loading and validation
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read configuration file
    #[error("Failed to read config file at {path}: {source}")]
    FileRead {
        /// Path that failed
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: std::io::Error,
    },

    /// Failed to write configuration file
    #[error("Failed to write config file at {path}: {source}")]
    FileWrite {
        /// Path that failed
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse TOML configuration
    #[error("Failed to parse TOML config: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// Failed to render TOML configuration
    #[error("Failed to serialize TOML config: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    /// Invalid chain ID (must be non-zero)
    #[error("Invalid chain ID: chain_id must be non-zero")]
    InvalidChainId,

    /// Term length must be positive
    #[error("Invalid term length: term_len must be positive")]
    InvalidTermLen,

    /// View length must be positive
    #[error("Invalid view length: view_len must be positive")]
    InvalidViewLen,

    /// Gas limit bounds are inverted
    #[error("Invalid gas limit range: min {min} exceeds max {max}")]
    InvalidGasLimitRange {
        /// Configured minimum
        min: u64,
        /// Configured maximum
        max: u64,
    },

    /// Genesis gas limit outside the configured bounds
    #[error("Genesis gas limit {0} is outside the configured range")]
    GenesisGasLimit(u64),

    /// Invalid percentage value
    #[error("Invalid {name}: must be <= 100, got {value}")]
    InvalidPercentage {
        /// Field name
        name: &'static str,
        /// Offending value
        value: u64,
    },

    /// Low-reputation seats exceed the committee size
    #[error("Invalid low_rpt_seats: {seats} exceeds term length {term_len}")]
    InvalidLowRptSeats {
        /// Configured seats
        seats: usize,
        /// Committee size
        term_len: usize,
    },

    /// Genesis validator list does not match 3f + 1
    #[error("Genesis validator count mismatch: expected {expected}, got {actual}")]
    GenesisValidatorCount {
        /// Required count
        expected: usize,
        /// Configured count
        actual: usize,
    },

    /// Genesis proposer list does not match the term length
    #[error("Genesis proposer count mismatch: expected {expected}, got {actual}")]
    GenesisProposerCount {
        /// Required count
        expected: usize,
        /// Configured count
        actual: usize,
    },

    /// Duplicate address in a genesis committee
    #[error("Duplicate genesis {role}: {address}")]
    DuplicateMember {
        /// Committee name
        role: &'static str,
        /// Duplicated address
        address: String,
    },

    /// Rewards schedule without a year length
    #[error("Invalid rewards: blocks_per_year must be positive")]
    InvalidBlocksPerYear,

    /// Invalid log level
    #[error("Invalid log level: {0}. Valid values: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    /// Invalid log format
    #[error("Invalid log format: {0}. Valid values: text, json, compact")]
    InvalidLogFormat(String),

    /// Invalid validator node URL
    #[error("Invalid validator node URL for {address}: {url}")]
    InvalidNodeUrl {
        /// Validator address
        address: String,
        /// Offending URL
        url: String,
    },
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;
