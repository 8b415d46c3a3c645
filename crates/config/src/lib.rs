//! # DPoS-BFT Configuration
//!
//! Node configuration for the DPoS-BFT consensus core, loaded from a single
//! `dposbft.toml` file.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use dposbft_config::Config;
//! use std::path::Path;
//!
//! let config = Config::load(Path::new("dposbft.toml"))?;
//! println!("validators per term: {}", config.dpos.validators_len());
//! println!("quorum reached: {}", config.dpos.certificate(3));
//! ```
//!
//! ## Configuration Sections
//!
//! - `[chain]` - Chain identity (chain_id, network_id)
//! - `[dpos]` - Committee sizes, timing and election parameters
//! - `[genesis]` - Genesis committee and header values
//! - `[rewards]` - Block reward schedule
//! - `[network]` - Validator node addresses
//! - `[storage]` - Consensus database location
//! - `[logging]` - Log level and format

mod config;
mod dpos;
mod error;
mod genesis;
mod rewards;

pub use config::*;
pub use dpos::*;
pub use error::*;
pub use genesis::*;
pub use rewards::*;
