//! # DPoS-BFT Types
//!
//! Chain types shared by every crate of the DPoS-BFT consensus core.
//!
//! - [`Address`] - 20-byte account identifiers for proposers, validators and candidates
//! - [`H256`] - 32-byte Keccak256 digests (block hashes, roots)
//! - [`DposSignature`] - 65-byte recoverable secp256k1 signatures
//! - [`Header`] and [`Block`] - block structures carrying the [`DposSnap`] extension
//!
//! ## Example
//!
//! ```rust
//! use dposbft_types::{Address, Header, H256};
//!
//! let mut header = Header::default();
//! header.number = 1;
//! header.coinbase = Address::from_low_u64(7);
//!
//! assert!(!header.is_impeachment());
//! assert_ne!(header.hash(), H256::ZERO);
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

pub mod address;
pub mod block;
pub mod hash;
pub mod signature;

pub use address::Address;
pub use block::{Block, BlockIdentifier, Bloom, DposSnap, Header, RawTransaction};
pub use hash::{H256, EMPTY_ROOT};
pub use signature::{DposSignature, SIGNATURE_LENGTH};

/// Result type alias for type-level operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while parsing or decoding chain types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid hex string
    #[error("invalid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    /// Invalid length for a fixed-size type
    #[error("invalid length: expected {expected}, got {actual}")]
    InvalidLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Invalid address format
    #[error("invalid address format: {0}")]
    InvalidAddress(String),

    /// Invalid hash format
    #[error("invalid hash format: {0}")]
    InvalidHash(String),

    /// Malformed block encoding
    #[error("invalid block: {0}")]
    InvalidBlock(String),

    /// RLP decoding error
    #[error("RLP decode error: {0}")]
    RlpDecode(#[from] rlp::DecoderError),
}
