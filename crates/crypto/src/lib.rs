//! # DPoS-BFT Crypto
//!
//! secp256k1 primitives used by the consensus engine: proposers seal headers
//! and validators sign prepare/commit digests with recoverable ECDSA, and
//! every verifier recovers the signer's [`Address`](dposbft_types::Address)
//! from the 65-byte signature.
//!
//! ```rust
//! use dposbft_crypto::{recover_address, PrivateKey};
//! use dposbft_types::H256;
//!
//! let key = PrivateKey::random();
//! let digest = H256::keccak256(b"header");
//! let sig = key.sign_hash(&digest).unwrap();
//!
//! assert_eq!(recover_address(&digest, &sig).unwrap(), key.address());
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

pub mod ecdsa;

pub use ecdsa::{recover_address, PrivateKey, PublicKey};

/// Error types for cryptographic operations
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// Invalid private key bytes
    #[error("invalid private key: {0}")]
    InvalidPrivateKey(String),

    /// Invalid public key bytes
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// Invalid signature bytes
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    /// Failed to recover public key from signature
    #[error("failed to recover public key: {0}")]
    RecoveryFailed(String),

    /// Invalid input length
    #[error("invalid input length: expected {expected}, got {actual}")]
    InvalidLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Hex decoding error
    #[error("hex decoding error: {0}")]
    HexError(#[from] hex::FromHexError),
}

/// Result type for cryptographic operations
pub type Result<T> = std::result::Result<T, CryptoError>;
