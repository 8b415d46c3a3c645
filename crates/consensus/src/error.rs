//! Error types for the consensus engine and its peer protocol.
//!
//! [`DposError`] covers block validity and internal failures. [`ProtocolError`]
//! is what the peer layer sees; most variants map onto a wire-level
//! [`ErrorCode`] that usually ends the session.

use crate::types::LbftState;
use dposbft_crypto::CryptoError;
use dposbft_storage::StorageError;
use dposbft_types::H256;
use std::fmt;
use thiserror::Error;

/// Consensus errors
#[derive(Error, Debug)]
pub enum DposError {
    /// Block is not part of the local chain (or is the genesis block)
    #[error("unknown block")]
    UnknownBlock,

    /// A required ancestor header is missing
    #[error("unknown ancestor")]
    UnknownAncestor,

    /// Timestamp outside `[parent + period, parent + period + impeach_timeout]`
    #[error("invalid timestamp")]
    InvalidTimestamp,

    /// Gas limit out of range or gas used above limit
    #[error("invalid gas limit for the block")]
    InvalidGasLimit,

    /// Headers applied to a snapshot are not contiguous
    #[error("invalid voting chain")]
    InvalidChain,

    /// Impeach block state root differs from its parent's
    #[error("invalid impeach state root")]
    InvalidImpeachStateRoot,

    /// Impeach block carries transactions
    #[error("invalid impeach transactions root")]
    InvalidImpeachTxsRoot,

    /// Impeach block carries receipts
    #[error("invalid impeach receipts root")]
    InvalidImpeachReceiptsRoot,

    /// Impeach block has a non-zero bloom
    #[error("invalid impeach logs bloom")]
    InvalidImpeachLogsBloom,

    /// Impeach block gas limit differs from its parent's
    #[error("invalid impeach gas limit")]
    InvalidImpeachGasLimit,

    /// Impeach block reports gas usage
    #[error("invalid impeach gas used")]
    InvalidImpeachGasUsed,

    /// Impeach block extra data is not 65 zero bytes
    #[error("invalid impeach extra")]
    InvalidImpeachExtra,

    /// Impeach block seal or committees differ from the canonical impeach block
    #[error("invalid impeach dpos snap")]
    InvalidImpeachDposSnap,

    /// Declared proposers differ from the snapshot
    #[error("invalid signer list on checkpoint block")]
    InvalidSigners,

    /// Seal was not produced by the proposer of this height
    #[error("unauthorized")]
    Unauthorized,

    /// Local coinbase is not in the proposer committee
    #[error("not in proposer committee")]
    NotInProposerCommittee,

    /// Address not found in the proposer committee
    #[error("proposer not in committee")]
    ProposerNotInCommittee,

    /// Address not found in the validator committee
    #[error("validator not in committee")]
    ValidatorNotInCommittee,

    /// Fewer recovered validator signatures than the certificate requires
    #[error("not enough signatures to reach the certificate")]
    NotEnoughSigs,

    /// Signature list length differs from the validator committee size
    #[error("invalid signature list length: expected {expected}, got {actual}")]
    InvalidSigsLength {
        /// Configured committee size
        expected: usize,
        /// Slots in the header
        actual: usize,
    },

    /// A proposed block declares a validator list
    #[error("validators list is not empty")]
    InvalidValidatorsList,

    /// Signing requested in a state that carries no signature
    #[error("the state {0} is unexpected for signing header")]
    InvalidStateForSign(LbftState),

    /// Commit signature already given to another block at this height
    #[error("multi blocks in one height: #{number} already signed {signed}, refusing {requested}")]
    MultiBlocksInOneHeight {
        /// Height
        number: u64,
        /// Hash already signed
        signed: H256,
        /// Hash refused
        requested: H256,
    },

    /// Zero-period chains refuse to seal empty blocks
    #[error("waiting for transactions")]
    WaitTransactions,

    /// Failure injected by a test verification strategy
    #[error("fake failure at #{0}")]
    FakeFail(u64),

    /// No signer has been authorized, or the signer does not own the account
    #[error("no signer available for {0}")]
    SignerUnavailable(String),

    /// The chain rejected the block body
    #[error("invalid block body: {0}")]
    InvalidBlockBody(String),

    /// Chain backend failure
    #[error("chain error: {0}")]
    Chain(String),

    /// A required collaborator was never wired in
    #[error("{0} is not available")]
    ServiceUnavailable(&'static str),

    /// Engine configuration is unusable
    #[error("invalid dpos configuration: {0}")]
    InvalidConfig(String),

    /// Storage failure
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Signature failure
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Malformed chain data
    #[error("types error: {0}")]
    Types(#[from] dposbft_types::Error),
}

/// Result type for consensus operations
pub type Result<T> = std::result::Result<T, DposError>;

/// Protocol error codes reported to peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Message larger than the protocol allows
    MsgTooLarge,
    /// Payload failed to decode
    Decode,
    /// Code outside the protocol's range
    InvalidMsgCode,
    /// Handshake version differs
    ProtocolVersionMismatch,
    /// Handshake network id differs
    NetworkIdMismatch,
    /// Handshake genesis differs
    GenesisBlockMismatch,
    /// First message was not a status message
    NoStatusMsg,
    /// Status message could not be extracted or verified
    ExtraStatusMsg,
    /// Remote signer stopped responding
    SuspendedPeer,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCode::MsgTooLarge => "Message too long",
            ErrorCode::Decode => "Invalid message",
            ErrorCode::InvalidMsgCode => "Invalid message code",
            ErrorCode::ProtocolVersionMismatch => "Protocol version mismatch",
            ErrorCode::NetworkIdMismatch => "NetworkId mismatch",
            ErrorCode::GenesisBlockMismatch => "Genesis block mismatch",
            ErrorCode::NoStatusMsg => "No status message",
            ErrorCode::ExtraStatusMsg => "Extra status message",
            ErrorCode::SuspendedPeer => "Suspended peer",
        };
        f.write_str(s)
    }
}

/// Peer protocol errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Error reported to the remote peer
    #[error("{code} - {detail}")]
    Peer {
        /// Wire error code
        code: ErrorCode,
        /// Human readable detail
        detail: String,
    },

    /// Payload failed RLP decoding
    #[error("Invalid message - {0}")]
    Decode(#[from] rlp::DecoderError),

    /// Remote address is not in any committee the local node tracks
    #[error("remote peer is not in the committees")]
    NotSigner,

    /// The mined-block queue is full
    #[error("fail to add pending block")]
    PendingBlockQueueFull,

    /// The session or its outbound queue has closed
    #[error("peer disconnected")]
    Disconnected,

    /// Consensus failure while serving the peer
    #[error(transparent)]
    Dpos(#[from] DposError),
}

impl ProtocolError {
    /// Build an error carrying a wire code.
    pub fn new(code: ErrorCode, detail: impl Into<String>) -> Self {
        ProtocolError::Peer {
            code,
            detail: detail.into(),
        }
    }

    /// Wire code of this error, if it has one.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            ProtocolError::Peer { code, .. } => Some(*code),
            ProtocolError::Decode(_) => Some(ErrorCode::Decode),
            ProtocolError::Disconnected => Some(ErrorCode::SuspendedPeer),
            _ => None,
        }
    }
}

impl From<CryptoError> for ProtocolError {
    fn from(e: CryptoError) -> Self {
        ProtocolError::Dpos(DposError::Crypto(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_strings() {
        let err = ProtocolError::new(ErrorCode::MsgTooLarge, "11534336 > 10485760");
        assert_eq!(err.to_string(), "Message too long - 11534336 > 10485760");
        assert_eq!(err.code(), Some(ErrorCode::MsgTooLarge));

        let err = ProtocolError::from(rlp::DecoderError::RlpIsTooShort);
        assert_eq!(err.code(), Some(ErrorCode::Decode));
        assert!(ProtocolError::NotSigner.code().is_none());
    }

    #[test]
    fn test_double_sign_message() {
        let err = DposError::MultiBlocksInOneHeight {
            number: 7,
            signed: H256::ZERO,
            requested: H256::keccak256(b"other"),
        };
        assert!(err.to_string().starts_with("multi blocks in one height: #7"));
    }
}
