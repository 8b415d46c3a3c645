//! Wire format of the `dpos` peer protocol.
//!
//! Every message is an RLP payload tagged with a code in `0x42..=0x50`.
//! Sessions open with a [`SignerStatus`] handshake carrying a signed,
//! timestamped MAC that identifies the remote signer's account.
//!
//! | Code   | Message                  | Payload |
//! |--------|--------------------------|---------|
//! | `0x42` | new signer               | status  |
//! | `0x43` | preprepare block         | block   |
//! | `0x44` | prepare header           | header  |
//! | `0x45` | commit header            | header  |
//! | `0x46` | validate block           | block   |
//! | `0x47` | preprepare impeach block | block   |
//! | `0x48` | prepare impeach header   | header  |
//! | `0x49` | commit impeach header    | header  |
//! | `0x50` | validate impeach block   | block   |

use crate::error::{ErrorCode, ProtocolError};
use crate::service::MAC_PREFIX;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dposbft_crypto::recover_address;
use dposbft_types::{Address, Block, BlockIdentifier, DposSignature, Header, H256};
use rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream};
use std::time::Duration;

/// Protocol name.
pub const PROTOCOL_NAME: &str = "dpos";

/// Protocol version.
pub const PROTOCOL_VERSION: u32 = 65;

/// Number of message codes reserved by the protocol.
pub const PROTOCOL_LENGTH: u64 = 100;

/// Maximum payload size.
pub const PROTOCOL_MAX_MSG_SIZE: usize = 10 * 1024 * 1024;

/// How far a handshake MAC's timestamp may be from local time.
pub const MAC_VALIDITY: Duration = Duration::from_secs(20);

/// Message codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u64)]
pub enum MsgCode {
    /// Handshake
    NewSigner = 0x42,
    /// Proposed block
    PreprepareBlock = 0x43,
    /// Header carrying prepare signatures
    PrepareHeader = 0x44,
    /// Header carrying commit signatures
    CommitHeader = 0x45,
    /// Finished block
    ValidateBlock = 0x46,
    /// Proposed impeach block
    PreprepareImpeachBlock = 0x47,
    /// Impeach header carrying prepare signatures
    PrepareImpeachHeader = 0x48,
    /// Impeach header carrying commit signatures
    CommitImpeachHeader = 0x49,
    /// Finished impeach block
    ValidateImpeachBlock = 0x50,
}

impl TryFrom<u64> for MsgCode {
    type Error = ProtocolError;

    fn try_from(code: u64) -> Result<Self, Self::Error> {
        Ok(match code {
            0x42 => MsgCode::NewSigner,
            0x43 => MsgCode::PreprepareBlock,
            0x44 => MsgCode::PrepareHeader,
            0x45 => MsgCode::CommitHeader,
            0x46 => MsgCode::ValidateBlock,
            0x47 => MsgCode::PreprepareImpeachBlock,
            0x48 => MsgCode::PrepareImpeachHeader,
            0x49 => MsgCode::CommitImpeachHeader,
            0x50 => MsgCode::ValidateImpeachBlock,
            other => {
                return Err(ProtocolError::new(
                    ErrorCode::InvalidMsgCode,
                    format!("{other:#x}"),
                ))
            }
        })
    }
}

/// Whether `code` belongs to this protocol rather than block sync.
pub fn is_dpos_msg(code: u64) -> bool {
    code >= MsgCode::NewSigner as u64
}

/// A message as carried by a [`PeerSession`](crate::chain::PeerSession).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    /// Message code
    pub code: u64,
    /// RLP payload
    pub payload: Bytes,
}

impl RawMessage {
    /// Wrap an encoded payload.
    pub fn new(code: MsgCode, payload: impl Into<Bytes>) -> Self {
        Self {
            code: code as u64,
            payload: payload.into(),
        }
    }

    /// Payload size in bytes.
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

/// Handshake payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignerStatus {
    /// Sender's protocol version
    pub protocol_version: u32,
    /// `gcchain|<RFC3339 time>`
    pub mac: String,
    /// Sender's signature over `keccak256(mac)`
    pub sig: DposSignature,
}

impl Encodable for SignerStatus {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(3);
        s.append(&self.protocol_version);
        s.append(&self.mac);
        s.append(&self.sig);
    }
}

impl Decodable for SignerStatus {
    fn decode(rlp: &Rlp<'_>) -> Result<Self, DecoderError> {
        if rlp.item_count()? != 3 {
            return Err(DecoderError::RlpIncorrectListLen);
        }
        Ok(Self {
            protocol_version: rlp.val_at(0)?,
            mac: rlp.val_at(1)?,
            sig: rlp.val_at(2)?,
        })
    }
}

/// Check a handshake MAC against `now` and recover the account that signed it.
pub fn validate_mac_sig(mac: &str, sig: &DposSignature, now: DateTime<Utc>) -> Result<Address, ProtocolError> {
    let invalid = |detail: String| ProtocolError::new(ErrorCode::ExtraStatusMsg, detail);

    let (prefix, timestamp) = mac
        .split_once('|')
        .ok_or_else(|| invalid(format!("malformed mac {mac:?}")))?;
    if prefix != MAC_PREFIX {
        return Err(invalid(format!("unexpected mac prefix {prefix:?}")));
    }
    let sent = DateTime::parse_from_rfc3339(timestamp)
        .map_err(|e| invalid(format!("mac time: {e}")))?
        .with_timezone(&Utc);

    let skew = (now - sent).num_milliseconds().unsigned_abs();
    if skew > MAC_VALIDITY.as_millis() as u64 {
        return Err(invalid(format!("mac expired: {skew}ms off")));
    }

    Ok(recover_address(&H256::keccak256(mac.as_bytes()), sig)?)
}

/// Decoded protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Handshake
    NewSigner(SignerStatus),
    /// Proposed block
    Preprepare(Block),
    /// Proposed impeach block
    PreprepareImpeach(Block),
    /// Header with prepare signatures
    Prepare(Header),
    /// Impeach header with prepare signatures
    PrepareImpeach(Header),
    /// Header with commit signatures
    Commit(Header),
    /// Impeach header with commit signatures
    CommitImpeach(Header),
    /// Finished block
    Validate(Block),
    /// Finished impeach block
    ValidateImpeach(Block),
}

impl Message {
    /// Wire code.
    pub fn code(&self) -> MsgCode {
        match self {
            Message::NewSigner(_) => MsgCode::NewSigner,
            Message::Preprepare(_) => MsgCode::PreprepareBlock,
            Message::PreprepareImpeach(_) => MsgCode::PreprepareImpeachBlock,
            Message::Prepare(_) => MsgCode::PrepareHeader,
            Message::PrepareImpeach(_) => MsgCode::PrepareImpeachHeader,
            Message::Commit(_) => MsgCode::CommitHeader,
            Message::CommitImpeach(_) => MsgCode::CommitImpeachHeader,
            Message::Validate(_) => MsgCode::ValidateBlock,
            Message::ValidateImpeach(_) => MsgCode::ValidateImpeachBlock,
        }
    }

    /// Block the message is about.
    pub fn identifier(&self) -> Option<BlockIdentifier> {
        match self {
            Message::NewSigner(_) => None,
            Message::Preprepare(b)
            | Message::PreprepareImpeach(b)
            | Message::Validate(b)
            | Message::ValidateImpeach(b) => Some(b.identifier()),
            Message::Prepare(h)
            | Message::PrepareImpeach(h)
            | Message::Commit(h)
            | Message::CommitImpeach(h) => Some(h.identifier()),
        }
    }

    /// Encode for the wire.
    pub fn encode(&self) -> RawMessage {
        let payload = match self {
            Message::NewSigner(status) => rlp::encode(status),
            Message::Preprepare(b)
            | Message::PreprepareImpeach(b)
            | Message::Validate(b)
            | Message::ValidateImpeach(b) => rlp::encode(b),
            Message::Prepare(h)
            | Message::PrepareImpeach(h)
            | Message::Commit(h)
            | Message::CommitImpeach(h) => rlp::encode(h),
        };
        RawMessage::new(self.code(), payload.freeze())
    }

    /// Decode a message received from a peer.
    pub fn decode(raw: &RawMessage) -> Result<Self, ProtocolError> {
        if raw.size() > PROTOCOL_MAX_MSG_SIZE {
            return Err(ProtocolError::new(
                ErrorCode::MsgTooLarge,
                format!("{} > {}", raw.size(), PROTOCOL_MAX_MSG_SIZE),
            ));
        }
        let code = MsgCode::try_from(raw.code)?;
        let payload = &raw.payload[..];
        Ok(match code {
            MsgCode::NewSigner => Message::NewSigner(rlp::decode(payload)?),
            MsgCode::PreprepareBlock => Message::Preprepare(rlp::decode(payload)?),
            MsgCode::PreprepareImpeachBlock => Message::PreprepareImpeach(rlp::decode(payload)?),
            MsgCode::PrepareHeader => Message::Prepare(rlp::decode(payload)?),
            MsgCode::PrepareImpeachHeader => Message::PrepareImpeach(rlp::decode(payload)?),
            MsgCode::CommitHeader => Message::Commit(rlp::decode(payload)?),
            MsgCode::CommitImpeachHeader => Message::CommitImpeach(rlp::decode(payload)?),
            MsgCode::ValidateBlock => Message::Validate(rlp::decode(payload)?),
            MsgCode::ValidateImpeachBlock => Message::ValidateImpeach(rlp::decode(payload)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::compose_mac;
    use dposbft_crypto::PrivateKey;

    #[test]
    fn test_msg_codes() {
        assert_eq!(MsgCode::try_from(0x42).unwrap(), MsgCode::NewSigner);
        assert_eq!(MsgCode::try_from(0x50).unwrap(), MsgCode::ValidateImpeachBlock);
        assert_eq!(
            MsgCode::try_from(0x4a).unwrap_err().code(),
            Some(ErrorCode::InvalidMsgCode)
        );
        assert!(!is_dpos_msg(0x10));
        assert!(is_dpos_msg(0x45));
    }

    #[test]
    fn test_header_message_keeps_sigs() {
        let mut header = Header {
            number: 9,
            ..Default::default()
        };
        header.dpos.sigs = vec![DposSignature::new([3; 65]), DposSignature::EMPTY];
        let msg = Message::Commit(header.clone());
        let raw = msg.encode();
        assert_eq!(raw.code, 0x45);
        assert_eq!(Message::decode(&raw).unwrap(), msg);
        assert_eq!(msg.identifier(), Some(header.identifier()));
    }

    #[test]
    fn test_oversized_and_garbage() {
        let raw = RawMessage::new(MsgCode::PreprepareBlock, vec![0u8; PROTOCOL_MAX_MSG_SIZE + 1]);
        assert_eq!(Message::decode(&raw).unwrap_err().code(), Some(ErrorCode::MsgTooLarge));

        let raw = RawMessage::new(MsgCode::PreprepareBlock, vec![0x01]);
        assert_eq!(Message::decode(&raw).unwrap_err().code(), Some(ErrorCode::Decode));
    }

    #[test]
    fn test_mac_window() {
        let key = PrivateKey::random();
        let now = Utc::now();
        let mac = compose_mac(&now.to_rfc3339());
        let sig = key.sign_hash(&H256::keccak256(mac.as_bytes())).unwrap();

        assert_eq!(validate_mac_sig(&mac, &sig, now).unwrap(), key.address());
        assert_eq!(
            validate_mac_sig(&mac, &sig, now + chrono::Duration::seconds(19)).unwrap(),
            key.address()
        );
        assert!(validate_mac_sig(&mac, &sig, now + chrono::Duration::seconds(21)).is_err());
        assert!(validate_mac_sig("other|2019-02-26T16:22:21+08:00", &sig, now).is_err());
        assert!(validate_mac_sig("gcchain|yesterday", &sig, now).is_err());
    }

    #[test]
    fn test_status_roundtrip() {
        let status = SignerStatus {
            protocol_version: PROTOCOL_VERSION,
            mac: compose_mac("2019-02-26T16:22:21+08:00"),
            sig: DposSignature::new([7; 65]),
        };
        let raw = Message::NewSigner(status.clone()).encode();
        assert_eq!(Message::decode(&raw).unwrap(), Message::NewSigner(status));
    }
}
