//! 65-byte recoverable signature carried in headers.

use crate::{Error, Result};
use rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Length of a recoverable secp256k1 signature: r (32) || s (32) || v (1).
pub const SIGNATURE_LENGTH: usize = 65;

/// A recoverable signature as stored in a header's seal and sigs slots.
///
/// An all-zero value means "no signature yet"; headers are broadcast with
/// empty slots that validators fill in as they sign.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DposSignature([u8; SIGNATURE_LENGTH]);

impl DposSignature {
    /// The empty (all-zero) signature.
    pub const EMPTY: Self = Self([0u8; SIGNATURE_LENGTH]);

    /// Wraps raw signature bytes.
    pub const fn new(bytes: [u8; SIGNATURE_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Creates a signature from a slice of exactly 65 bytes.
    pub fn from_slice(slice: &[u8]) -> Result<Self> {
        if slice.len() != SIGNATURE_LENGTH {
            return Err(Error::InvalidLength {
                expected: SIGNATURE_LENGTH,
                actual: slice.len(),
            });
        }
        let mut bytes = [0u8; SIGNATURE_LENGTH];
        bytes.copy_from_slice(slice);
        Ok(Self(bytes))
    }

    /// True if every byte is zero.
    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; SIGNATURE_LENGTH] {
        &self.0
    }
}

impl Default for DposSignature {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl fmt::Debug for DposSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            f.write_str("DposSignature(empty)")
        } else {
            write!(f, "DposSignature(0x{})", hex::encode(self.0))
        }
    }
}

impl From<[u8; SIGNATURE_LENGTH]> for DposSignature {
    fn from(bytes: [u8; SIGNATURE_LENGTH]) -> Self {
        Self(bytes)
    }
}

impl Serialize for DposSignature {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("0x{}", hex::encode(self.0)))
    }
}

impl<'de> Deserialize<'de> for DposSignature {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(s.strip_prefix("0x").unwrap_or(&s))
            .map_err(serde::de::Error::custom)?;
        Self::from_slice(&bytes).map_err(serde::de::Error::custom)
    }
}

impl Encodable for DposSignature {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.encoder().encode_value(&self.0);
    }
}

impl Decodable for DposSignature {
    fn decode(rlp: &Rlp<'_>) -> std::result::Result<Self, DecoderError> {
        rlp.decoder().decode_value(|bytes| {
            if bytes.len() != SIGNATURE_LENGTH {
                return Err(DecoderError::RlpInvalidLength);
            }
            let mut arr = [0u8; SIGNATURE_LENGTH];
            arr.copy_from_slice(bytes);
            Ok(Self(arr))
        })
    }
}
