//! Recoverable ECDSA over secp256k1.
//!
//! Signatures are laid out as `r || s || v` with `v` the raw recovery id
//! (0 or 1). Legacy `27`/`28` values are normalised on recovery.

use crate::{CryptoError, Result};
use dposbft_types::{Address, DposSignature, H256};
use k256::{
    ecdsa::{RecoveryId, Signature as K256Signature, SigningKey, VerifyingKey},
    elliptic_curve::sec1::ToEncodedPoint,
    SecretKey,
};
use rand::rngs::OsRng;

/// secp256k1 secret key.
#[derive(Clone)]
pub struct PrivateKey {
    inner: SigningKey,
}

impl PrivateKey {
    /// Generate a random key from the OS RNG.
    pub fn random() -> Self {
        Self {
            inner: SigningKey::from(SecretKey::random(&mut OsRng)),
        }
    }

    /// Create a private key from raw bytes.
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self> {
        let secret_key = SecretKey::from_bytes(bytes.into())
            .map_err(|e| CryptoError::InvalidPrivateKey(e.to_string()))?;
        Ok(Self {
            inner: SigningKey::from(secret_key),
        })
    }

    /// Parse a hex key, with or without `0x`.
    pub fn from_hex(hex: &str) -> Result<Self> {
        let bytes = hex::decode(hex.trim().strip_prefix("0x").unwrap_or(hex.trim()))?;
        if bytes.len() != 32 {
            return Err(CryptoError::InvalidLength {
                expected: 32,
                actual: bytes.len(),
            });
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Self::from_bytes(&arr)
    }

    /// Raw secret bytes.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.inner.to_bytes().into()
    }

    /// The matching public key.
    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            inner: *self.inner.verifying_key(),
        }
    }

    /// Address of the matching public key.
    pub fn address(&self) -> Address {
        self.public_key().to_address()
    }

    /// Sign a 32-byte digest, returning `r || s || v`.
    pub fn sign_hash(&self, hash: &H256) -> Result<DposSignature> {
        let (sig, recovery_id) = self
            .inner
            .sign_prehash_recoverable(hash.as_bytes())
            .map_err(|e| CryptoError::InvalidSignature(e.to_string()))?;

        let mut bytes = [0u8; 65];
        bytes[..64].copy_from_slice(&sig.to_bytes());
        bytes[64] = recovery_id.to_byte();
        Ok(DposSignature::new(bytes))
    }
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivateKey")
            .field("address", &self.address())
            .finish()
    }
}

/// secp256k1 public key.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey {
    inner: VerifyingKey,
}

impl PublicKey {
    /// Parse SEC1 bytes (33-byte compressed or 65-byte uncompressed).
    pub fn from_sec1_bytes(bytes: &[u8]) -> Result<Self> {
        let inner = VerifyingKey::from_sec1_bytes(bytes)
            .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;
        Ok(Self { inner })
    }

    /// Uncompressed point without the 0x04 tag.
    pub fn to_uncompressed(&self) -> [u8; 64] {
        let point = self.inner.to_encoded_point(false);
        let mut out = [0u8; 64];
        out.copy_from_slice(&point.as_bytes()[1..65]);
        out
    }

    /// Compressed SEC1 encoding.
    pub fn to_compressed(&self) -> [u8; 33] {
        let point = self.inner.to_encoded_point(true);
        let mut out = [0u8; 33];
        out.copy_from_slice(point.as_bytes());
        out
    }

    /// Last 20 bytes of keccak256 over the uncompressed point.
    pub fn to_address(&self) -> Address {
        Address::from_public_key(&self.to_uncompressed())
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublicKey")
            .field("compressed", &hex::encode(self.to_compressed()))
            .finish()
    }
}

/// Recover the public key that produced `signature` over `hash`.
pub fn recover_public_key(hash: &H256, signature: &DposSignature) -> Result<PublicKey> {
    let bytes = signature.as_bytes();
    let sig = K256Signature::from_slice(&bytes[..64])
        .map_err(|e| CryptoError::InvalidSignature(e.to_string()))?;

    let v = if bytes[64] >= 27 { bytes[64] - 27 } else { bytes[64] };
    let recovery_id = RecoveryId::from_byte(v)
        .ok_or_else(|| CryptoError::RecoveryFailed(format!("invalid recovery id {}", v)))?;

    let inner = VerifyingKey::recover_from_prehash(hash.as_bytes(), &sig, recovery_id)
        .map_err(|e| CryptoError::RecoveryFailed(e.to_string()))?;
    Ok(PublicKey { inner })
}

/// Recover the signer address of `signature` over `hash`.
pub fn recover_address(hash: &H256, signature: &DposSignature) -> Result<Address> {
    Ok(recover_public_key(hash, signature)?.to_address())
}
