//! Tests for recoverable ECDSA signatures

use dposbft_crypto::ecdsa::recover_public_key;
use dposbft_crypto::{recover_address, CryptoError, PrivateKey, PublicKey};
use dposbft_types::{Address, DposSignature, H256};

const TEST_KEY: &str = "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";

#[test]
fn test_private_key_from_hex() {
    let key = PrivateKey::from_hex(TEST_KEY).unwrap();
    assert_eq!(hex::encode(key.to_bytes()), &TEST_KEY[2..]);

    assert!(matches!(
        PrivateKey::from_hex("0x1234"),
        Err(CryptoError::InvalidLength { expected: 32, actual: 2 })
    ));
    assert!(PrivateKey::from_hex("not hex").is_err());
}

#[test]
fn test_address_derivation_known_vector() {
    let key = PrivateKey::from_hex(TEST_KEY).unwrap();
    assert_eq!(
        key.address(),
        Address::from_hex("0x2c7536e3605d9c16a7a3d7b1898e529396a65c23").unwrap()
    );
}

#[test]
fn test_public_key_sec1_roundtrip() {
    let public = PrivateKey::random().public_key();
    let compressed = public.to_compressed();
    assert_eq!(PublicKey::from_sec1_bytes(&compressed).unwrap(), public);

    let mut tagged = vec![0x04];
    tagged.extend_from_slice(&public.to_uncompressed());
    assert_eq!(PublicKey::from_sec1_bytes(&tagged).unwrap(), public);
}

#[test]
fn test_sign_and_recover() {
    let key = PrivateKey::random();
    let digest = H256::keccak256(b"seal me");
    let sig = key.sign_hash(&digest).unwrap();

    assert!(!sig.is_empty());
    assert!(sig.as_bytes()[64] <= 1);
    assert_eq!(recover_address(&digest, &sig).unwrap(), key.address());
    assert_eq!(recover_public_key(&digest, &sig).unwrap(), key.public_key());
}

#[test]
fn test_recover_with_other_digest_gives_other_signer() {
    let key = PrivateKey::random();
    let sig = key.sign_hash(&H256::keccak256(b"one")).unwrap();
    let recovered = recover_address(&H256::keccak256(b"two"), &sig);
    if let Ok(addr) = recovered {
        assert_ne!(addr, key.address());
    }
}

#[test]
fn test_legacy_recovery_id() {
    let key = PrivateKey::random();
    let digest = H256::keccak256(b"legacy");
    let sig = key.sign_hash(&digest).unwrap();

    let mut bytes = *sig.as_bytes();
    bytes[64] += 27;
    let legacy = DposSignature::new(bytes);
    assert_eq!(recover_address(&digest, &legacy).unwrap(), key.address());
}

#[test]
fn test_empty_signature_does_not_recover() {
    let digest = H256::keccak256(b"nothing");
    assert!(recover_address(&digest, &DposSignature::EMPTY).is_err());
}

#[test]
fn test_signing_is_deterministic() {
    let key = PrivateKey::from_hex(TEST_KEY).unwrap();
    let digest = H256::keccak256(b"rfc6979");
    assert_eq!(key.sign_hash(&digest).unwrap(), key.sign_hash(&digest).unwrap());
}
