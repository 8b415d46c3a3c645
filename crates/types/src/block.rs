//! Block and header types.
//!
//! - [`Header`] - block metadata plus the [`DposSnap`] consensus extension
//! - [`Block`] - a header with its opaque transaction payloads
//! - [`BlockIdentifier`] - `(number, hash)` pair used as a cache key
//! - [`Bloom`] - 256-byte log bloom, carried but never interpreted here

use crate::{Address, DposSignature, Error, Result, EMPTY_ROOT, H256};
use rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Size of a log bloom in bytes
pub const BLOOM_SIZE: usize = 256;

/// Opaque transaction payload. Execution lives outside this workspace.
pub type RawTransaction = Vec<u8>;

/// 256-byte log bloom filter.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Bloom([u8; BLOOM_SIZE]);

impl Bloom {
    /// The empty bloom.
    pub const ZERO: Self = Self([0u8; BLOOM_SIZE]);

    /// Wraps raw bloom bytes.
    pub const fn new(bytes: [u8; BLOOM_SIZE]) -> Self {
        Self(bytes)
    }

    /// True if no bit is set.
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Default for Bloom {
    fn default() -> Self {
        Self::ZERO
    }
}

impl fmt::Debug for Bloom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_zero() {
            f.write_str("Bloom(0)")
        } else {
            write!(f, "Bloom(0x{}..)", hex::encode(&self.0[..8]))
        }
    }
}

impl Serialize for Bloom {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("0x{}", hex::encode(self.0)))
    }
}

impl<'de> Deserialize<'de> for Bloom {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(s.strip_prefix("0x").unwrap_or(&s))
            .map_err(serde::de::Error::custom)?;
        if bytes.len() != BLOOM_SIZE {
            return Err(serde::de::Error::custom(format!(
                "bloom must be {} bytes, got {}",
                BLOOM_SIZE,
                bytes.len()
            )));
        }
        let mut arr = [0u8; BLOOM_SIZE];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl Encodable for Bloom {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.encoder().encode_value(&self.0);
    }
}

impl Decodable for Bloom {
    fn decode(rlp: &Rlp<'_>) -> std::result::Result<Self, DecoderError> {
        rlp.decoder().decode_value(|bytes| {
            if bytes.len() != BLOOM_SIZE {
                return Err(DecoderError::RlpInvalidLength);
            }
            let mut arr = [0u8; BLOOM_SIZE];
            arr.copy_from_slice(bytes);
            Ok(Self(arr))
        })
    }
}

/// Consensus extension of a header.
///
/// `sigs` has one slot per committee validator (in committee order); a slot
/// stays empty until that validator's signature has been collected.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DposSnap {
    /// Proposer's signature over the header's sig hash
    pub seal: DposSignature,
    /// Validator signatures, one slot per committee member
    pub sigs: Vec<DposSignature>,
    /// Proposer committee for the block's term
    pub proposers: Vec<Address>,
    /// Validator committee announced by the block (empty in normal blocks)
    pub validators: Vec<Address>,
}

impl DposSnap {
    /// Number of non-empty signature slots.
    pub fn signed_count(&self) -> usize {
        self.sigs.iter().filter(|s| !s.is_empty()).count()
    }
}

impl Encodable for DposSnap {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(4);
        s.append(&self.seal);
        s.append_list::<DposSignature, _>(&self.sigs);
        s.append_list::<Address, _>(&self.proposers);
        s.append_list::<Address, _>(&self.validators);
    }
}

impl Decodable for DposSnap {
    fn decode(rlp: &Rlp<'_>) -> std::result::Result<Self, DecoderError> {
        if rlp.item_count()? != 4 {
            return Err(DecoderError::RlpIncorrectListLen);
        }
        Ok(Self {
            seal: rlp.val_at(0)?,
            sigs: rlp.list_at(1)?,
            proposers: rlp.list_at(2)?,
            validators: rlp.list_at(3)?,
        })
    }
}

/// A block header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Hash of the parent block
    pub parent_hash: H256,
    /// Block producer; zero for impeach blocks
    pub coinbase: Address,
    /// World state root after this block
    pub state_root: H256,
    /// Root of the block's transactions
    pub txs_root: H256,
    /// Root of the block's receipts
    pub receipts_root: H256,
    /// Log bloom
    pub logs_bloom: Bloom,
    /// Block height
    pub number: u64,
    /// Gas limit
    pub gas_limit: u64,
    /// Gas used
    pub gas_used: u64,
    /// Unix time in milliseconds
    pub timestamp: u64,
    /// Free-form extra data
    #[serde(with = "hex_bytes")]
    pub extra: Vec<u8>,
    /// Consensus extension
    pub dpos: DposSnap,
}

impl Default for Header {
    fn default() -> Self {
        Self {
            parent_hash: H256::ZERO,
            coinbase: Address::ZERO,
            state_root: H256::ZERO,
            txs_root: EMPTY_ROOT,
            receipts_root: EMPTY_ROOT,
            logs_bloom: Bloom::ZERO,
            number: 0,
            gas_limit: 0,
            gas_used: 0,
            timestamp: 0,
            extra: Vec::new(),
            dpos: DposSnap::default(),
        }
    }
}

impl Header {
    /// Block hash. Covers every field except the seal and the validator
    /// signatures, so the hash is stable while signatures are collected and
    /// is the digest the proposer seals.
    pub fn hash(&self) -> H256 {
        let mut s = RlpStream::new_list(15);
        s.append(&self.parent_hash);
        s.append(&self.coinbase);
        s.append(&self.state_root);
        s.append(&self.txs_root);
        s.append(&self.receipts_root);
        s.append(&self.logs_bloom);
        s.append(&self.number);
        s.append(&self.gas_limit);
        s.append(&self.gas_used);
        s.append(&self.timestamp);
        s.append_list::<Address, _>(&self.dpos.proposers);
        s.append_list::<Address, _>(&self.dpos.validators);
        s.append(&self.extra);
        s.append(&H256::ZERO);
        s.append(&[0u8; 8].to_vec());
        H256::keccak256(&s.out())
    }

    /// The `(number, hash)` identity of this header.
    pub fn identifier(&self) -> BlockIdentifier {
        BlockIdentifier::new(self.number, self.hash())
    }

    /// Impeach blocks are the only blocks with a zero coinbase.
    pub fn is_impeachment(&self) -> bool {
        self.coinbase.is_zero()
    }

    /// Decodes a header from RLP bytes.
    pub fn rlp_decode(data: &[u8]) -> Result<Self> {
        rlp::decode(data).map_err(Error::RlpDecode)
    }
}

impl Encodable for Header {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(12);
        s.append(&self.parent_hash);
        s.append(&self.coinbase);
        s.append(&self.state_root);
        s.append(&self.txs_root);
        s.append(&self.receipts_root);
        s.append(&self.logs_bloom);
        s.append(&self.number);
        s.append(&self.gas_limit);
        s.append(&self.gas_used);
        s.append(&self.timestamp);
        s.append(&self.extra);
        s.append(&self.dpos);
    }
}

impl Decodable for Header {
    fn decode(rlp: &Rlp<'_>) -> std::result::Result<Self, DecoderError> {
        if rlp.item_count()? != 12 {
            return Err(DecoderError::RlpIncorrectListLen);
        }
        Ok(Self {
            parent_hash: rlp.val_at(0)?,
            coinbase: rlp.val_at(1)?,
            state_root: rlp.val_at(2)?,
            txs_root: rlp.val_at(3)?,
            receipts_root: rlp.val_at(4)?,
            logs_bloom: rlp.val_at(5)?,
            number: rlp.val_at(6)?,
            gas_limit: rlp.val_at(7)?,
            gas_used: rlp.val_at(8)?,
            timestamp: rlp.val_at(9)?,
            extra: rlp.val_at(10)?,
            dpos: rlp.val_at(11)?,
        })
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Header #{} (hash: {}, parent: {}, coinbase: {})",
            self.number,
            self.hash(),
            self.parent_hash,
            self.coinbase
        )
    }
}

/// A complete block.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Block {
    /// The block header
    pub header: Header,
    /// Opaque transaction payloads
    #[serde(with = "hex_list")]
    pub transactions: Vec<RawTransaction>,
}

impl Block {
    /// Assembles a block, deriving `txs_root` and `receipts_root` from the payloads.
    pub fn new(mut header: Header, transactions: Vec<RawTransaction>, receipts: &[Vec<u8>]) -> Self {
        header.txs_root = derive_root(&transactions);
        header.receipts_root = derive_root(receipts);
        Self {
            header,
            transactions,
        }
    }

    /// Wraps a header without touching its roots.
    pub fn with_header(header: Header) -> Self {
        Self {
            header,
            transactions: Vec::new(),
        }
    }

    /// Block hash (hash of the header).
    pub fn hash(&self) -> H256 {
        self.header.hash()
    }

    /// Block height.
    pub fn number(&self) -> u64 {
        self.header.number
    }

    /// Parent hash.
    pub fn parent_hash(&self) -> H256 {
        self.header.parent_hash
    }

    /// `(number, hash)` identity.
    pub fn identifier(&self) -> BlockIdentifier {
        self.header.identifier()
    }

    /// Checks that `txs_root` commits to the carried payloads.
    pub fn validate_transactions_root(&self) -> bool {
        self.header.txs_root == derive_root(&self.transactions)
    }

    /// RLP encodes the block as `[header, [tx, ...]]`.
    pub fn rlp_encode(&self) -> Vec<u8> {
        rlp::encode(self).to_vec()
    }

    /// Decodes a block from RLP bytes.
    pub fn rlp_decode(data: &[u8]) -> Result<Self> {
        let rlp = Rlp::new(data);
        if rlp.item_count()? != 2 {
            return Err(Error::InvalidBlock("expected [header, transactions]".into()));
        }
        Ok(Self {
            header: rlp.val_at(0)?,
            transactions: rlp.list_at(1)?,
        })
    }
}

impl Encodable for Block {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(2);
        s.append(&self.header);
        s.begin_list(self.transactions.len());
        for tx in &self.transactions {
            s.append(tx);
        }
    }
}

impl Decodable for Block {
    fn decode(rlp: &Rlp<'_>) -> std::result::Result<Self, DecoderError> {
        if rlp.item_count()? != 2 {
            return Err(DecoderError::RlpIncorrectListLen);
        }
        Ok(Self {
            header: rlp.val_at(0)?,
            transactions: rlp.list_at(1)?,
        })
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Block #{} (hash: {}, {} txs)",
            self.header.number,
            self.hash(),
            self.transactions.len()
        )
    }
}

fn derive_root(items: &[Vec<u8>]) -> H256 {
    if items.is_empty() {
        return EMPTY_ROOT;
    }
    let mut stream = RlpStream::new_list(items.len());
    for item in items {
        stream.append(item);
    }
    H256::keccak256(&stream.out())
}

/// `(number, hash)` pair identifying a block across caches and messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockIdentifier {
    /// Block height
    pub number: u64,
    /// Block hash
    pub hash: H256,
}

impl BlockIdentifier {
    /// Creates a new identifier.
    pub const fn new(number: u64, hash: H256) -> Self {
        Self { number, hash }
    }
}

impl fmt::Display for BlockIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {}", self.number, self.hash.short())
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("0x{}", hex::encode(bytes)))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let s = s.strip_prefix("0x").unwrap_or(&s);
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

mod hex_list {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(items: &[Vec<u8>], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_seq(items.iter().map(|b| format!("0x{}", hex::encode(b))))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Vec::<String>::deserialize(deserializer)?;
        raw.iter()
            .map(|s| hex::decode(s.strip_prefix("0x").unwrap_or(s)).map_err(serde::de::Error::custom))
            .collect()
    }
}
