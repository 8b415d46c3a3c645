//! Collaborators the engine calls into.
//!
//! The consensus core never owns the chain, the keys or the transport; it
//! reaches them through these traits:
//!
//! - [`ChainReader`] / [`ChainReadWriter`] - headers, blocks and insertion
//! - [`Signer`] - signs digests for the local coinbase
//! - [`StateWriter`] - balance credits and state root during finalization
//! - [`RptBackend`], [`RptParameters`], [`ContributionSource`] - reputation inputs
//! - [`CandidateService`], [`RNodeService`] - campaign contract reads
//! - [`PeerSession`], [`PeerServer`] - the peer transport below message dispatch
//!
//! [`MemoryChain`], [`KeySigner`], [`MemoryState`], [`StaticCandidates`] and
//! [`ChannelSession`] back the dev node and the tests.

use crate::error::{DposError, ProtocolError, Result};
use crate::protocol::RawMessage;
use async_trait::async_trait;
use dposbft_crypto::PrivateKey;
use dposbft_types::{Address, Block, DposSignature, Header, H256};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::debug;

// =============================================================================
// Chain
// =============================================================================

/// Read access to the local chain.
pub trait ChainReader: Send + Sync {
    /// Head header.
    fn current_header(&self) -> Header;

    /// Head block.
    fn current_block(&self) -> Block;

    /// Header by hash and number.
    fn get_header(&self, hash: &H256, number: u64) -> Option<Header>;

    /// Canonical header at `number`.
    fn get_header_by_number(&self, number: u64) -> Option<Header>;

    /// Header by hash.
    fn get_header_by_hash(&self, hash: &H256) -> Option<Header>;

    /// Block by hash and number.
    fn get_block(&self, hash: &H256, number: u64) -> Option<Block>;

    /// Highest head announced by the network.
    fn known_head(&self) -> (H256, u64);
}

/// Read-write access to the local chain.
pub trait ChainReadWriter: ChainReader {
    /// Insert blocks, returning how many were imported.
    fn insert_chain(&self, blocks: Vec<Block>) -> Result<usize>;

    /// Check a block body against its header.
    fn validate_block_body(&self, block: &Block) -> Result<()>;

    /// Record the highest head seen on the network.
    fn set_known_head(&self, hash: H256, number: u64);
}

struct ChainInner {
    blocks: HashMap<H256, Block>,
    canonical: BTreeMap<u64, H256>,
    head: H256,
    known_head: (H256, u64),
    balances: HashMap<Address, u64>,
    nonces: HashMap<Address, u64>,
}

/// In-memory chain.
///
/// Blocks extend the canonical chain when they are higher than the head; a
/// competing block at an existing height is stored but not made canonical.
pub struct MemoryChain {
    inner: RwLock<ChainInner>,
}

impl MemoryChain {
    /// Create a chain holding only `genesis`.
    pub fn new(genesis: Block) -> Self {
        let hash = genesis.hash();
        let mut blocks = HashMap::new();
        blocks.insert(hash, genesis);
        let mut canonical = BTreeMap::new();
        canonical.insert(0, hash);
        Self {
            inner: RwLock::new(ChainInner {
                blocks,
                canonical,
                head: hash,
                known_head: (hash, 0),
                balances: HashMap::new(),
                nonces: HashMap::new(),
            }),
        }
    }

    /// Height of the head block.
    pub fn head_number(&self) -> u64 {
        let inner = self.inner.read();
        inner.blocks.get(&inner.head).map_or(0, |b| b.number())
    }

    /// Set the whole-token balance reported to the reputation engine.
    pub fn set_balance(&self, address: Address, balance: u64) {
        self.inner.write().balances.insert(address, balance);
    }

    /// Set the account nonce reported to the reputation engine.
    pub fn set_nonce(&self, address: Address, nonce: u64) {
        self.inner.write().nonces.insert(address, nonce);
    }
}

impl ChainReader for MemoryChain {
    fn current_header(&self) -> Header {
        self.current_block().header
    }

    fn current_block(&self) -> Block {
        let inner = self.inner.read();
        inner.blocks.get(&inner.head).cloned().unwrap_or_default()
    }

    fn get_header(&self, hash: &H256, number: u64) -> Option<Header> {
        self.get_block(hash, number).map(|b| b.header)
    }

    fn get_header_by_number(&self, number: u64) -> Option<Header> {
        let inner = self.inner.read();
        let hash = inner.canonical.get(&number)?;
        inner.blocks.get(hash).map(|b| b.header.clone())
    }

    fn get_header_by_hash(&self, hash: &H256) -> Option<Header> {
        self.inner.read().blocks.get(hash).map(|b| b.header.clone())
    }

    fn get_block(&self, hash: &H256, number: u64) -> Option<Block> {
        self.inner
            .read()
            .blocks
            .get(hash)
            .filter(|b| b.number() == number)
            .cloned()
    }

    fn known_head(&self) -> (H256, u64) {
        self.inner.read().known_head
    }
}

impl ChainReadWriter for MemoryChain {
    fn insert_chain(&self, blocks: Vec<Block>) -> Result<usize> {
        let mut inner = self.inner.write();
        let mut imported = 0;
        for block in blocks {
            let number = block.number();
            let hash = block.hash();
            if inner.blocks.contains_key(&hash) {
                continue;
            }
            let parent_known = number > 0
                && inner
                    .blocks
                    .get(&block.parent_hash())
                    .map_or(false, |p| p.number() + 1 == number);
            if !parent_known {
                return Err(DposError::UnknownAncestor);
            }

            let head_number = inner.blocks.get(&inner.head).map_or(0, |b| b.number());
            if number > head_number {
                inner.canonical.insert(number, hash);
                inner.head = hash;
            }
            if number > inner.known_head.1 {
                inner.known_head = (hash, number);
            }
            inner.blocks.insert(hash, block);
            imported += 1;
            debug!(number, hash = %hash, "inserted block");
        }
        Ok(imported)
    }

    fn validate_block_body(&self, block: &Block) -> Result<()> {
        if !block.validate_transactions_root() {
            return Err(DposError::InvalidBlockBody(
                "transactions root mismatch".to_string(),
            ));
        }
        Ok(())
    }

    fn set_known_head(&self, hash: H256, number: u64) {
        let mut inner = self.inner.write();
        if number >= inner.known_head.1 {
            inner.known_head = (hash, number);
        }
    }
}

// =============================================================================
// Signing and state
// =============================================================================

/// Signs digests on behalf of an account.
pub trait Signer: Send + Sync {
    /// Sign `digest` with the key of `account`.
    fn sign(&self, account: &Address, digest: &H256) -> Result<DposSignature>;
}

/// Signer holding one local private key.
pub struct KeySigner {
    key: PrivateKey,
    address: Address,
}

impl KeySigner {
    /// Wrap a private key.
    pub fn new(key: PrivateKey) -> Self {
        let address = key.address();
        Self { key, address }
    }

    /// Address of the wrapped key.
    pub fn address(&self) -> Address {
        self.address
    }
}

impl Signer for KeySigner {
    fn sign(&self, account: &Address, digest: &H256) -> Result<DposSignature> {
        if *account != self.address {
            return Err(DposError::SignerUnavailable(account.to_string()));
        }
        Ok(self.key.sign_hash(digest)?)
    }
}

/// State mutations the engine performs during finalization.
pub trait StateWriter: Send {
    /// Credit `amount` base units to `address`.
    fn add_balance(&mut self, address: &Address, amount: u128);

    /// State root after all mutations so far.
    fn intermediate_root(&mut self) -> H256;
}

/// Balance-only state used by the dev node.
#[derive(Debug, Clone, Default)]
pub struct MemoryState {
    balances: BTreeMap<Address, u128>,
}

impl MemoryState {
    /// Balance of `address` in base units.
    pub fn balance_of(&self, address: &Address) -> u128 {
        self.balances.get(address).copied().unwrap_or_default()
    }
}

impl StateWriter for MemoryState {
    fn add_balance(&mut self, address: &Address, amount: u128) {
        *self.balances.entry(*address).or_default() += amount;
    }

    fn intermediate_root(&mut self) -> H256 {
        let mut s = rlp::RlpStream::new_list(self.balances.len());
        for (address, balance) in &self.balances {
            s.begin_list(2);
            s.append(address);
            s.append(&balance.to_be_bytes().to_vec());
        }
        H256::keccak256(&s.out())
    }
}

// =============================================================================
// Reputation and campaign inputs
// =============================================================================

/// Chain data the reputation engine ranks candidates by.
pub trait RptBackend: Send + Sync {
    /// Balance of `address` at `number`, in whole tokens.
    fn balance_at(&self, address: &Address, number: u64) -> Result<u64>;

    /// Account nonce of `address` at `number`.
    fn nonce_at(&self, address: &Address, number: u64) -> Result<u64>;

    /// Coinbase of the canonical block at `number`.
    fn coinbase_at(&self, number: u64) -> Option<Address>;
}

impl RptBackend for MemoryChain {
    fn balance_at(&self, address: &Address, _number: u64) -> Result<u64> {
        Ok(self.inner.read().balances.get(address).copied().unwrap_or_default())
    }

    fn nonce_at(&self, address: &Address, _number: u64) -> Result<u64> {
        Ok(self.inner.read().nonces.get(address).copied().unwrap_or_default())
    }

    fn coinbase_at(&self, number: u64) -> Option<Address> {
        self.get_header_by_number(number).map(|h| h.coinbase)
    }
}

/// Reputation coefficients and window size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RptCoefficients {
    /// Balance weight
    pub alpha: i64,
    /// Transaction count weight
    pub beta: i64,
    /// Maintenance weight
    pub gamma: i64,
    /// Upload weight
    pub psi: i64,
    /// Proxy weight
    pub omega: i64,
    /// Blocks in the sliding window
    pub window: u64,
}

impl Default for RptCoefficients {
    fn default() -> Self {
        Self {
            alpha: 50,
            beta: 15,
            gamma: 10,
            psi: 15,
            omega: 10,
            window: 100,
        }
    }
}

/// Governed reputation parameters, typically read from a contract.
pub trait RptParameters: Send + Sync {
    /// Parameters in force at `number`.
    fn coefficients_at(&self, number: u64) -> Result<RptCoefficients>;
}

/// Upload and proxy contribution ranks.
pub trait ContributionSource: Send + Sync {
    /// Upload rank of `address` among `candidates`.
    fn upload_rank(&self, _address: &Address, _candidates: &[Address], _number: u64) -> i64 {
        0
    }

    /// Proxy rank of `address` among `candidates`.
    fn proxy_rank(&self, _address: &Address, _candidates: &[Address], _number: u64) -> i64 {
        0
    }
}

/// Contribution source that ranks every candidate zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoContribution;

impl ContributionSource for NoContribution {}

/// Campaign contract: who runs for a term.
pub trait CandidateService: Send + Sync {
    /// Candidates registered for `term`.
    fn candidates_of(&self, term: u64) -> Result<Vec<Address>>;
}

/// RNode contract: addresses allowed to campaign.
pub trait RNodeService: Send + Sync {
    /// Current RNodes.
    fn rnodes(&self) -> Result<Vec<Address>>;
}

/// A fixed candidate list, used as both the candidate and RNode set.
#[derive(Debug, Clone, Default)]
pub struct StaticCandidates {
    candidates: Vec<Address>,
}

impl StaticCandidates {
    /// Wrap a candidate list.
    pub fn new(candidates: Vec<Address>) -> Self {
        Self { candidates }
    }
}

impl CandidateService for StaticCandidates {
    fn candidates_of(&self, _term: u64) -> Result<Vec<Address>> {
        Ok(self.candidates.clone())
    }
}

impl RNodeService for StaticCandidates {
    fn rnodes(&self) -> Result<Vec<Address>> {
        Ok(self.candidates.clone())
    }
}

// =============================================================================
// Peer transport
// =============================================================================

/// An established session with one remote node.
#[async_trait]
pub trait PeerSession: Send + Sync {
    /// Transport-level peer id.
    fn id(&self) -> String;

    /// Remote socket address.
    fn remote_addr(&self) -> String;

    /// Send one message.
    async fn write_msg(&self, msg: RawMessage) -> std::result::Result<(), ProtocolError>;

    /// Receive the next message.
    async fn read_msg(&self) -> std::result::Result<RawMessage, ProtocolError>;

    /// Close the session.
    async fn disconnect(&self);
}

/// The node's peer server, used to dial committee members.
#[async_trait]
pub trait PeerServer: Send + Sync {
    /// Connect to the node at `url`.
    async fn add_peer(&self, url: &str) -> std::result::Result<(), ProtocolError>;

    /// Drop the connection to the node at `url`.
    async fn remove_peer(&self, url: &str);
}

/// Messages buffered per direction of a [`ChannelSession`].
pub const CHANNEL_SESSION_CAPACITY: usize = 256;

/// In-process session over a pair of channels, for the dev cluster and tests.
pub struct ChannelSession {
    id: String,
    remote_addr: String,
    tx: mpsc::Sender<RawMessage>,
    rx: AsyncMutex<mpsc::Receiver<RawMessage>>,
}

impl ChannelSession {
    /// Connected sessions between nodes named `a` and `b`; each side is
    /// identified by the name of its remote end.
    pub fn pair(a: &str, b: &str) -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::channel(CHANNEL_SESSION_CAPACITY);
        let (b_tx, a_rx) = mpsc::channel(CHANNEL_SESSION_CAPACITY);
        (
            Self {
                id: b.to_string(),
                remote_addr: format!("memory://{b}"),
                tx: a_tx,
                rx: AsyncMutex::new(a_rx),
            },
            Self {
                id: a.to_string(),
                remote_addr: format!("memory://{a}"),
                tx: b_tx,
                rx: AsyncMutex::new(b_rx),
            },
        )
    }
}

#[async_trait]
impl PeerSession for ChannelSession {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn remote_addr(&self) -> String {
        self.remote_addr.clone()
    }

    async fn write_msg(&self, msg: RawMessage) -> std::result::Result<(), ProtocolError> {
        self.tx.send(msg).await.map_err(|_| ProtocolError::Disconnected)
    }

    async fn read_msg(&self) -> std::result::Result<RawMessage, ProtocolError> {
        self.rx.lock().await.recv().await.ok_or(ProtocolError::Disconnected)
    }

    async fn disconnect(&self) {
        self.rx.lock().await.close();
    }
}
