//! Shared fixtures: a four-member committee whose nodes each keep their own
//! in-memory chain and database.

#![allow(dead_code)]

use dposbft_config::{Config, GenesisConfig};
use dposbft_consensus::types::now_ms;
use dposbft_consensus::{
    Action, Dpos, KeySigner, Lbft2, MemoryChain, MemoryState, Message, Normal, VerifyStrategy,
};
use dposbft_crypto::PrivateKey;
use dposbft_storage::{KeyValueStore, MemoryDatabase};
use dposbft_types::{Address, Block, BlockIdentifier, Header};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::watch;

/// Deterministic key `i` (1-based).
pub fn key(i: u8) -> PrivateKey {
    PrivateKey::from_bytes(&[i; 32]).expect("valid secp256k1 scalar")
}

/// Addresses of keys `1..=n`.
pub fn addresses(n: u8) -> Vec<Address> {
    (1..=n).map(|i| key(i).address()).collect()
}

/// Default config with keys 1..=4 as proposers, validators and candidates,
/// and a genesis one minute in the past.
pub fn config() -> Config {
    let members = addresses(4);
    Config {
        genesis: GenesisConfig {
            timestamp_ms: now_ms() - 60_000,
            proposers: members.clone(),
            validators: members.clone(),
            candidates: members,
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Single-member committee of key 1 with a genesis at the current time.
pub fn solo_config() -> Config {
    let member = vec![key(1).address()];
    let mut config = Config::default();
    config.dpos.faulty_number = 0;
    config.dpos.term_len = 1;
    config.dpos.low_rpt_seats = 0;
    config.genesis = GenesisConfig {
        timestamp_ms: now_ms(),
        proposers: member.clone(),
        validators: member.clone(),
        candidates: member,
        ..Default::default()
    };
    config
}

pub struct TestNode {
    pub address: Address,
    pub chain: Arc<MemoryChain>,
    pub db: Arc<dyn KeyValueStore>,
    pub dpos: Arc<Dpos>,
}

impl TestNode {
    /// Node signing with key `index`.
    pub fn new(config: &Config, index: u8, strategy: Arc<dyn VerifyStrategy>) -> Self {
        let genesis = Block::with_header(config.genesis.header());
        let chain = Arc::new(MemoryChain::new(genesis));
        let db: Arc<dyn KeyValueStore> = Arc::new(MemoryDatabase::new());
        Self::with_store(config, index, strategy, chain, db)
    }

    /// Node over an existing chain and database.
    pub fn with_store(
        config: &Config,
        index: u8,
        strategy: Arc<dyn VerifyStrategy>,
        chain: Arc<MemoryChain>,
        db: Arc<dyn KeyValueStore>,
    ) -> Self {
        let dpos = Dpos::new(config, chain.clone(), db.clone())
            .expect("valid config")
            .with_strategy(strategy);
        let key = key(index);
        let address = key.address();
        dpos.authorize(address, Arc::new(KeySigner::new(key)));
        Self {
            address,
            chain,
            db,
            dpos: Arc::new(dpos),
        }
    }

    pub fn head(&self) -> Header {
        use dposbft_consensus::ChainReader;
        self.chain.current_header()
    }
}

/// Nodes for keys `1..=n` with full verification.
pub fn network(config: &Config, n: u8) -> Vec<TestNode> {
    (1..=n)
        .map(|i| TestNode::new(config, i, Arc::new(Normal)))
        .collect()
}

/// Prepare, finalize and seal the child of `parent` on `node`.
pub async fn mine(node: &TestNode, parent: &Header) -> Block {
    let mut header = Header {
        parent_hash: parent.hash(),
        number: parent.number + 1,
        gas_limit: parent.gas_limit,
        coinbase: node.address,
        ..Default::default()
    };
    node.dpos.prepare_block(&mut header).expect("prepare");
    let block = node
        .dpos
        .finalize(header, &mut MemoryState::default(), vec![], &[])
        .expect("finalize");
    let (_stop_tx, mut stop) = watch::channel(false);
    node.dpos
        .seal(block, &mut stop)
        .await
        .expect("seal")
        .expect("not stopped")
}

/// Write commit signatures of `signers` (1-based key indices) into the
/// validator slots of `header`. Slot `i - 1` belongs to key `i`.
pub fn commit_sign(header: &mut Header, signers: &[u8]) {
    let digest = header.hash();
    for &i in signers {
        let slot = usize::from(i - 1);
        header.dpos.sigs[slot] = key(i).sign_hash(&digest).expect("sign");
    }
}

/// Deliver messages between the state machines of `nodes` until nothing is
/// left to send. Returns the blocks each node inserted.
pub async fn pump(
    nodes: &[TestNode],
    initial: Vec<(usize, Message)>,
) -> Vec<Vec<BlockIdentifier>> {
    let lbfts: Vec<Lbft2> = nodes.iter().map(|n| Lbft2::new(n.dpos.clone())).collect();
    let mut queue: VecDeque<(usize, Message)> = initial.into();
    let mut inserted = vec![Vec::new(); nodes.len()];

    let mut steps = 0;
    while let Some((to, msg)) = queue.pop_front() {
        steps += 1;
        assert!(steps < 10_000, "message pump did not settle");

        for action in lbfts[to].fsm(msg).await {
            let outgoing = match action {
                Action::BroadcastPrepare(h) => Message::Prepare(h),
                Action::BroadcastPrepareImpeach(h) => Message::PrepareImpeach(h),
                Action::BroadcastCommit(h) => Message::Commit(h),
                Action::BroadcastCommitImpeach(h) => Message::CommitImpeach(h),
                Action::BroadcastValidate(b) => Message::Validate(b),
                Action::BroadcastValidateImpeach(b) => Message::ValidateImpeach(b),
                Action::UnknownAncestor(b) => panic!("unknown ancestor for block {}", b.number()),
                Action::Inserted(bi) => {
                    inserted[to].push(bi);
                    continue;
                }
            };
            for peer in (0..nodes.len()).filter(|p| *p != to) {
                queue.push_back((peer, outgoing.clone()));
            }
        }
    }
    inserted
}
