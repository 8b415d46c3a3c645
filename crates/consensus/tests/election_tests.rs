//! Integration tests for committee election at term checkpoints.

mod common;

use common::{addresses, config, key};
use dposbft_config::Config;
use dposbft_consensus::{
    elect, ChainReader, Dpos, KeySigner, MemoryChain, Rpt, RptCollector, RptService,
    StaticCandidates,
};
use dposbft_storage::MemoryDatabase;
use dposbft_types::{Address, Block, Header, H256};
use std::collections::HashSet;
use std::sync::Arc;

struct Campaign {
    chain: Arc<MemoryChain>,
    dpos: Arc<Dpos>,
}

fn campaign(config: &Config, with_services: bool, validator: bool) -> Campaign {
    let chain = Arc::new(MemoryChain::new(Block::with_header(config.genesis.header())));
    for (i, address) in addresses(6).into_iter().enumerate() {
        chain.set_balance(address, 1_000 * (i as u64 + 1));
        chain.set_nonce(address, 7 * i as u64);
    }

    let mut dpos = Dpos::new(config, chain.clone(), Arc::new(MemoryDatabase::new())).unwrap();
    if with_services {
        dpos = dpos
            .with_candidate_service(Arc::new(StaticCandidates::new(addresses(6))))
            .with_rpt_service(Arc::new(RptCollector::new(chain.clone())));
    }
    let dpos = Arc::new(dpos);
    dpos.authorize(key(1).address(), Arc::new(KeySigner::new(key(1))));
    dpos.set_as_validator(validator);
    Campaign { chain, dpos }
}

/// Insert `count` plain blocks whose coinbases rotate over the candidates.
fn grow(node: &Campaign, count: u64) -> Vec<Header> {
    let candidates = addresses(6);
    let mut parent = node.chain.current_header();
    let mut headers = Vec::new();
    for _ in 0..count {
        let number = parent.number + 1;
        let header = Header {
            parent_hash: parent.hash(),
            number,
            gas_limit: parent.gas_limit,
            timestamp: parent.timestamp + 1_000,
            coinbase: candidates[(number % 6) as usize],
            ..Default::default()
        };
        node.dpos.insert_chain(Block::with_header(header.clone())).unwrap();
        parent = header.clone();
        headers.push(header);
    }
    headers
}

#[test]
fn test_checkpoint_elects_future_term() {
    let config = config();
    let blocks_per_term = config.dpos.term_len * config.dpos.view_len;

    let a = campaign(&config, true, true);
    let b = campaign(&config, true, true);
    grow(&a, blocks_per_term);
    grow(&b, blocks_per_term);

    let snap_a = a.dpos.current_snap().unwrap();
    let snap_b = b.dpos.current_snap().unwrap();
    assert_eq!(snap_a.number, blocks_per_term);
    assert_eq!(snap_a.candidates, addresses(6));

    // the checkpoint closing term 0 elects term 2
    let elected = snap_a.recent_proposers(2);
    assert_eq!(elected.len(), config.dpos.term_len as usize);
    assert_eq!(elected.iter().collect::<HashSet<_>>().len(), elected.len());
    assert!(elected.iter().all(|p| addresses(6).contains(p)));
    assert_eq!(elected, snap_b.recent_proposers(2));

    // terms already being mined keep the genesis committee
    assert_eq!(snap_a.recent_proposers(1), addresses(4));
    assert_eq!(snap_a.recent_validators(2), addresses(4));
}

#[test]
fn test_observer_keeps_committee() {
    let config = config();
    let blocks_per_term = config.dpos.term_len * config.dpos.view_len;

    let observer = campaign(&config, true, false);
    grow(&observer, blocks_per_term);
    assert_eq!(observer.dpos.current_snap().unwrap().recent_proposers(2), addresses(4));

    let unserviced = campaign(&config, false, true);
    grow(&unserviced, blocks_per_term);
    assert_eq!(unserviced.dpos.current_snap().unwrap().recent_proposers(2), addresses(4));
    assert!(matches!(
        unserviced.dpos.get_rnodes(),
        Err(dposbft_consensus::DposError::ServiceUnavailable(_))
    ));
}

#[test]
fn test_rpt_ranks_follow_chain_data() {
    let config = config();
    let node = campaign(&config, true, true);
    grow(&node, 6);

    let collector = RptCollector::new(node.chain.clone());
    let rpts = collector.calc_rpts(&addresses(6), 6).unwrap();
    assert_eq!(rpts.len(), 6);
    assert_eq!(
        rpts.iter().map(|r| r.address).collect::<Vec<_>>(),
        addresses(6)
    );
    // scores are weighted rank positions: the richest, busiest producer sits
    // at rank 1 on every metric, the poorest idle one at rank 6
    assert_eq!(rpts[5].score, 50 + 15 + 10);
    assert_eq!(rpts[0].score, 6 * (50 + 15 + 10));
}

#[test]
fn test_election_seeded_by_checkpoint_hash() {
    let rpts: Vec<Rpt> = (1..=10)
        .map(|i| Rpt::new(Address::from_low_u64(i), 100 - 10 * i as i64 + 10))
        .collect();
    let seed = H256::keccak256(b"checkpoint").low_u64();

    let first = elect(&rpts, seed, 4, 5, 2);
    assert_eq!(first, elect(&rpts, seed, 4, 5, 2));
    assert_eq!(first.len(), 4);

    let low: HashSet<Address> = rpts[5..].iter().map(|r| r.address).collect();
    assert_eq!(first.iter().filter(|a| low.contains(a)).count(), 2);
}
