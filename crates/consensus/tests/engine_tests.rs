//! Integration tests for block production and certificate checks.

mod common;

use common::{commit_sign, config, key, mine, network, TestNode};
use dposbft_consensus::{DposError, LbftState, MemoryState, Normal};
use dposbft_types::{DposSignature, Header};
use std::sync::Arc;
use tokio::sync::watch;

#[tokio::test]
async fn test_seal_round_trip() {
    let config = config();
    let nodes = network(&config, 4);
    let genesis = nodes[0].head();

    let block = mine(&nodes[0], &genesis).await;
    assert_eq!(block.number(), 1);
    assert_eq!(block.header.dpos.proposers, common::addresses(4));
    assert_eq!(block.header.dpos.sigs.len(), 4);
    assert!(block.header.timestamp >= genesis.timestamp + config.dpos.period_ms);
    assert_eq!(nodes[0].dpos.author(&block.header).unwrap(), nodes[0].address);

    // any committee member accepts the seal
    nodes[2].dpos.verify_seal(&block.header).await.unwrap();

    let mut forged = block.header.clone();
    forged.gas_used = 1;
    assert!(nodes[2].dpos.verify_seal(&forged).await.is_err());
}

#[tokio::test]
async fn test_seal_requires_turn() {
    let config = config();
    let nodes = network(&config, 4);
    let genesis = nodes[0].head();

    // key 2 holds the second slot, not block 1
    let mut header = Header {
        parent_hash: genesis.hash(),
        number: 1,
        gas_limit: genesis.gas_limit,
        ..Default::default()
    };
    nodes[1].dpos.prepare_block(&mut header).unwrap();
    let block = nodes[1]
        .dpos
        .finalize(header.clone(), &mut MemoryState::default(), vec![], &[])
        .unwrap();
    let (_tx, mut stop) = watch::channel(false);
    assert!(matches!(
        nodes[1].dpos.seal(block.clone(), &mut stop).await,
        Err(DposError::Unauthorized)
    ));

    let outsider = TestNode::new(&config, 9, Arc::new(Normal));
    assert!(matches!(
        outsider.dpos.seal(block, &mut stop).await,
        Err(DposError::NotInProposerCommittee)
    ));

    assert!(nodes[0].dpos.can_make_block(&nodes[0].address, &genesis));
    assert!(!nodes[0].dpos.can_make_block(&nodes[1].address, &genesis));
}

#[tokio::test]
async fn test_seal_stops_early() {
    let config = config();
    let nodes = network(&config, 1);
    let genesis = nodes[0].head();

    let mut header = Header {
        parent_hash: genesis.hash(),
        number: 1,
        gas_limit: genesis.gas_limit,
        ..Default::default()
    };
    nodes[0].dpos.prepare_block(&mut header).unwrap();
    header.timestamp += 3_600_000;
    let block = nodes[0]
        .dpos
        .finalize(header, &mut MemoryState::default(), vec![], &[])
        .unwrap();

    let (tx, mut stop) = watch::channel(false);
    tx.send(true).unwrap();
    assert!(nodes[0].dpos.seal(block, &mut stop).await.unwrap().is_none());
}

#[tokio::test]
async fn test_zero_period_waits_for_transactions() {
    let mut config = config();
    config.dpos.period_ms = 0;
    let nodes = network(&config, 1);
    let genesis = nodes[0].head();

    let mut header = Header {
        parent_hash: genesis.hash(),
        number: 1,
        gas_limit: genesis.gas_limit,
        ..Default::default()
    };
    nodes[0].dpos.prepare_block(&mut header).unwrap();
    let empty = nodes[0]
        .dpos
        .finalize(header.clone(), &mut MemoryState::default(), vec![], &[])
        .unwrap();
    let (_tx, mut stop) = watch::channel(false);
    assert!(matches!(
        nodes[0].dpos.seal(empty, &mut stop).await,
        Err(DposError::WaitTransactions)
    ));

    let full = nodes[0]
        .dpos
        .finalize(header, &mut MemoryState::default(), vec![vec![0xf8, 0x01]], &[])
        .unwrap();
    assert!(nodes[0].dpos.seal(full, &mut stop).await.unwrap().is_some());
}

#[tokio::test]
async fn test_commit_certificate_boundary() {
    let config = config();
    let nodes = network(&config, 4);
    let block = mine(&nodes[0], &nodes[0].head()).await;

    let mut header = block.header.clone();
    assert!(matches!(
        nodes[1].dpos.verify_sigs(&header).await,
        Err(DposError::NotEnoughSigs)
    ));

    commit_sign(&mut header, &[1, 2]);
    assert!(matches!(
        nodes[1].dpos.verify_sigs(&header).await,
        Err(DposError::NotEnoughSigs)
    ));

    // a repeated signer counts once
    header.dpos.sigs[2] = header.dpos.sigs[0];
    assert!(matches!(
        nodes[1].dpos.verify_sigs(&header).await,
        Err(DposError::NotEnoughSigs)
    ));

    header.dpos.sigs[2] = DposSignature::EMPTY;
    commit_sign(&mut header, &[3]);
    nodes[1].dpos.verify_sigs(&header).await.unwrap();
}

#[tokio::test]
async fn test_outsider_signatures_do_not_count() {
    let config = config();
    let nodes = network(&config, 4);
    let block = mine(&nodes[0], &nodes[0].head()).await;

    let mut header = block.header.clone();
    commit_sign(&mut header, &[1, 2]);
    header.dpos.sigs[3] = key(9).sign_hash(&header.hash()).unwrap();
    assert!(matches!(
        nodes[3].dpos.verify_sigs(&header).await,
        Err(DposError::NotEnoughSigs)
    ));
}

#[tokio::test]
async fn test_signature_list_must_match_committee_size() {
    let config = config();
    let nodes = network(&config, 4);
    let block = mine(&nodes[0], &nodes[0].head()).await;

    let mut header = block.header.clone();
    commit_sign(&mut header, &[1, 2, 3]);
    nodes[1].dpos.verify_sigs(&header).await.unwrap();

    header.dpos.sigs.push(DposSignature::EMPTY);
    assert!(matches!(
        nodes[1].dpos.verify_sigs(&header).await,
        Err(DposError::InvalidSigsLength { expected: 4, actual: 5 })
    ));
    header.dpos.sigs.truncate(3);
    assert!(matches!(
        nodes[1].dpos.verify_sigs(&header).await,
        Err(DposError::InvalidSigsLength { expected: 4, actual: 3 })
    ));
}

#[tokio::test]
async fn test_sign_header_keeps_slot_count() {
    let mut config = config();
    // one validator more than 3f + 1 slots
    config.genesis.validators = common::addresses(5);
    let node = TestNode::new(&config, 5, Arc::new(Normal));
    let genesis = node.head();

    let mut header = Header {
        parent_hash: genesis.hash(),
        number: 1,
        gas_limit: genesis.gas_limit,
        ..Default::default()
    };
    assert!(matches!(
        node.dpos.sign_header(&mut header, LbftState::Prepare),
        Err(DposError::ValidatorNotInCommittee)
    ));
    assert_eq!(header.dpos.sigs.len(), config.dpos.validators_len());

    let inside = TestNode::new(&config, 2, Arc::new(Normal));
    inside.dpos.sign_header(&mut header, LbftState::Prepare).unwrap();
    assert_eq!(header.dpos.sigs.len(), config.dpos.validators_len());
    assert!(!header.dpos.sigs[1].is_empty());
}

#[tokio::test]
async fn test_impeach_certificate_boundary() {
    let config = config();
    let nodes = network(&config, 4);
    let impeach = nodes[0].dpos.create_impeach_block().unwrap();
    assert!(impeach.header.is_impeachment());

    let mut header = impeach.header.clone();
    commit_sign(&mut header, &[2]);
    assert!(matches!(
        nodes[1].dpos.verify_sigs(&header).await,
        Err(DposError::NotEnoughSigs)
    ));

    commit_sign(&mut header, &[4]);
    nodes[1].dpos.verify_sigs(&header).await.unwrap();
}

#[tokio::test]
async fn test_no_double_commit() {
    let config = config();
    let nodes = network(&config, 4);
    let node = &nodes[1];
    let genesis = node.head();

    let mut first = Header {
        parent_hash: genesis.hash(),
        number: 1,
        gas_limit: genesis.gas_limit,
        extra: vec![1],
        ..Default::default()
    };
    let mut second = Header {
        extra: vec![2],
        ..first.clone()
    };

    node.dpos.sign_header(&mut first, LbftState::Commit).unwrap();
    // re-signing the same block is fine
    node.dpos.sign_header(&mut first, LbftState::Commit).unwrap();
    assert!(matches!(
        node.dpos.sign_header(&mut second, LbftState::Commit),
        Err(DposError::MultiBlocksInOneHeight { number: 1, .. })
    ));

    // prepare signatures are not recorded
    node.dpos.sign_header(&mut second, LbftState::Prepare).unwrap();

    // the record survives a restart on the same database
    let restarted = TestNode::with_store(&config, 2, Arc::new(Normal), node.chain.clone(), node.db.clone());
    assert!(matches!(
        restarted.dpos.sign_header(&mut second, LbftState::Commit),
        Err(DposError::MultiBlocksInOneHeight { .. })
    ));
}

#[tokio::test]
async fn test_current_snapshot_is_monotonic() {
    let config = config();
    let nodes = network(&config, 4);
    let node = &nodes[0];

    let mut parent = node.head();
    let mut hashes = vec![parent.hash()];
    for _ in 0..3 {
        let proposer = &nodes[(parent.number % 4) as usize];
        let mut block = mine(proposer, &parent).await;
        commit_sign(&mut block.header, &[1, 2, 3]);
        for n in &nodes {
            n.dpos.insert_chain(block.clone()).unwrap();
        }
        parent = block.header.clone();
        hashes.push(parent.hash());
    }

    assert_eq!(node.dpos.current_snap().unwrap().number, 3);
    let older = node.dpos.snapshot(1, hashes[1], &[]).unwrap();
    assert_eq!(older.number, 1);
    node.dpos.set_current_snap(older);
    assert_eq!(node.dpos.current_snap().unwrap().number, 3);
    assert_eq!(node.dpos.current_snap().unwrap().hash, hashes[3]);
}
