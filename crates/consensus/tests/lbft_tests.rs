//! Integration tests driving several LBFT2 state machines to agreement.

mod common;

use common::{config, mine, network, pump, TestNode};
use dposbft_consensus::{Action, DposError, LbftState, Lbft2, Message, Normal};
use std::sync::Arc;

#[tokio::test]
async fn test_four_validators_finalize_block() {
    let config = config();
    let nodes = network(&config, 4);
    let block = mine(&nodes[0], &nodes[0].head()).await;
    let bi = block.identifier();

    let initial = (0..4)
        .map(|i| (i, Message::Preprepare(block.clone())))
        .collect();
    let inserted = pump(&nodes, initial).await;

    for (i, node) in nodes.iter().enumerate() {
        assert_eq!(inserted[i], vec![bi], "node {i}");
        let head = node.head();
        assert_eq!(head.identifier(), bi);
        assert!(head.dpos.sigs.iter().filter(|s| !s.is_empty()).count() >= 3);
        node.dpos.verify_sigs(&head).await.unwrap();
    }
}

#[tokio::test]
async fn test_impeach_blocks_are_identical() {
    let config = config();
    let nodes = network(&config, 4);

    let blocks: Vec<_> = nodes
        .iter()
        .map(|n| n.dpos.create_impeach_block().unwrap())
        .collect();
    let encoded = blocks[0].rlp_encode();
    for block in &blocks[1..] {
        assert_eq!(block.rlp_encode(), encoded);
    }

    let genesis = nodes[0].head();
    let impeach = &blocks[0];
    assert!(impeach.header.is_impeachment());
    assert!(impeach.header.coinbase.is_zero());
    assert!(impeach.header.dpos.seal.is_empty());
    assert!(impeach.header.dpos.validators.is_empty());
    assert_eq!(impeach.header.state_root, genesis.state_root);
    assert_eq!(
        impeach.header.timestamp,
        genesis.timestamp + config.dpos.period_ms + config.dpos.impeach_timeout_ms
    );
}

#[tokio::test]
async fn test_failback_impeach_blocks_share_parent() {
    let config = config();
    let nodes = network(&config, 2);
    let space = config.dpos.failback_timestamp_sample_space_ms;

    let (first, second) = nodes[0].dpos.create_failback_impeach_blocks().unwrap();
    assert_eq!(first.header.timestamp % space, 0);
    assert_eq!(second.header.timestamp, first.header.timestamp + space);
    assert_eq!(first.parent_hash(), second.parent_hash());
    assert_ne!(first.hash(), second.hash());

    let (other_first, _) = nodes[1].dpos.create_failback_impeach_blocks().unwrap();
    // both nodes land on the same grid point unless a boundary passed in between
    assert!(
        other_first.hash() == first.hash() || other_first.header.timestamp == second.header.timestamp
    );
}

#[tokio::test]
async fn test_four_validators_impeach_silent_proposer() {
    let config = config();
    let nodes = network(&config, 4);

    let expected = nodes[1].dpos.create_impeach_block().unwrap();

    // the proposer of block 1 (key 1) stays silent; the rest impeach it
    let initial = (1..4)
        .map(|i| (i, Message::PreprepareImpeach(nodes[i].dpos.create_impeach_block().unwrap())))
        .collect();
    let inserted = pump(&nodes, initial).await;

    for (i, node) in nodes.iter().enumerate() {
        assert_eq!(inserted[i].len(), 1, "node {i}");
        let head = node.head();
        assert_eq!(head.number, 1);
        assert!(head.is_impeachment());
        node.dpos.verify_sigs(&head).await.unwrap();
    }
    for node in &nodes {
        assert_eq!(node.head().hash(), expected.hash());
    }
}

#[tokio::test]
async fn test_observer_accepts_finished_block() {
    let config = config();
    let nodes = network(&config, 4);
    let block = mine(&nodes[0], &nodes[0].head()).await;
    let bi = block.identifier();
    let initial = (0..4)
        .map(|i| (i, Message::Preprepare(block.clone())))
        .collect();
    pump(&nodes, initial).await;
    let finished = nodes[0]
        .dpos
        .get_block_from_chain(&bi.hash, bi.number)
        .expect("finalized block");

    let observer = TestNode::new(&config, 9, Arc::new(Normal));
    let lbft = Lbft2::new(observer.dpos.clone());
    let actions = lbft.fsm(Message::Validate(finished)).await;
    assert_eq!(actions, vec![Action::Inserted(bi)]);
    assert_eq!(observer.head().identifier(), bi);
    assert_eq!(observer.dpos.status().state, LbftState::Validate);
}

#[tokio::test]
async fn test_stale_and_mismatched_messages_are_dropped() {
    let config = config();
    let nodes = network(&config, 4);
    let block = mine(&nodes[0], &nodes[0].head()).await;
    let lbft = Lbft2::new(nodes[1].dpos.clone());

    // impeach flag must match the message kind
    assert!(lbft.fsm(Message::PreprepareImpeach(block.clone())).await.is_empty());
    assert_eq!(lbft.pending_len(), 0);

    let actions = lbft.fsm(Message::Preprepare(block.clone())).await;
    assert!(matches!(actions.as_slice(), [Action::BroadcastPrepare(_)]));
    assert_eq!(lbft.pending_len(), 1);

    // a repeated preprepare is ignored
    assert!(lbft.fsm(Message::Preprepare(block.clone())).await.is_empty());

    nodes[1].dpos.insert_chain(block.clone()).unwrap();
    assert!(lbft.fsm(Message::Preprepare(block)).await.is_empty());
}

#[tokio::test]
async fn test_observer_tracks_without_signing() {
    let config = config();
    let nodes = network(&config, 4);
    let block = mine(&nodes[0], &nodes[0].head()).await;

    let observer = TestNode::new(&config, 9, Arc::new(Normal));
    let lbft = Lbft2::new(observer.dpos.clone());
    assert_eq!(observer.dpos.status().state, LbftState::Idle);
    assert!(lbft.fsm(Message::Preprepare(block.clone())).await.is_empty());
    assert_eq!(lbft.pending_len(), 1);
    assert_eq!(observer.dpos.status().state, LbftState::Validate);
    assert!(matches!(
        observer.dpos.sign_header(&mut block.header.clone(), LbftState::Prepare),
        Err(DposError::ValidatorNotInCommittee)
    ));
}

#[tokio::test]
async fn test_unknown_parent_is_reported() {
    let config = config();
    let nodes = network(&config, 4);
    let first = mine(&nodes[0], &nodes[0].head()).await;
    nodes[1].dpos.insert_chain(first.clone()).unwrap();
    let second = mine(&nodes[1], &first.header).await;

    // node 3 has not seen block 1 yet
    let lbft = Lbft2::new(nodes[3].dpos.clone());
    let actions = lbft.fsm(Message::Preprepare(second.clone())).await;
    assert_eq!(actions, vec![Action::UnknownAncestor(second)]);
}
