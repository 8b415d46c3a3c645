//! Integration tests for the impeach timer and the failback path.

mod common;

use common::{config, network, solo_config, TestNode};
use dposbft_consensus::types::now_ms;
use dposbft_consensus::{Handler, ImpeachTimer, Normal};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

#[tokio::test(start_paused = true)]
async fn test_silent_proposer_is_impeached_by_every_validator() {
    let mut config = config();
    config.genesis.timestamp_ms = now_ms();
    let nodes = network(&config, 4);
    let timeout = Duration::from_millis(config.dpos.period_ms + config.dpos.impeach_timeout_ms);

    let (_stop_tx, stop) = watch::channel(false);
    let mut heads = Vec::new();
    let mut queues = Vec::new();
    for node in &nodes {
        let (head_tx, head_rx) = watch::channel(node.head().identifier());
        let (block_tx, block_rx) = mpsc::channel(8);
        tokio::spawn(ImpeachTimer::new(node.dpos.clone(), head_rx, block_tx).run(stop.clone()));
        heads.push(head_tx);
        queues.push(block_rx);
    }

    // the proposer of block 1 never sends its preprepare
    tokio::time::advance(timeout - Duration::from_millis(10)).await;
    for queue in &mut queues {
        assert!(queue.try_recv().is_err());
    }

    tokio::time::advance(Duration::from_millis(20)).await;
    let mut blocks = Vec::new();
    for queue in &mut queues {
        blocks.push(queue.recv().await.expect("impeach block queued"));
    }

    let encoded = blocks[0].rlp_encode();
    for block in &blocks[1..] {
        assert_eq!(block.rlp_encode(), encoded);
    }
    let genesis = nodes[0].head();
    assert_eq!(blocks[0].number(), 1);
    assert!(blocks[0].header.is_impeachment());
    assert_eq!(
        blocks[0].header.timestamp,
        genesis.timestamp + timeout.as_millis() as u64
    );
}

#[tokio::test(start_paused = true)]
async fn test_timer_stops_when_head_channel_closes() {
    let mut config = config();
    config.genesis.timestamp_ms = now_ms();
    let node = TestNode::new(&config, 2, Arc::new(Normal));
    let timeout = Duration::from_millis(config.dpos.period_ms + config.dpos.impeach_timeout_ms);

    let (_stop_tx, stop) = watch::channel(false);
    let (head_tx, head_rx) = watch::channel(node.head().identifier());
    let (block_tx, mut block_rx) = mpsc::channel(8);
    let timer = tokio::spawn(ImpeachTimer::new(node.dpos.clone(), head_rx, block_tx).run(stop));

    tokio::time::advance(timeout / 2).await;
    assert!(block_rx.try_recv().is_err());

    // closing the head channel ends the timer without queueing anything
    drop(head_tx);
    tokio::time::timeout(Duration::from_secs(1), timer)
        .await
        .expect("timer exits")
        .expect("timer task completes");
    assert!(block_rx.recv().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_failback_block_is_held_until_its_timestamp() {
    let mut config = solo_config();
    // keep the regular impeach deadline well behind the failback grid point
    config.dpos.impeach_timeout_ms = 60_000;
    let node = TestNode::new(&config, 1, Arc::new(Normal));
    let handler = Handler::new(node.dpos.clone());
    handler.start();

    let (failback, _) = node.dpos.create_failback_impeach_blocks().unwrap();
    assert!(failback.header.timestamp > now_ms());

    let mut head = handler.subscribe_head();
    handler.receive_impeach_block(failback.clone()).unwrap();
    tokio::time::timeout(Duration::from_secs(30), head.wait_for(|bi| bi.number >= 1))
        .await
        .expect("failback block finalized")
        .unwrap();

    assert!(now_ms() >= failback.header.timestamp);
    let tip = node.head();
    assert_eq!(tip.hash(), failback.hash());
    assert!(tip.is_impeachment());
    node.dpos.verify_sigs(&tip).await.unwrap();
    handler.stop();
}
