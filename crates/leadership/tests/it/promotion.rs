use std::time::Duration;

use tandem_engine::mock::MockEngine;
use tandem_leadership::Role;
use tandem_primitives::{ExecutionHead, decode_payload};
use tandem_replication::MemoryLog;

use crate::support::{ScriptedLease, genesis, publish_chain, spawn_manager, wait_for_role, wait_until};

#[tokio::test(start_paused = true)]
async fn caught_up_follower_leads_and_publishes_blocks() {
    let log = MemoryLog::new();
    let genesis = genesis();
    let engine = MockEngine::new(genesis);

    let (lease, events) = ScriptedLease::new();
    let handle = spawn_manager(&log, "b", &engine, lease.clone(), events);
    lease.promote();

    wait_for_role(&handle, Role::Leader).await;
    wait_until("two blocks are built and applied", || {
        engine.head().height >= genesis.height + 2
    })
    .await;

    let entries = log.entries();
    assert!(entries.len() >= 2);
    for entry in &entries {
        assert_eq!(entry.parse().unwrap().sender_instance_id, "b");
    }
    assert_eq!(lease.resigns(), 0);
    handle.shutdown(Duration::from_secs(5)).await.unwrap();
    assert_eq!(lease.resigns(), 1);
}

#[tokio::test(start_paused = true)]
async fn publish_that_lands_without_a_reply_is_not_built_twice() {
    let log = MemoryLog::new();
    let genesis = genesis();
    let engine = MockEngine::new(genesis);

    let (lease, events) = ScriptedLease::new();
    let handle = spawn_manager(&log, "b", &engine, lease.clone(), events);
    lease.promote();
    wait_for_role(&handle, Role::Leader).await;

    log.lose_next_publish_replies(1);
    let published = log.entries().len();
    wait_until("blocks are built past the unanswered publish", || {
        log.entries().len() >= published + 3
    })
    .await;
    handle.shutdown(Duration::from_secs(5)).await.unwrap();

    let mut parent = genesis;
    for entry in log.entries() {
        let payload = decode_payload(&entry.parse().unwrap().encoded_payload).unwrap();
        assert_eq!(payload.payload_inner.payload_inner.parent_hash, parent.hash);
        let block = ExecutionHead::of_payload(&payload);
        assert_eq!(block.height, parent.height + 1);
        parent = block;
    }
    assert!(engine.head().height + 1 >= parent.height);
}

#[tokio::test(start_paused = true)]
async fn follower_behind_the_log_resigns_until_caught_up() {
    let log = MemoryLog::new();
    let genesis = genesis();
    let engine = MockEngine::new(genesis);
    engine.set_txpool(0, 0);

    let (lease, events) = ScriptedLease::new();
    let handle = spawn_manager(&log, "b", &engine, lease.clone(), events);
    wait_until("it waits for log entries", || lease.starts() == 1).await;

    // promoted in the same instant that another leader's blocks show up
    lease.grant_on_start();
    lease.promote();
    let tip = publish_chain(&log, "a", genesis, 3);

    wait_for_role(&handle, Role::Leader).await;
    assert_eq!(engine.head(), tip);
    assert_eq!(log.pending_count("b"), 0);
    assert_eq!(lease.resigns(), 1);
    assert_eq!(lease.starts(), 2);
    handle.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn losing_the_lease_returns_to_following() {
    let log = MemoryLog::new();
    let genesis = genesis();
    let engine = MockEngine::new(genesis);
    engine.set_txpool(0, 0);

    let (lease, events) = ScriptedLease::new();
    let handle = spawn_manager(&log, "b", &engine, lease.clone(), events);
    lease.promote();
    wait_for_role(&handle, Role::Leader).await;

    lease.demote();
    wait_for_role(&handle, Role::Follower).await;
    wait_until("it competes again", || lease.starts() == 2).await;
    assert_eq!(lease.resigns(), 0);

    // the chain moves on under another leader
    let tip = publish_chain(&log, "a", genesis, 2);
    wait_until("the new leader's blocks are applied", || engine.head() == tip).await;
    handle.shutdown(Duration::from_secs(5)).await.unwrap();
}
