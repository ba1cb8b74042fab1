use std::{sync::atomic::Ordering, time::Duration};

use tandem_engine::mock::MockEngine;
use tandem_leadership::Role;
use tandem_primitives::{BuildState, LogEntry, encode_payload, log::FIELD_SENDER_INSTANCE_ID};
use tandem_replication::{MemoryLog, ReadKind, ReplicatedState as _};

use crate::support::{ScriptedLease, genesis, publish_chain, spawn_manager, wait_until};

#[tokio::test(start_paused = true)]
async fn applies_entries_of_other_leaders_in_order() {
    let log = MemoryLog::new();
    let genesis = genesis();
    let engine = MockEngine::new(genesis);
    let tip = publish_chain(&log, "a", genesis, 3);

    let (lease, events) = ScriptedLease::new();
    let handle = spawn_manager(&log, "b", &engine, lease.clone(), events);

    wait_until("all entries are applied", || engine.head() == tip).await;
    wait_until("all entries are acknowledged", || log.pending_count("b") == 0).await;
    assert_eq!(handle.role(), Role::Follower);
    assert_eq!(lease.starts(), 1);
    handle.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn entries_published_by_itself_are_acknowledged_without_applying() {
    let log = MemoryLog::new();
    let genesis = genesis();
    let engine = MockEngine::new(genesis);

    let own = MockEngine::payload_on(&genesis, genesis.time + 500);
    log.append(LogEntry::to_fields("0x01", &encode_payload(&own).unwrap(), "b", 0));
    let tip = publish_chain(&log, "a", genesis, 1);

    let (lease, events) = ScriptedLease::new();
    let handle = spawn_manager(&log, "b", &engine, lease, events);

    wait_until("the foreign entry is applied", || engine.head() == tip).await;
    assert_eq!(engine.calls().new_payload.load(Ordering::Relaxed), 1);
    wait_until("all entries are acknowledged", || log.pending_count("b") == 0).await;
    handle.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn malformed_entries_are_dropped() {
    let log = MemoryLog::new();
    let genesis = genesis();
    let engine = MockEngine::new(genesis);
    log.append([(FIELD_SENDER_INSTANCE_ID, "a")]);
    let tip = publish_chain(&log, "a", genesis, 1);

    let (lease, events) = ScriptedLease::new();
    let handle = spawn_manager(&log, "b", &engine, lease, events);

    wait_until("the valid entry is applied", || engine.head() == tip).await;
    wait_until("both entries are acknowledged", || log.pending_count("b") == 0).await;
    assert_eq!(engine.calls().new_payload.load(Ordering::Relaxed), 1);
    handle.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn entry_that_does_not_extend_the_head_stays_pending() {
    let log = MemoryLog::new();
    let genesis = genesis();
    let engine = MockEngine::new(genesis);
    let mut elsewhere = genesis;
    elsewhere.hash = alloy_primitives::B256::repeat_byte(0x07);
    publish_chain(&log, "a", elsewhere, 1);

    let (lease, events) = ScriptedLease::new();
    let handle = spawn_manager(&log, "b", &engine, lease, events);

    wait_until("the entry is delivered", || log.pending_count("b") == 1).await;
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(log.pending_count("b"), 1);
    assert_eq!(engine.head(), genesis);
    assert_eq!(engine.calls().new_payload.load(Ordering::Relaxed), 0);
    handle.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn entries_delivered_before_a_restart_are_applied_first() {
    let log = MemoryLog::new();
    let genesis = genesis();
    let engine = MockEngine::new(genesis);
    let tip = publish_chain(&log, "a", genesis, 2);

    // the previous process read the first entry and died before acknowledging it
    let delivered = log.replication("b").read_entries(ReadKind::New).await.unwrap();
    assert_eq!(delivered.len(), 1);

    let (lease, events) = ScriptedLease::new();
    let handle = spawn_manager(&log, "b", &engine, lease, events);

    wait_until("both entries are applied", || engine.head() == tip).await;
    wait_until("both entries are acknowledged", || log.pending_count("b") == 0).await;
    handle.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn block_left_in_own_build_state_is_applied_on_start() {
    let log = MemoryLog::new();
    let genesis = genesis();
    let engine = MockEngine::new(genesis);

    let payload = MockEngine::payload_on(&genesis, genesis.time + 1_000);
    log.replication("b")
        .save_and_publish(&BuildState::finalize_block("0x01", encode_payload(&payload).unwrap()))
        .await
        .unwrap();

    let (lease, events) = ScriptedLease::new();
    let handle = spawn_manager(&log, "b", &engine, lease, events);

    wait_until("the leftover block is applied", || engine.head().height == genesis.height + 1).await;
    wait_until("the build state is reset", || {
        log.stored_build_state("b") == Some(BuildState::build_block())
    })
    .await;
    wait_until("its own entry is acknowledged", || log.pending_count("b") == 0).await;
    assert_eq!(engine.calls().new_payload.load(Ordering::Relaxed), 1);
    handle.shutdown(Duration::from_secs(5)).await.unwrap();
}
