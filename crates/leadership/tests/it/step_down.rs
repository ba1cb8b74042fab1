use std::time::Duration;

use tandem_engine::mock::MockEngine;
use tandem_leadership::{LeaseConfig, LocalLease, MemoryLeaseStore, Role};
use tandem_replication::MemoryLog;
use tokio_util::sync::CancellationToken;

use crate::support::{ScriptedLease, genesis, spawn_manager, wait_for_role, wait_until};

#[tokio::test(start_paused = true)]
async fn unreachable_engine_makes_the_leader_give_up_the_lease() {
    let log = MemoryLog::new();
    let genesis = genesis();
    let engine = MockEngine::new(genesis);
    engine.set_txpool(0, 0);

    let (lease, events) = ScriptedLease::new();
    let handle = spawn_manager(&log, "b", &engine, lease.clone(), events);
    lease.promote();
    wait_for_role(&handle, Role::Leader).await;

    engine.set_unavailable(true);
    wait_until("the lease is given up", || lease.resigns() == 1).await;
    wait_for_role(&handle, Role::Follower).await;
    wait_until("it competes again", || lease.starts() == 2).await;
    handle.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn two_instances_agree_on_one_chain() {
    let log = MemoryLog::new();
    let genesis = genesis();
    let store = MemoryLeaseStore::default();
    let shutdown = CancellationToken::new();

    let mut nodes = Vec::new();
    for id in ["a", "b"] {
        let engine = MockEngine::new(genesis);
        let (lease, events) = LocalLease::new(
            store.clone(),
            LeaseConfig {
                holder: id.to_owned(),
                ttl: Duration::from_millis(300),
                poll_interval: Duration::from_millis(100),
            },
        );
        lease.spawn(shutdown.clone());
        let handle = spawn_manager(&log, id, &engine, lease, events);
        nodes.push((engine, handle));
    }

    wait_until("both engines are three blocks ahead", || {
        nodes
            .iter()
            .all(|(engine, _)| engine.head().height >= genesis.height + 3)
    })
    .await;

    let leaders: Vec<_> = nodes
        .iter()
        .filter(|(_, handle)| handle.role() == Role::Leader)
        .collect();
    assert_eq!(leaders.len(), 1);
    let leader = store.holder().unwrap();
    for entry in log.entries() {
        assert_eq!(entry.parse().unwrap().sender_instance_id, leader);
    }

    for (_, handle) in nodes {
        handle.shutdown(Duration::from_secs(5)).await.unwrap();
    }
    shutdown.cancel();
    assert_eq!(store.holder(), None);
}
