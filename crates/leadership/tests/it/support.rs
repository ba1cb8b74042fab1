use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    time::{Duration, SystemTime},
};

use alloy_primitives::B256;
use tandem_block_builder::BlockBuilder;
use tandem_engine::mock::MockEngine;
use tandem_leadership::{Config, LeaderLease, LeaseEvent, Manager, ManagerHandle, Role};
use tandem_primitives::{ExecutionHead, LogEntry, encode_payload, unix_millis};
use tandem_replication::MemoryLog;
use tandem_retry::Policy;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// A lease driven by the test instead of a store.
#[derive(Clone)]
pub(crate) struct ScriptedLease {
    inner: Arc<Scripted>,
}

struct Scripted {
    events: mpsc::UnboundedSender<LeaseEvent>,
    held: AtomicBool,
    grant_on_start: AtomicBool,
    starts: AtomicU32,
    resigns: AtomicU32,
}

impl ScriptedLease {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<LeaseEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let lease = Self {
            inner: Arc::new(Scripted {
                events,
                held: AtomicBool::new(false),
                grant_on_start: AtomicBool::new(false),
                starts: AtomicU32::new(0),
                resigns: AtomicU32::new(0),
            }),
        };
        (lease, rx)
    }

    pub(crate) fn promote(&self) {
        self.inner.held.store(true, Ordering::SeqCst);
        let _ = self.inner.events.send(LeaseEvent::Promoted);
    }

    pub(crate) fn demote(&self) {
        self.inner.held.store(false, Ordering::SeqCst);
        let _ = self.inner.events.send(LeaseEvent::Demoted);
    }

    /// Hand out the lease whenever the manager starts competing.
    pub(crate) fn grant_on_start(&self) {
        self.inner.grant_on_start.store(true, Ordering::SeqCst);
    }

    pub(crate) fn starts(&self) -> u32 {
        self.inner.starts.load(Ordering::SeqCst)
    }

    pub(crate) fn resigns(&self) -> u32 {
        self.inner.resigns.load(Ordering::SeqCst)
    }
}

impl LeaderLease for ScriptedLease {
    fn start(&self) {
        self.inner.starts.fetch_add(1, Ordering::SeqCst);
        if self.inner.grant_on_start.load(Ordering::SeqCst) && !self.inner.held.swap(true, Ordering::SeqCst) {
            let _ = self.inner.events.send(LeaseEvent::Promoted);
        }
    }

    async fn resign(&self) -> eyre::Result<()> {
        self.inner.resigns.fetch_add(1, Ordering::SeqCst);
        if self.inner.held.swap(false, Ordering::SeqCst) {
            let _ = self.inner.events.send(LeaseEvent::Demoted);
        }
        Ok(())
    }
}

/// A chain whose head is a little in the past, so blocks built now extend it.
pub(crate) fn genesis() -> ExecutionHead {
    ExecutionHead {
        height: 100,
        hash: B256::repeat_byte(0x42),
        time: unix_millis(SystemTime::now()) - 10_000,
    }
}

pub(crate) fn builder_config() -> tandem_block_builder::Config {
    let fast = Policy::bounded()
        .with_initial_interval(Duration::from_millis(10))
        .with_max_interval(Duration::from_millis(100))
        .without_jitter();
    tandem_block_builder::Config {
        build_delay: Duration::from_millis(1),
        empty_block_delay: Duration::from_secs(3600),
        leading: fast.clone().with_max_attempts(3),
        following: Policy {
            max_attempts: None,
            ..fast
        },
        ..Default::default()
    }
}

pub(crate) fn manager_config() -> Config {
    Config {
        state_retry: Policy::unbounded()
            .with_initial_interval(Duration::from_millis(10))
            .with_max_interval(Duration::from_millis(100))
            .without_jitter(),
        error_pause: Duration::from_millis(100),
    }
}

pub(crate) fn spawn_manager<L: LeaderLease + Clone>(
    log: &MemoryLog,
    instance_id: &str,
    engine: &MockEngine,
    lease: L,
    events: mpsc::UnboundedReceiver<LeaseEvent>,
) -> ManagerHandle<L> {
    let builder = BlockBuilder::new(
        engine.clone(),
        Arc::new(log.replication(instance_id)),
        builder_config(),
        CancellationToken::new(),
    );
    Manager::new(builder, lease, events, manager_config()).spawn()
}

/// Appends `count` blocks extending `parent` as if `sender` had led, and
/// returns the last one.
pub(crate) fn publish_chain(
    log: &MemoryLog,
    sender: &str,
    parent: ExecutionHead,
    count: u64,
) -> ExecutionHead {
    let mut head = parent;
    for _ in 0..count {
        let payload = MockEngine::payload_on(&head, head.time + 1_000);
        log.append(LogEntry::to_fields(
            &format!("0x{:016x}", head.height + 1),
            &encode_payload(&payload).unwrap(),
            sender,
            0,
        ));
        head = ExecutionHead::of_payload(&payload);
    }
    head
}

pub(crate) async fn wait_for_role<L: LeaderLease>(handle: &ManagerHandle<L>, role: Role) {
    let mut roles = handle.subscribe_role();
    tokio::time::timeout(Duration::from_secs(60), roles.wait_for(|current| *current == role))
        .await
        .unwrap_or_else(|_| panic!("never became {role}"))
        .unwrap();
}

pub(crate) async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(60), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting until {what}");
}
