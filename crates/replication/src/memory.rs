//! Process-local replicated state.
//!
//! [`MemoryLog`] plays the role of the shared store; every instance gets its
//! own [`MemoryReplication`] handle with its own consumer group, exactly like
//! separate processes talking to one Redis.

use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};

use eyre::WrapErr as _;
use parking_lot::Mutex;
use tandem_primitives::{BuildState, EntryId, LogEntry};
use tokio::sync::Notify;

use crate::{READ_BLOCK, READ_COUNT, ReadKind, ReplicatedState, StreamEntry, build_state_key, consumer_group, unix_nanos};

#[derive(Clone, Debug, Default)]
pub struct MemoryLog {
    shared: Arc<Shared>,
}

#[derive(Debug, Default)]
struct Shared {
    store: Mutex<Store>,
    appended: Notify,
}

#[derive(Debug, Default)]
struct Store {
    entries: Vec<StreamEntry>,
    groups: HashMap<String, Group>,
    records: HashMap<String, Vec<u8>>,
    failing_writes: u32,
    lost_publish_replies: u32,
}

#[derive(Debug, Default)]
struct Group {
    /// Index of the first entry never delivered to this group.
    next: usize,
    /// Indices delivered but not yet acknowledged.
    pending: BTreeSet<usize>,
}

impl Store {
    fn check_write(&mut self) -> eyre::Result<()> {
        if self.failing_writes > 0 {
            self.failing_writes -= 1;
            eyre::bail!("store rejected the write");
        }
        Ok(())
    }

    fn check_publish_reply(&mut self) -> eyre::Result<()> {
        if self.lost_publish_replies > 0 {
            self.lost_publish_replies -= 1;
            eyre::bail!("store did not answer the publish in time");
        }
        Ok(())
    }

    fn push(&mut self, fields: HashMap<String, String>) -> EntryId {
        let id = EntryId::new(format!("{}-0", self.entries.len() + 1));
        self.entries.push(StreamEntry {
            id: id.clone(),
            fields,
        });
        id
    }
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// A handle for `instance_id`, creating its consumer group if needed.
    ///
    /// A new group starts at the beginning of the log.
    pub fn replication(&self, instance_id: impl Into<String>) -> MemoryReplication {
        let instance_id = instance_id.into();
        let group = consumer_group(&instance_id);
        self.shared
            .store
            .lock()
            .groups
            .entry(group.clone())
            .or_default();
        MemoryReplication {
            log: self.clone(),
            key: build_state_key(&instance_id),
            group,
            instance_id,
            cache: Mutex::new(None),
        }
    }

    /// Appends raw fields without touching any build state.
    pub fn append(&self, fields: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>) -> EntryId {
        let fields = fields
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        let id = self.shared.store.lock().push(fields);
        self.shared.appended.notify_waiters();
        id
    }

    pub fn entries(&self) -> Vec<StreamEntry> {
        self.shared.store.lock().entries.clone()
    }

    /// Entries delivered to `instance_id` and not acknowledged yet.
    pub fn pending_count(&self, instance_id: &str) -> usize {
        self.shared
            .store
            .lock()
            .groups
            .get(&consumer_group(instance_id))
            .map_or(0, |group| group.pending.len())
    }

    /// The build state as stored for `instance_id`, bypassing any handle's
    /// local copy.
    pub fn stored_build_state(&self, instance_id: &str) -> Option<BuildState> {
        let store = self.shared.store.lock();
        let record = store.records.get(&build_state_key(instance_id))?;
        BuildState::from_record(record).ok()
    }

    /// Makes the next `count` writes fail without any effect.
    pub fn fail_next_writes(&self, count: u32) {
        self.shared.store.lock().failing_writes = count;
    }

    /// Makes the next `count` publishes take effect in the store but still
    /// report failure to the publisher, whose cached build state stays as it
    /// was.
    pub fn lose_next_publish_replies(&self, count: u32) {
        self.shared.store.lock().lost_publish_replies = count;
    }

    fn deliver_pending(&self, group: &str) -> Vec<StreamEntry> {
        let store = self.shared.store.lock();
        let Some(state) = store.groups.get(group) else {
            return Vec::new();
        };
        state
            .pending
            .iter()
            .take(READ_COUNT)
            .map(|&index| store.entries[index].clone())
            .collect()
    }

    fn deliver_new(&self, group: &str) -> Vec<StreamEntry> {
        let mut store = self.shared.store.lock();
        let available = store.entries.len();
        let Some(state) = store.groups.get_mut(group) else {
            return Vec::new();
        };
        let delivered: Vec<usize> = (state.next..available).take(READ_COUNT).collect();
        state.next += delivered.len();
        state.pending.extend(delivered.iter().copied());
        delivered
            .into_iter()
            .map(|index| store.entries[index].clone())
            .collect()
    }
}

#[derive(Debug)]
pub struct MemoryReplication {
    log: MemoryLog,
    instance_id: String,
    group: String,
    key: String,
    cache: Mutex<Option<BuildState>>,
}

impl MemoryReplication {
    pub fn log(&self) -> &MemoryLog {
        &self.log
    }

    fn store_record(&self, state: &BuildState) -> eyre::Result<()> {
        let record = state.to_record().wrap_err("failed encoding build state")?;
        let mut store = self.log.shared.store.lock();
        store.check_write()?;
        store.records.insert(self.key.clone(), record);
        drop(store);
        *self.cache.lock() = Some(state.clone());
        Ok(())
    }
}

impl ReplicatedState for MemoryReplication {
    fn instance_id(&self) -> &str {
        &self.instance_id
    }

    async fn load_build_state(&self) -> eyre::Result<BuildState> {
        let stored = self.log.shared.store.lock().records.get(&self.key).cloned();
        let state = match stored {
            Some(record) => BuildState::from_record(&record).wrap_err("failed decoding stored build state")?,
            None => {
                let fresh = BuildState::build_block();
                self.store_record(&fresh)?;
                fresh
            }
        };
        *self.cache.lock() = Some(state.clone());
        Ok(state)
    }

    async fn build_state(&self) -> eyre::Result<BuildState> {
        let cached = self.cache.lock().clone();
        match cached {
            Some(state) => Ok(state),
            None => self.load_build_state().await,
        }
    }

    async fn save_and_publish(&self, state: &BuildState) -> eyre::Result<()> {
        let record = state.to_record().wrap_err("failed encoding build state")?;
        let fields = LogEntry::to_fields(
            &state.payload_id,
            &state.encoded_payload,
            &self.instance_id,
            unix_nanos(),
        )
        .into_iter()
        .map(|(k, v)| (k.to_owned(), v))
        .collect();

        let mut store = self.log.shared.store.lock();
        store.check_write()?;
        store.records.insert(self.key.clone(), record);
        store.push(fields);
        let reply = store.check_publish_reply();
        drop(store);

        self.log.shared.appended.notify_waiters();
        reply?;
        *self.cache.lock() = Some(state.clone());
        Ok(())
    }

    async fn reset_build_state(&self) -> eyre::Result<()> {
        self.store_record(&BuildState::build_block())
    }

    async fn read_entries(&self, kind: ReadKind) -> eyre::Result<Vec<StreamEntry>> {
        match kind {
            ReadKind::Pending => Ok(self.log.deliver_pending(&self.group)),
            ReadKind::New => {
                let appended = self.log.shared.appended.notified();
                tokio::pin!(appended);
                appended.as_mut().enable();

                let entries = self.log.deliver_new(&self.group);
                if !entries.is_empty() {
                    return Ok(entries);
                }
                let _ = tokio::time::timeout(READ_BLOCK, appended).await;
                Ok(self.log.deliver_new(&self.group))
            }
        }
    }

    async fn ack_entry(&self, id: &EntryId) -> eyre::Result<()> {
        let mut store = self.log.shared.store.lock();
        let Some(index) = store.entries.iter().position(|entry| &entry.id == id) else {
            return Ok(());
        };
        if let Some(group) = store.groups.get_mut(&self.group) {
            group.pending.remove(&index);
        }
        Ok(())
    }
}
