//! The leader's durable [`BuildState`] and the shared log of finalized blocks.
//!
//! Handing a built block to the cluster is a single atomic step: the leader's
//! state moves to [`tandem_primitives::BuildStep::FinalizeBlock`] and the block is
//! appended to the log in the same transaction
//! ([`ReplicatedState::save_and_publish`]). A leader that crashes after this
//! point finds its block in its own state on restart; followers find it in
//! the log.
//!
//! Every instance reads the log through a consumer group of its own, so
//! delivery and acknowledgement are tracked per instance. Entries that were
//! delivered but not acknowledged are returned again by
//! [`ReadKind::Pending`] reads until they are acknowledged.

use std::{collections::HashMap, future::Future, sync::Arc, time::Duration};

use tandem_primitives::{BuildState, EntryId, LogEntry, MalformedEntry};

mod memory;
mod redis_stream;

pub use memory::{MemoryLog, MemoryReplication};
pub use redis_stream::RedisReplication;

/// Name of the stream all leaders append to.
pub const STREAM_NAME: &str = "tandem_block_stream";

/// How many entries a single read returns at most.
pub const READ_COUNT: usize = 1;

/// How long a read for new entries waits for one to arrive.
pub const READ_BLOCK: Duration = Duration::from_secs(1);

pub fn consumer_group(instance_id: &str) -> String {
    format!("tandem_consumer_group:{instance_id}")
}

pub fn consumer_name(instance_id: &str) -> String {
    format!("follower:{instance_id}")
}

pub fn build_state_key(instance_id: &str) -> String {
    format!("blockBuildState:{instance_id}")
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadKind {
    /// Entries delivered to this instance before but never acknowledged.
    Pending,
    /// Entries never delivered to this instance.
    New,
}

impl std::fmt::Display for ReadKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => f.write_str("pending"),
            Self::New => f.write_str("new"),
        }
    }
}

/// A log entry as delivered by the store, before its fields are checked.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: EntryId,
    pub fields: HashMap<String, String>,
}

impl StreamEntry {
    pub fn parse(&self) -> Result<LogEntry, MalformedEntry> {
        LogEntry::from_fields(self.id.clone(), &self.fields)
    }
}

pub trait ReplicatedState: Send + Sync + 'static {
    fn instance_id(&self) -> &str;

    /// Reads the durable build state, storing a fresh one if there is none,
    /// and refreshes the local copy.
    fn load_build_state(&self) -> impl Future<Output = eyre::Result<BuildState>> + Send;

    /// The local copy of the build state, loading it on first use.
    fn build_state(&self) -> impl Future<Output = eyre::Result<BuildState>> + Send;

    /// Stores `state` and appends its payload to the log in one transaction.
    ///
    /// On error neither write took effect.
    fn save_and_publish(&self, state: &BuildState) -> impl Future<Output = eyre::Result<()>> + Send;

    /// Stores a fresh [`BuildState::build_block`].
    fn reset_build_state(&self) -> impl Future<Output = eyre::Result<()>> + Send;

    fn read_entries(
        &self,
        kind: ReadKind,
    ) -> impl Future<Output = eyre::Result<Vec<StreamEntry>>> + Send;

    /// Acknowledges an entry for this instance. Acknowledging twice is fine.
    fn ack_entry(&self, id: &EntryId) -> impl Future<Output = eyre::Result<()>> + Send;
}

impl<T: ReplicatedState> ReplicatedState for Arc<T> {
    fn instance_id(&self) -> &str {
        (**self).instance_id()
    }

    fn load_build_state(&self) -> impl Future<Output = eyre::Result<BuildState>> + Send {
        (**self).load_build_state()
    }

    fn build_state(&self) -> impl Future<Output = eyre::Result<BuildState>> + Send {
        (**self).build_state()
    }

    fn save_and_publish(&self, state: &BuildState) -> impl Future<Output = eyre::Result<()>> + Send {
        (**self).save_and_publish(state)
    }

    fn reset_build_state(&self) -> impl Future<Output = eyre::Result<()>> + Send {
        (**self).reset_build_state()
    }

    fn read_entries(
        &self,
        kind: ReadKind,
    ) -> impl Future<Output = eyre::Result<Vec<StreamEntry>>> + Send {
        (**self).read_entries(kind)
    }

    fn ack_entry(&self, id: &EntryId) -> impl Future<Output = eyre::Result<()>> + Send {
        (**self).ack_entry(id)
    }
}

fn unix_nanos() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |since| u64::try_from(since.as_nanos()).unwrap_or(u64::MAX))
}
