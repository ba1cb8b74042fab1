use std::time::Duration;

use eyre::{WrapErr as _, eyre};
use parking_lot::Mutex;
use redis::{FromRedisValue, aio::ConnectionManager, streams::StreamReadReply};
use tandem_primitives::{BuildState, EntryId, LogEntry};
use tandem_telemetry_util::display_duration;
use tracing::{debug, info, instrument};

use crate::{
    READ_BLOCK, READ_COUNT, ReadKind, ReplicatedState, STREAM_NAME, StreamEntry, build_state_key,
    consumer_group, consumer_name, unix_nanos,
};

/// Build state in a Redis key and the block log in a Redis stream.
pub struct RedisReplication {
    connection: ConnectionManager,
    instance_id: String,
    group: String,
    consumer: String,
    key: String,
    response_timeout: Duration,
    cache: Mutex<Option<BuildState>>,
}

impl RedisReplication {
    /// Creates the instance's consumer group if it does not exist yet.
    ///
    /// Every command is given up on after `response_timeout`; reads for new
    /// entries additionally get the time they block on the server.
    #[instrument(skip_all, fields(%instance_id), err)]
    pub async fn new(
        connection: ConnectionManager,
        instance_id: &str,
        response_timeout: Duration,
    ) -> eyre::Result<Self> {
        let this = Self {
            connection,
            instance_id: instance_id.to_owned(),
            group: consumer_group(instance_id),
            consumer: consumer_name(instance_id),
            key: build_state_key(instance_id),
            response_timeout,
            cache: Mutex::new(None),
        };
        this.create_group().await?;
        Ok(this)
    }

    async fn create_group(&self) -> eyre::Result<()> {
        let mut create = redis::cmd("XGROUP");
        create
            .arg("CREATE")
            .arg(STREAM_NAME)
            .arg(&self.group)
            .arg("0")
            .arg("MKSTREAM");
        match self.query::<()>(&create, self.response_timeout).await {
            Ok(()) => {
                info!(group = %self.group, "created consumer group");
                Ok(())
            }
            Err(error)
                if error
                    .downcast_ref::<redis::RedisError>()
                    .is_some_and(|e| e.code() == Some("BUSYGROUP")) =>
            {
                debug!(group = %self.group, "consumer group already exists");
                Ok(())
            }
            Err(error) => Err(error).wrap_err_with(|| {
                format!("failed creating consumer group `{}`", self.group)
            }),
        }
    }

    async fn query<T: FromRedisValue>(&self, cmd: &redis::Cmd, limit: Duration) -> eyre::Result<T> {
        let mut connection = self.connection.clone();
        run_with_timeout(limit, cmd.query_async(&mut connection)).await
    }

    fn remember(&self, state: BuildState) {
        *self.cache.lock() = Some(state);
    }
}

async fn run_with_timeout<T>(
    limit: Duration,
    request: impl Future<Output = redis::RedisResult<T>>,
) -> eyre::Result<T> {
    match tokio::time::timeout(limit, request).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(eyre!("redis did not answer within {}", display_duration(limit))),
    }
}

fn to_stream_entries(reply: Option<StreamReadReply>) -> Vec<StreamEntry> {
    reply
        .into_iter()
        .flat_map(|reply| reply.keys)
        .flat_map(|key| key.ids)
        .map(|entry| StreamEntry {
            fields: entry
                .map
                .keys()
                .filter_map(|field| entry.get::<String>(field).map(|value| (field.clone(), value)))
                .collect(),
            id: EntryId::new(entry.id),
        })
        .collect()
}

impl ReplicatedState for RedisReplication {
    fn instance_id(&self) -> &str {
        &self.instance_id
    }

    #[instrument(skip_all, fields(key = %self.key), err)]
    async fn load_build_state(&self) -> eyre::Result<BuildState> {
        let mut get = redis::cmd("GET");
        get.arg(&self.key);
        let record: Option<Vec<u8>> = self
            .query(&get, self.response_timeout)
            .await
            .wrap_err("failed reading build state")?;

        let state = match record {
            Some(record) => {
                BuildState::from_record(&record).wrap_err("failed decoding stored build state")?
            }
            None => {
                let fresh = BuildState::build_block();
                let mut set = redis::cmd("SET");
                set.arg(&self.key)
                    .arg(fresh.to_record().wrap_err("failed encoding build state")?);
                self.query::<()>(&set, self.response_timeout)
                    .await
                    .wrap_err("failed storing initial build state")?;
                fresh
            }
        };
        self.remember(state.clone());
        Ok(state)
    }

    async fn build_state(&self) -> eyre::Result<BuildState> {
        let cached = self.cache.lock().clone();
        match cached {
            Some(state) => Ok(state),
            None => self.load_build_state().await,
        }
    }

    #[instrument(skip_all, fields(payload_id = %state.payload_id), err)]
    async fn save_and_publish(&self, state: &BuildState) -> eyre::Result<()> {
        let record = state.to_record().wrap_err("failed encoding build state")?;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("SET")
            .arg(&self.key)
            .arg(record)
            .ignore()
            .cmd("XADD")
            .arg(STREAM_NAME)
            .arg("*");
        for (field, value) in LogEntry::to_fields(
            &state.payload_id,
            &state.encoded_payload,
            &self.instance_id,
            unix_nanos(),
        ) {
            pipe.arg(field).arg(value);
        }
        pipe.ignore();

        let mut connection = self.connection.clone();
        let () = run_with_timeout(self.response_timeout, pipe.query_async(&mut connection))
            .await
            .wrap_err("transaction storing build state and appending to the log failed")?;

        self.remember(state.clone());
        Ok(())
    }

    #[instrument(skip_all, fields(key = %self.key), err)]
    async fn reset_build_state(&self) -> eyre::Result<()> {
        let fresh = BuildState::build_block();
        let mut set = redis::cmd("SET");
        set.arg(&self.key)
            .arg(fresh.to_record().wrap_err("failed encoding build state")?);
        self.query::<()>(&set, self.response_timeout)
            .await
            .wrap_err("failed resetting build state")?;
        self.remember(fresh);
        Ok(())
    }

    async fn read_entries(&self, kind: ReadKind) -> eyre::Result<Vec<StreamEntry>> {
        let start = match kind {
            ReadKind::Pending => "0",
            ReadKind::New => ">",
        };
        let mut read = redis::cmd("XREADGROUP");
        read.arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(READ_COUNT)
            .arg("BLOCK")
            .arg(u64::try_from(READ_BLOCK.as_millis()).unwrap_or(u64::MAX))
            .arg("STREAMS")
            .arg(STREAM_NAME)
            .arg(start);
        let reply: Option<StreamReadReply> = self
            .query(&read, self.response_timeout + READ_BLOCK)
            .await
            .wrap_err_with(|| format!("failed reading {kind} log entries"))?;
        Ok(to_stream_entries(reply))
    }

    async fn ack_entry(&self, id: &EntryId) -> eyre::Result<()> {
        let mut ack = redis::cmd("XACK");
        ack.arg(STREAM_NAME).arg(&self.group).arg(id.as_str());
        let _: i64 = self
            .query(&ack, self.response_timeout)
            .await
            .wrap_err_with(|| format!("failed acknowledging log entry `{id}`"))?;
        Ok(())
    }
}
