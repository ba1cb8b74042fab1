//! Block production against the execution engine.
//!
//! As leader, [`BlockBuilder::build_block`] asks the engine for a new block on
//! top of the current head and hands it to the replicated state, which stores
//! it and announces it to the cluster in one step.
//! [`BlockBuilder::finalize_block`] then makes a block canonical, whether it
//! was built here or replayed from another leader's log entry.
//!
//! Every payload is checked against the builder's [`ExecutionHead`] before it
//! is submitted: it must sit exactly one block above the head and reference
//! it as parent. This fencing is what keeps redelivered entries and
//! overlapping leaders from forking the chain.

use std::{
    future::Future,
    time::{Duration, SystemTime},
};

use alloy_primitives::Address;
use alloy_rpc_types_engine::{
    ExecutionPayloadV3, ForkchoiceState, PayloadAttributes, PayloadId, PayloadStatusEnum,
};
use metrics::{counter, gauge};
use tandem_engine::{EngineError, ExecutionEngine};
use tandem_primitives::{
    BuildState, BuildStep, EntryId, ExecutionHead, decode_payload, encode_payload, unix_millis,
};
use tandem_replication::ReplicatedState;
use tandem_retry::{Outcome, Policy, RetryError, retry, sleep_or_cancel};
use tandem_telemetry_util::{display_duration, error_field};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

mod error;

pub use error::Error;


#[derive(Clone, Debug)]
pub struct Config {
    /// Receives the fees of every block built here.
    pub fee_recipient: Address,
    /// Time the engine gets to fill a payload before it is fetched.
    pub build_delay: Duration,
    /// Minimum spacing between blocks that carry no transactions.
    pub empty_block_delay: Duration,
    /// Retries on the leader's critical path.
    pub leading: Policy,
    /// Retries when applying blocks that are already final elsewhere.
    pub following: Policy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            fee_recipient: Address::ZERO,
            build_delay: Duration::from_millis(1),
            empty_block_delay: Duration::from_secs(60),
            leading: Policy::bounded(),
            following: Policy::unbounded(),
        }
    }
}

/// A block handed off to the replicated state.
#[derive(Clone, Debug)]
pub struct BuiltBlock {
    pub payload_id: PayloadId,
    pub height: u64,
    pub timestamp: u64,
    pub transactions: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Applier {
    /// The leader finalizing the block it just built.
    Leader,
    /// A follower replaying an entry of the shared log.
    Follower,
    /// Replaying this node's own build state after a restart or demotion.
    Recovery,
}

impl Applier {
    fn as_str(self) -> &'static str {
        match self {
            Self::Leader => "leader",
            Self::Follower => "follower",
            Self::Recovery => "recovery",
        }
    }
}

pub struct BlockBuilder<E, S> {
    engine: E,
    state: S,
    config: Config,
    head: Option<ExecutionHead>,
    /// Wall-clock milliseconds at which the last block built and finalized
    /// here was started; anchors the empty-block throttle.
    last_built_at: Option<u64>,
    /// Start of the published block that still awaits finalization.
    published_at: Option<u64>,
    cancel: CancellationToken,
}

impl<E: ExecutionEngine, S: ReplicatedState> BlockBuilder<E, S> {
    pub fn new(engine: E, state: S, config: Config, cancel: CancellationToken) -> Self {
        Self {
            engine,
            state,
            config,
            head: None,
            last_built_at: None,
            published_at: None,
            cancel,
        }
    }

    pub fn head(&self) -> Option<ExecutionHead> {
        self.head
    }

    pub fn state(&self) -> &S {
        &self.state
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The token that aborts every engine call, retry and wait of this
    /// builder.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Forgets when the last block was built, so that pacing restarts from
    /// the chain head.
    pub fn reset_pacing(&mut self) {
        self.last_built_at = None;
        self.published_at = None;
    }

    /// Builds the next block on top of the head and publishes it.
    ///
    /// On success the replicated build state is in its finalize step and the
    /// block is in the shared log; it still has to be passed to
    /// [`Self::finalize_block`]. Empty blocks are paced from the last block
    /// whose finalization succeeded.
    #[instrument(skip_all, fields(height))]
    pub async fn build_block(&mut self, now: SystemTime) -> Result<BuiltBlock, Error> {
        let head = self.ensure_head().await?;
        tracing::Span::current().record("height", head.height + 1);
        let now = unix_millis(now);
        self.published_at = None;

        let engine = &self.engine;
        let txpool = retrying("txpool_status", &self.config.leading, &self.cancel, || async move {
            Outcome::from(engine.txpool_status().await.map_err(Error::Engine))
        })
        .await?;

        if txpool.is_empty() {
            let anchor = self.last_built_at.unwrap_or(head.time);
            let empty_delay = u64::try_from(self.config.empty_block_delay.as_millis()).unwrap_or(u64::MAX);
            let elapsed = now.saturating_sub(anchor);
            if elapsed < empty_delay {
                counter!("tandem_empty_blocks_skipped_total").increment(1);
                return Err(Error::EmptyBlock {
                    retry_after: Duration::from_millis(empty_delay - elapsed),
                });
            }
        }

        let timestamp = now.max(head.time + 1);
        if timestamp > now {
            let wait = Duration::from_millis(timestamp - now);
            debug!(wait = %display_duration(wait), "head is ahead of the local clock; waiting");
            if !sleep_or_cancel(wait, &self.cancel).await {
                return Err(Error::Cancelled);
            }
        }

        let forkchoice = forkchoice_at(head);
        let attributes = PayloadAttributes {
            timestamp,
            prev_randao: head.hash,
            suggested_fee_recipient: self.config.fee_recipient,
            withdrawals: Some(Vec::new()),
            parent_beacon_block_root: Some(head.hash),
        };
        let payload_id = retrying("fork_choice_updated", &self.config.leading, &self.cancel, || {
            let attributes = attributes.clone();
            async move {
                let updated = match engine.fork_choice_updated(forkchoice, Some(attributes)).await {
                    Ok(updated) => updated,
                    Err(error) => return Outcome::Retryable(Error::Engine(error)),
                };
                match (updated.payload_status.status, updated.payload_id) {
                    (PayloadStatusEnum::Valid, Some(payload_id)) => Outcome::Success(payload_id),
                    (PayloadStatusEnum::Valid, None) => Outcome::Permanent(Error::MissingPayloadId),
                    (status, _) => Outcome::Permanent(Error::UnexpectedBuildStatus {
                        status: status.as_str().to_owned(),
                    }),
                }
            }
        })
        .await
        .inspect_err(|e| log_failure(e, "build request failed", &head))?;

        if !sleep_or_cancel(self.config.build_delay, &self.cancel).await {
            return Err(Error::Cancelled);
        }

        let payload = retrying("get_payload", &self.config.leading, &self.cancel, || async move {
            match engine.get_payload(payload_id).await {
                Ok(payload) => Outcome::Success(payload),
                Err(EngineError::UnknownPayload) => Outcome::Permanent(Error::UnknownPayload),
                Err(error) => Outcome::Retryable(Error::Engine(error)),
            }
        })
        .await
        .inspect_err(|e| log_failure(e, "fetching built payload failed", &head))?;

        let encoded = encode_payload(&payload).map_err(Error::Encode)?;
        let state = BuildState::finalize_block(payload_id.to_string(), encoded);
        self.state
            .save_and_publish(&state)
            .await
            .map_err(Error::State)?;
        self.published_at = Some(now);

        let block = &payload.payload_inner.payload_inner;
        counter!("tandem_blocks_built_total").increment(1);
        info!(
            %payload_id,
            height = block.block_number,
            hash = %block.block_hash,
            timestamp = block.timestamp,
            transactions = block.transactions.len(),
            "built and published block",
        );
        Ok(BuiltBlock {
            payload_id,
            height: block.block_number,
            timestamp: block.timestamp,
            transactions: block.transactions.len(),
        })
    }

    /// Makes the encoded payload the canonical head.
    ///
    /// `entry` is the log entry being replayed, if any. Replays retry engine
    /// calls without limit; the leader finalizing its own block gives up after
    /// the bounded policy is exhausted.
    #[instrument(skip_all, fields(%payload_id, entry_id = entry.map(tracing::field::display)))]
    pub async fn finalize_block(
        &mut self,
        payload_id: &str,
        encoded_payload: &str,
        entry: Option<&EntryId>,
    ) -> Result<ExecutionHead, Error> {
        let applier = if entry.is_some() {
            Applier::Follower
        } else {
            Applier::Leader
        };
        self.finalize(payload_id, encoded_payload, applier).await
    }

    /// Finalizes a block this node built but may not have applied before it
    /// stopped leading, then resets the build state.
    ///
    /// A block that turns out to be applied already counts as done. One that
    /// can never be applied is logged and dropped.
    #[instrument(skip_all, err)]
    pub async fn recover_last_payload(&mut self) -> Result<(), Error> {
        let store = &self.state;
        let state = retrying("build_state", &self.config.following, &self.cancel, || async move {
            Outcome::from(store.build_state().await.map_err(Error::State))
        })
        .await?;

        if state.has_pending_payload() {
            info!(payload_id = %state.payload_id, "replaying block left in build state");
            let mut backoff = self.config.following.backoff();
            loop {
                match self
                    .finalize(&state.payload_id, &state.encoded_payload, Applier::Recovery)
                    .await
                {
                    Ok(_) => break,
                    Err(error) if error.is_already_applied() => {
                        info!(payload_id = %state.payload_id, "block was applied before; nothing to replay");
                        break;
                    }
                    Err(Error::Cancelled) => return Err(Error::Cancelled),
                    Err(error) if error.is_permanent() => {
                        error!(
                            payload_id = %state.payload_id,
                            error = error_field(&error),
                            "block left in build state can never be applied; dropping it",
                        );
                        break;
                    }
                    Err(error) => {
                        let delay = backoff.next_delay().unwrap_or(self.config.following.max_interval);
                        warn!(
                            error = error_field(&error),
                            retry_after = %display_duration(delay),
                            "replaying block left in build state failed; retrying",
                        );
                        if !sleep_or_cancel(delay, &self.cancel).await {
                            return Err(Error::Cancelled);
                        }
                    }
                }
            }
        }

        if state.step != BuildStep::BuildBlock {
            let store = &self.state;
            retrying("reset_build_state", &self.config.following, &self.cancel, || async move {
                Outcome::from(store.reset_build_state().await.map_err(Error::State))
            })
            .await?;
        }
        Ok(())
    }

    async fn finalize(
        &mut self,
        payload_id: &str,
        encoded_payload: &str,
        applier: Applier,
    ) -> Result<ExecutionHead, Error> {
        if payload_id.is_empty() || encoded_payload.is_empty() {
            return Err(Error::EmptyPayload);
        }
        let payload = decode_payload(encoded_payload)?;
        let head = self.ensure_head().await?;

        validate(&payload, &head).inspect_err(|e| {
            if !e.is_already_applied() {
                error!(
                    payload_id,
                    head_height = head.height,
                    head_hash = %head.hash,
                    error = error_field(e),
                    "payload does not extend the local head",
                );
            }
        })?;

        let policy = match applier {
            Applier::Leader => &self.config.leading,
            Applier::Follower | Applier::Recovery => &self.config.following,
        };
        let next = ExecutionHead::of_payload(&payload);
        let engine = &self.engine;

        retrying("new_payload", policy, &self.cancel, || {
            let payload = payload.clone();
            async move {
                match engine.new_payload(payload, head.hash).await {
                    Ok(status) => accept_status(status.status, status.latest_valid_hash, "new_payload"),
                    Err(error) => Outcome::Retryable(Error::Engine(error)),
                }
            }
        })
        .await
        .inspect_err(|e| log_failure(e, "submitting payload failed", &next))?;

        let forkchoice = forkchoice_at(next);
        retrying("fork_choice_updated", policy, &self.cancel, || async move {
            match engine.fork_choice_updated(forkchoice, None).await {
                Ok(updated) => accept_status(
                    updated.payload_status.status,
                    updated.payload_status.latest_valid_hash,
                    "fork_choice_updated",
                ),
                Err(error) => Outcome::Retryable(Error::Engine(error)),
            }
        })
        .await
        .inspect_err(|e| log_failure(e, "moving head to payload failed", &next))?;

        self.head = Some(next);
        if applier == Applier::Leader
            && let Some(started) = self.published_at.take()
        {
            self.last_built_at = Some(started);
        }
        gauge!("tandem_execution_head_height").set(next.height as f64);
        counter!("tandem_blocks_finalized_total", "role" => applier.as_str()).increment(1);
        info!(
            payload_id,
            height = next.height,
            hash = %next.hash,
            role = applier.as_str(),
            "finalized block",
        );
        Ok(next)
    }

    /// The head, fetched from the engine the first time it is needed.
    async fn ensure_head(&mut self) -> Result<ExecutionHead, Error> {
        if let Some(head) = self.head {
            return Ok(head);
        }
        let engine = &self.engine;
        let head = retrying("latest_head", &self.config.leading, &self.cancel, || async move {
            Outcome::from(engine.latest_head().await.map_err(Error::Engine))
        })
        .await
        .inspect_err(|e| {
            error!(error = error_field(e), "failed reading execution head from engine");
        })?;

        info!(height = head.height, hash = %head.hash, "initialized execution head from engine");
        gauge!("tandem_execution_head_height").set(head.height as f64);
        self.head = Some(head);
        Ok(head)
    }
}

fn forkchoice_at(head: ExecutionHead) -> ForkchoiceState {
    ForkchoiceState {
        head_block_hash: head.hash,
        safe_block_hash: head.hash,
        finalized_block_hash: head.hash,
    }
}

fn validate(payload: &ExecutionPayloadV3, head: &ExecutionHead) -> Result<(), Error> {
    let block = &payload.payload_inner.payload_inner;
    let expected = head.height + 1;
    if block.block_number != expected {
        return Err(Error::InvalidHeight {
            got: block.block_number,
            expected,
        });
    }
    if block.parent_hash != head.hash {
        return Err(Error::InvalidParentHash {
            got: block.parent_hash,
            expected: head.hash,
        });
    }
    // the first block may carry any timestamp relative to genesis
    if block.block_number > 1 && block.timestamp <= head.time {
        return Err(Error::InvalidTimestamp {
            got: block.timestamp,
            parent: head.time,
        });
    }
    if block.prev_randao != head.hash {
        return Err(Error::InvalidRandom {
            got: block.prev_randao,
            expected: head.hash,
        });
    }
    Ok(())
}

fn accept_status(
    status: PayloadStatusEnum,
    latest_valid_hash: Option<alloy_primitives::B256>,
    call: &'static str,
) -> Outcome<(), Error> {
    match status {
        PayloadStatusEnum::Valid => Outcome::Success(()),
        PayloadStatusEnum::Invalid { validation_error } => Outcome::Permanent(Error::PayloadInvalid {
            validation_error,
            latest_valid_hash,
        }),
        PayloadStatusEnum::Syncing | PayloadStatusEnum::Accepted => {
            info!(call, status = status.as_str(), "engine has not fully validated the payload yet; continuing");
            Outcome::Success(())
        }
    }
}

fn log_failure(error: &Error, message: &str, block: &ExecutionHead) {
    match error {
        Error::Cancelled => {}
        error if error.is_permanent() || error.is_retries_exhausted() => error!(
            height = block.height,
            hash = %block.hash,
            error = error_field(error),
            "{message}",
        ),
        error => warn!(height = block.height, error = error_field(error), "{message}"),
    }
}

async fn retrying<T, F, Fut>(
    operation: &'static str,
    policy: &Policy,
    cancel: &CancellationToken,
    attempt: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Outcome<T, Error>>,
{
    retry(policy, cancel, attempt).await.map_err(|error| match error {
        RetryError::Permanent(error) => error,
        RetryError::Exhausted { attempts, last } => Error::RetriesExhausted {
            operation,
            attempts,
            last: Box::new(last),
        },
        RetryError::Cancelled => Error::Cancelled,
    })
}
