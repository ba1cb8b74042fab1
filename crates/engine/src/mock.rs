//! An in-process stand-in for the execution client.
//!
//! Keeps just enough chain state to behave like the real thing toward the
//! block builder: payloads build on the requested head, imported blocks can
//! become canonical, and unknown payload ids are rejected. Tests can make
//! calls fail or force the status returned for imported payloads.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use alloy_primitives::{Address, B256, Bytes, U256, keccak256};
use alloy_rpc_types_engine::{
    ExecutionPayloadV1, ExecutionPayloadV2, ExecutionPayloadV3, ForkchoiceState,
    ForkchoiceUpdated, PayloadAttributes, PayloadId, PayloadStatus, PayloadStatusEnum,
};
use parking_lot::Mutex;
use tandem_primitives::ExecutionHead;

use crate::{EngineError, ExecutionEngine, TxPoolStatus};

#[derive(Clone, Debug)]
pub struct MockEngine {
    inner: Arc<Mutex<Chain>>,
    calls: Arc<Calls>,
}

#[derive(Debug, Default)]
pub struct Calls {
    pub fork_choice_updated: AtomicU64,
    pub get_payload: AtomicU64,
    pub new_payload: AtomicU64,
    pub latest_head: AtomicU64,
    pub txpool_status: AtomicU64,
}

#[derive(Debug)]
struct Chain {
    canonical: ExecutionHead,
    blocks: HashMap<B256, ExecutionHead>,
    built: HashMap<PayloadId, ExecutionPayloadV3>,
    next_payload_id: u64,
    txpool: TxPoolStatus,
    unavailable: bool,
    failures_left: u64,
    build_status: Option<PayloadStatusEnum>,
    import_status: Option<PayloadStatusEnum>,
    withhold_payload_id: bool,
    keep_built: bool,
}

impl MockEngine {
    /// A chain whose canonical head is `genesis`.
    pub fn new(genesis: ExecutionHead) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Chain {
                canonical: genesis,
                blocks: HashMap::from([(genesis.hash, genesis)]),
                built: HashMap::new(),
                next_payload_id: 1,
                txpool: TxPoolStatus {
                    pending: 1,
                    queued: 0,
                },
                unavailable: false,
                failures_left: 0,
                build_status: None,
                import_status: None,
                withhold_payload_id: false,
                keep_built: true,
            })),
            calls: Arc::default(),
        }
    }

    pub fn head(&self) -> ExecutionHead {
        self.inner.lock().canonical
    }

    pub fn calls(&self) -> &Calls {
        &self.calls
    }

    pub fn set_txpool(&self, pending: u64, queued: u64) {
        self.inner.lock().txpool = TxPoolStatus { pending, queued };
    }

    /// Every call fails with a transport-like error while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.lock().unavailable = unavailable;
    }

    /// The next `count` calls fail with a transport-like error.
    pub fn fail_next(&self, count: u64) {
        self.inner.lock().failures_left = count;
    }

    /// Status returned for forkchoice updates carrying payload attributes.
    pub fn set_build_status(&self, status: PayloadStatusEnum) {
        self.inner.lock().build_status = Some(status);
    }

    /// Status returned for imported payloads instead of accepting them.
    pub fn set_import_status(&self, status: PayloadStatusEnum) {
        self.inner.lock().import_status = Some(status);
    }

    pub fn withhold_payload_id(&self, withhold: bool) {
        self.inner.lock().withhold_payload_id = withhold;
    }

    /// While unset, payloads expire as soon as they are built.
    pub fn keep_built_payloads(&self, keep: bool) {
        self.inner.lock().keep_built = keep;
    }

    /// Builds a payload on top of `parent` without going through the
    /// forkchoice flow, as another leader would have.
    pub fn payload_on(parent: &ExecutionHead, timestamp: u64) -> ExecutionPayloadV3 {
        let number = parent.height + 1;
        let mut preimage = parent.hash.to_vec();
        preimage.extend_from_slice(&number.to_be_bytes());
        preimage.extend_from_slice(&timestamp.to_be_bytes());

        ExecutionPayloadV3 {
            payload_inner: ExecutionPayloadV2 {
                payload_inner: ExecutionPayloadV1 {
                    parent_hash: parent.hash,
                    fee_recipient: Address::ZERO,
                    state_root: B256::ZERO,
                    receipts_root: B256::ZERO,
                    logs_bloom: Default::default(),
                    prev_randao: parent.hash,
                    block_number: number,
                    gas_limit: 30_000_000,
                    gas_used: 0,
                    timestamp,
                    extra_data: Bytes::new(),
                    base_fee_per_gas: U256::from(7u64),
                    block_hash: keccak256(&preimage),
                    transactions: Vec::new(),
                },
                withdrawals: Vec::new(),
            },
            blob_gas_used: 0,
            excess_blob_gas: 0,
        }
    }

    fn check_available(&self) -> Result<(), EngineError> {
        let mut chain = self.inner.lock();
        if chain.failures_left > 0 {
            chain.failures_left -= 1;
            return Err(unreachable_engine());
        }
        if chain.unavailable {
            return Err(unreachable_engine());
        }
        Ok(())
    }
}

fn unreachable_engine() -> EngineError {
    EngineError::Rpc {
        code: -32000,
        message: "connection refused".to_owned(),
    }
}

impl ExecutionEngine for MockEngine {
    async fn fork_choice_updated(
        &self,
        state: ForkchoiceState,
        attributes: Option<PayloadAttributes>,
    ) -> Result<ForkchoiceUpdated, EngineError> {
        self.calls.fork_choice_updated.fetch_add(1, Ordering::Relaxed);
        self.check_available()?;
        let mut chain = self.inner.lock();

        let Some(parent) = chain.blocks.get(&state.head_block_hash).copied() else {
            return Ok(ForkchoiceUpdated::from_status(PayloadStatusEnum::Syncing));
        };

        chain.canonical = parent;
        let Some(attributes) = attributes else {
            return Ok(ForkchoiceUpdated::from_status(PayloadStatusEnum::Valid)
                .with_latest_valid_hash(parent.hash));
        };

        if let Some(status) = chain.build_status.clone() {
            return Ok(ForkchoiceUpdated::from_status(status));
        }

        let mut payload = Self::payload_on(&parent, attributes.timestamp);
        payload.payload_inner.payload_inner.prev_randao = attributes.prev_randao;
        payload.payload_inner.payload_inner.fee_recipient = attributes.suggested_fee_recipient;

        let id = PayloadId::new(chain.next_payload_id.to_be_bytes());
        chain.next_payload_id += 1;
        if chain.keep_built {
            chain.built.insert(id, payload);
        }

        let updated = ForkchoiceUpdated::from_status(PayloadStatusEnum::Valid)
            .with_latest_valid_hash(parent.hash);
        if chain.withhold_payload_id {
            Ok(updated)
        } else {
            Ok(updated.with_payload_id(id))
        }
    }

    async fn get_payload(&self, payload_id: PayloadId) -> Result<ExecutionPayloadV3, EngineError> {
        self.calls.get_payload.fetch_add(1, Ordering::Relaxed);
        self.check_available()?;
        self.inner
            .lock()
            .built
            .get(&payload_id)
            .cloned()
            .ok_or(EngineError::UnknownPayload)
    }

    async fn new_payload(
        &self,
        payload: ExecutionPayloadV3,
        _parent_beacon_block_root: B256,
    ) -> Result<PayloadStatus, EngineError> {
        self.calls.new_payload.fetch_add(1, Ordering::Relaxed);
        self.check_available()?;
        let mut chain = self.inner.lock();

        if let Some(status) = chain.import_status.clone() {
            return Ok(PayloadStatus::from_status(status));
        }

        let head = ExecutionHead::of_payload(&payload);
        if !chain
            .blocks
            .contains_key(&payload.payload_inner.payload_inner.parent_hash)
        {
            return Ok(PayloadStatus::from_status(PayloadStatusEnum::Syncing));
        }
        chain.blocks.insert(head.hash, head);
        Ok(PayloadStatus::new(PayloadStatusEnum::Valid, Some(head.hash)))
    }

    async fn latest_head(&self) -> Result<ExecutionHead, EngineError> {
        self.calls.latest_head.fetch_add(1, Ordering::Relaxed);
        self.check_available()?;
        Ok(self.inner.lock().canonical)
    }

    async fn txpool_status(&self) -> Result<TxPoolStatus, EngineError> {
        self.calls.txpool_status.fetch_add(1, Ordering::Relaxed);
        self.check_available()?;
        Ok(self.inner.lock().txpool)
    }
}
