//! The execution engine as seen by the block builder.
//!
//! [`ExecutionEngine`] is the seam between block production and the
//! execution client. [`EngineClient`] implements it over the authenticated
//! Engine API plus the node's public JSON-RPC endpoint.

use std::future::Future;

use alloy_primitives::B256;
use alloy_rpc_types_engine::{
    ExecutionPayloadV3, ForkchoiceState, ForkchoiceUpdated, PayloadAttributes, PayloadId,
    PayloadStatus,
};
use tandem_primitives::ExecutionHead;

mod client;
#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

pub use client::{ClientConfig, EngineClient};

/// JSON-RPC error code the Engine API uses for payloads it does not know.
pub const UNKNOWN_PAYLOAD_CODE: i64 = -38001;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("execution engine does not know the requested payload")]
    UnknownPayload,
    #[error("execution engine answered with error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("request to execution engine failed")]
    Transport(#[source] reqwest::Error),
    #[error("request to execution engine timed out")]
    Timeout(#[source] reqwest::Error),
    #[error("failed decoding execution engine response")]
    Decode(#[from] serde_json::Error),
    #[error("execution engine response carried neither a result nor an error")]
    EmptyResponse,
    #[error("failed signing engine api token: {0}")]
    Auth(String),
}

impl From<reqwest::Error> for EngineError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::Timeout(error)
        } else {
            Self::Transport(error)
        }
    }
}

/// Transaction counts as reported by `txpool_status`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TxPoolStatus {
    pub pending: u64,
    pub queued: u64,
}

impl TxPoolStatus {
    pub fn is_empty(&self) -> bool {
        self.pending == 0 && self.queued == 0
    }
}

/// The calls block production makes against the execution client.
///
/// Each call is a single attempt; retrying is the caller's concern.
pub trait ExecutionEngine: Send + Sync + 'static {
    /// Moves the canonical head and, if `attributes` are given, starts
    /// building a payload on top of it.
    fn fork_choice_updated(
        &self,
        state: ForkchoiceState,
        attributes: Option<PayloadAttributes>,
    ) -> impl Future<Output = Result<ForkchoiceUpdated, EngineError>> + Send;

    fn get_payload(
        &self,
        payload_id: PayloadId,
    ) -> impl Future<Output = Result<ExecutionPayloadV3, EngineError>> + Send;

    /// Submits a payload for validation and import.
    fn new_payload(
        &self,
        payload: ExecutionPayloadV3,
        parent_beacon_block_root: B256,
    ) -> impl Future<Output = Result<PayloadStatus, EngineError>> + Send;

    /// The latest canonical block.
    fn latest_head(&self) -> impl Future<Output = Result<ExecutionHead, EngineError>> + Send;

    fn txpool_status(&self) -> impl Future<Output = Result<TxPoolStatus, EngineError>> + Send;
}

impl<T: ExecutionEngine> ExecutionEngine for std::sync::Arc<T> {
    fn fork_choice_updated(
        &self,
        state: ForkchoiceState,
        attributes: Option<PayloadAttributes>,
    ) -> impl Future<Output = Result<ForkchoiceUpdated, EngineError>> + Send {
        (**self).fork_choice_updated(state, attributes)
    }

    fn get_payload(
        &self,
        payload_id: PayloadId,
    ) -> impl Future<Output = Result<ExecutionPayloadV3, EngineError>> + Send {
        (**self).get_payload(payload_id)
    }

    fn new_payload(
        &self,
        payload: ExecutionPayloadV3,
        parent_beacon_block_root: B256,
    ) -> impl Future<Output = Result<PayloadStatus, EngineError>> + Send {
        (**self).new_payload(payload, parent_beacon_block_root)
    }

    fn latest_head(&self) -> impl Future<Output = Result<ExecutionHead, EngineError>> + Send {
        (**self).latest_head()
    }

    fn txpool_status(&self) -> impl Future<Output = Result<TxPoolStatus, EngineError>> + Send {
        (**self).txpool_status()
    }
}
