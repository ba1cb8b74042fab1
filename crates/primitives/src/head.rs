use alloy_primitives::B256;
use alloy_rpc_types_engine::ExecutionPayloadV3;

/// The tip of the local execution chain as last observed by the block builder.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExecutionHead {
    pub height: u64,
    pub hash: B256,
    /// Block timestamp in milliseconds.
    pub time: u64,
}

impl ExecutionHead {
    /// The head the chain moves to once `payload` is canonical.
    pub fn of_payload(payload: &ExecutionPayloadV3) -> Self {
        let block = &payload.payload_inner.payload_inner;
        Self {
            height: block.block_number,
            hash: block.block_hash,
            time: block.timestamp,
        }
    }
}

impl std::fmt::Display for ExecutionHead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{} ({})", self.height, self.hash)
    }
}
