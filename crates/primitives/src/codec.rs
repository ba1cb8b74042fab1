//! The compact payload encoding carried in log entries and build state.
//!
//! Payloads are written as named msgpack maps and then base64 encoded so that
//! they can travel as plain string fields. The alloy payload types nest and
//! flatten their fields for JSON, which does not survive a binary round trip,
//! so encoding goes through [`WirePayload`].

use alloy_eips::eip4895::Withdrawal;
use alloy_primitives::{Address, B256, Bloom, Bytes, U256};
use alloy_rpc_types_engine::{ExecutionPayloadV1, ExecutionPayloadV2, ExecutionPayloadV3};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("payload is not valid base64")]
    Base64(#[from] base64::DecodeError),
    #[error("failed writing payload as msgpack")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("failed reading payload from msgpack")]
    Decode(#[from] rmp_serde::decode::Error),
}

pub fn encode_payload(payload: &ExecutionPayloadV3) -> Result<String, CodecError> {
    let bytes = rmp_serde::to_vec_named(&WirePayload::from(payload))?;
    Ok(STANDARD.encode(bytes))
}

pub fn decode_payload(encoded: &str) -> Result<ExecutionPayloadV3, CodecError> {
    let bytes = STANDARD.decode(encoded)?;
    let wire: WirePayload = rmp_serde::from_slice(&bytes)?;
    Ok(wire.into())
}

#[derive(Serialize, Deserialize)]
struct WirePayload {
    parent_hash: B256,
    fee_recipient: Address,
    state_root: B256,
    receipts_root: B256,
    logs_bloom: Bloom,
    prev_randao: B256,
    block_number: u64,
    gas_limit: u64,
    gas_used: u64,
    timestamp: u64,
    extra_data: Bytes,
    base_fee_per_gas: U256,
    block_hash: B256,
    transactions: Vec<Bytes>,
    withdrawals: Vec<WireWithdrawal>,
    blob_gas_used: u64,
    excess_blob_gas: u64,
}

#[derive(Serialize, Deserialize)]
struct WireWithdrawal {
    index: u64,
    validator_index: u64,
    address: Address,
    amount: u64,
}

impl From<&ExecutionPayloadV3> for WirePayload {
    fn from(payload: &ExecutionPayloadV3) -> Self {
        let v2 = &payload.payload_inner;
        let v1 = &v2.payload_inner;
        Self {
            parent_hash: v1.parent_hash,
            fee_recipient: v1.fee_recipient,
            state_root: v1.state_root,
            receipts_root: v1.receipts_root,
            logs_bloom: v1.logs_bloom,
            prev_randao: v1.prev_randao,
            block_number: v1.block_number,
            gas_limit: v1.gas_limit,
            gas_used: v1.gas_used,
            timestamp: v1.timestamp,
            extra_data: v1.extra_data.clone(),
            base_fee_per_gas: v1.base_fee_per_gas,
            block_hash: v1.block_hash,
            transactions: v1.transactions.clone(),
            withdrawals: v2
                .withdrawals
                .iter()
                .map(|w| WireWithdrawal {
                    index: w.index,
                    validator_index: w.validator_index,
                    address: w.address,
                    amount: w.amount,
                })
                .collect(),
            blob_gas_used: payload.blob_gas_used,
            excess_blob_gas: payload.excess_blob_gas,
        }
    }
}

impl From<WirePayload> for ExecutionPayloadV3 {
    fn from(wire: WirePayload) -> Self {
        Self {
            payload_inner: ExecutionPayloadV2 {
                payload_inner: ExecutionPayloadV1 {
                    parent_hash: wire.parent_hash,
                    fee_recipient: wire.fee_recipient,
                    state_root: wire.state_root,
                    receipts_root: wire.receipts_root,
                    logs_bloom: wire.logs_bloom,
                    prev_randao: wire.prev_randao,
                    block_number: wire.block_number,
                    gas_limit: wire.gas_limit,
                    gas_used: wire.gas_used,
                    timestamp: wire.timestamp,
                    extra_data: wire.extra_data,
                    base_fee_per_gas: wire.base_fee_per_gas,
                    block_hash: wire.block_hash,
                    transactions: wire.transactions,
                },
                withdrawals: wire
                    .withdrawals
                    .into_iter()
                    .map(|w| Withdrawal {
                        index: w.index,
                        validator_index: w.validator_index,
                        address: w.address,
                        amount: w.amount,
                    })
                    .collect(),
            },
            blob_gas_used: wire.blob_gas_used,
            excess_blob_gas: wire.excess_blob_gas,
        }
    }
}
