use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use alloy_primitives::{B256, Bytes, U64};
use alloy_rpc_types_engine::{
    Claims, ExecutionPayloadV3, ForkchoiceState, ForkchoiceUpdated, JwtSecret, PayloadAttributes,
    PayloadId, PayloadStatus,
};
use eyre::WrapErr as _;
use metrics::{counter, histogram};
use reqwest::Url;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::json;
use tandem_primitives::ExecutionHead;
use tracing::{debug, instrument};

use crate::{EngineError, ExecutionEngine, TxPoolStatus, UNKNOWN_PAYLOAD_CODE};

#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// The authenticated Engine API endpoint, usually port 8551.
    pub engine_url: Url,
    /// The public JSON-RPC endpoint, used for `txpool_status`.
    pub rpc_url: Url,
    pub jwt_secret: JwtSecret,
    /// Upper bound for a single request including reading the response.
    pub timeout: Duration,
}

/// JSON-RPC client for the execution engine.
#[derive(Debug)]
pub struct EngineClient {
    http: reqwest::Client,
    engine_url: Url,
    rpc_url: Url,
    jwt_secret: JwtSecret,
    next_request_id: AtomicU64,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Endpoint {
    Engine,
    Rpc,
}

#[derive(Serialize)]
struct RpcRequest<'a, P> {
    jsonrpc: &'a str,
    id: u64,
    method: &'a str,
    params: P,
}

#[derive(Deserialize)]
struct RpcResponse<R> {
    result: Option<R>,
    error: Option<RpcErrorObject>,
}

#[derive(Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetPayloadV4Response {
    execution_payload: ExecutionPayloadV3,
}

#[derive(Deserialize)]
struct BlockHeader {
    number: U64,
    hash: B256,
    timestamp: U64,
}

#[derive(Deserialize)]
struct TxPoolStatusResponse {
    pending: U64,
    queued: U64,
}

impl EngineClient {
    pub fn new(config: ClientConfig) -> eyre::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .wrap_err("failed building http client")?;
        Ok(Self {
            http,
            engine_url: config.engine_url,
            rpc_url: config.rpc_url,
            jwt_secret: config.jwt_secret,
            next_request_id: AtomicU64::new(1),
        })
    }

    async fn call<P, R>(&self, endpoint: Endpoint, method: &'static str, params: P) -> Result<R, EngineError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let started = Instant::now();
        let result = self.send(endpoint, method, params).await;
        histogram!("tandem_engine_request_duration_seconds", "endpoint" => method)
            .record(started.elapsed().as_secs_f64());
        if result.is_err() {
            counter!("tandem_engine_request_errors_total", "endpoint" => method).increment(1);
        }
        result
    }

    #[instrument(level = "debug", skip_all, fields(%method))]
    async fn send<P, R>(&self, endpoint: Endpoint, method: &str, params: P) -> Result<R, EngineError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let url = match endpoint {
            Endpoint::Engine => &self.engine_url,
            Endpoint::Rpc => &self.rpc_url,
        };

        let mut request = self.http.post(url.clone()).json(&RpcRequest {
            jsonrpc: "2.0",
            id,
            method,
            params,
        });
        if endpoint == Endpoint::Engine {
            request = request.bearer_auth(self.token()?);
        }

        let body = request.send().await?.error_for_status()?.bytes().await?;
        let response: RpcResponse<R> = serde_json::from_slice(&body)?;
        match (response.error, response.result) {
            (Some(error), _) if error.code == UNKNOWN_PAYLOAD_CODE => Err(EngineError::UnknownPayload),
            (Some(error), _) => {
                debug!(code = error.code, message = %error.message, "engine returned an error");
                Err(EngineError::Rpc {
                    code: error.code,
                    message: error.message,
                })
            }
            (None, Some(result)) => Ok(result),
            (None, None) => Err(EngineError::EmptyResponse),
        }
    }

    fn token(&self) -> Result<String, EngineError> {
        let iat = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        self.jwt_secret
            .encode(&Claims { iat, exp: None })
            .map_err(|e| EngineError::Auth(e.to_string()))
    }
}

impl ExecutionEngine for EngineClient {
    async fn fork_choice_updated(
        &self,
        state: ForkchoiceState,
        attributes: Option<PayloadAttributes>,
    ) -> Result<ForkchoiceUpdated, EngineError> {
        self.call(Endpoint::Engine, "engine_forkchoiceUpdatedV3", (state, attributes))
            .await
    }

    async fn get_payload(&self, payload_id: PayloadId) -> Result<ExecutionPayloadV3, EngineError> {
        let response: GetPayloadV4Response = self
            .call(Endpoint::Engine, "engine_getPayloadV4", (payload_id,))
            .await?;
        Ok(response.execution_payload)
    }

    async fn new_payload(
        &self,
        payload: ExecutionPayloadV3,
        parent_beacon_block_root: B256,
    ) -> Result<PayloadStatus, EngineError> {
        let versioned_hashes: Vec<B256> = Vec::new();
        let execution_requests: Vec<Bytes> = Vec::new();
        self.call(
            Endpoint::Engine,
            "engine_newPayloadV4",
            (payload, versioned_hashes, parent_beacon_block_root, execution_requests),
        )
        .await
    }

    async fn latest_head(&self) -> Result<ExecutionHead, EngineError> {
        let header: BlockHeader = self
            .call(Endpoint::Engine, "eth_getBlockByNumber", ("latest", false))
            .await?;
        Ok(ExecutionHead {
            height: header.number.to(),
            hash: header.hash,
            time: header.timestamp.to(),
        })
    }

    async fn txpool_status(&self) -> Result<TxPoolStatus, EngineError> {
        let status: TxPoolStatusResponse = self.call(Endpoint::Rpc, "txpool_status", json!([])).await?;
        Ok(TxPoolStatus {
            pending: status.pending.to(),
            queued: status.queued.to(),
        })
    }
}
