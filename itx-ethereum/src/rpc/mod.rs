use std::time::Duration;

use alloy::{
    rpc::client::{ClientBuilder, ReqwestClient},
    transports::http::reqwest,
};
use alloy_primitives::{B256, U64};
use serde_json::json;
use tracing::instrument;

pub mod config;
pub mod errors;
mod retry;
pub mod types;

use crate::rpc::{
    config::RPCRetryConfig,
    errors::{RPCError, RequestError, RpcResultExt},
    retry::RetryPolicy,
    types::{CallFrame, GethTransactionTrace, ParityTransactionTraces, RpcBlock},
};

/// This struct wraps the ReqwestClient and provides the trace and block methods the internal
/// transaction pipeline needs, with retry logic on transient failures.
/// It is cheap to clone, as the `inner` internally uses an Arc for the ReqwestClient.
#[derive(Clone, Debug)]
pub struct EthereumRpcClient {
    inner: ReqwestClient,
    retry_policy: RetryPolicy,
    url: String,
}

impl EthereumRpcClient {
    /// Creates a new EthereumRpcClient with the given RPC URL.
    ///
    /// Retry: enabled with defaults (max retries 3, initial backoff 100ms, max backoff 5000ms).
    pub fn new(rpc_url: &str) -> Result<Self, RPCError> {
        let url = rpc_url
            .parse()
            .map_err(|e| RPCError::SetupError(format!("Invalid RPC URL: {e}")))?;

        // tracing a busy block can take a while on archive nodes
        let http_client = reqwest::ClientBuilder::new()
            .timeout(Duration::from_secs(120))
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .tcp_nodelay(true)
            .build()
            .map_err(|e| RPCError::SetupError(format!("Failed to create HTTP client: {e}")))?;

        let rpc = ClientBuilder::default().http_with_client(http_client, url);

        let retry_policy = RPCRetryConfig::default().into();

        Ok(Self { inner: rpc, retry_policy, url: rpc_url.to_string() })
    }

    pub fn get_url(&self) -> &str {
        &self.url
    }

    pub fn get_retry_config(&self) -> RPCRetryConfig {
        (&self.retry_policy).into()
    }

    pub fn with_retry(mut self, retry_config: RPCRetryConfig) -> Self {
        self.retry_policy = retry_config.into();
        self
    }

    /// Fetches a block with full transaction objects.
    #[instrument(level = "debug", skip(self))]
    pub async fn get_block_by_number(&self, block_number: u64) -> Result<RpcBlock, RPCError> {
        let full_tx_objects = true;

        let block: Option<RpcBlock> = self
            .retry_policy
            .retry_request(|| async {
                self.inner
                    .request("eth_getBlockByNumber", (U64::from(block_number), full_tx_objects))
                    .await
            })
            .await
            .with_rpc_context(|| format!("Failed to get block {block_number}"))?;

        block.ok_or_else(|| {
            RPCError::RequestError(RequestError::Other(format!(
                "Failed to get block {block_number}: Block not found"
            )))
        })
    }

    /// Replays every transaction of a block and returns their parity style call traces.
    #[instrument(level = "debug", skip(self))]
    pub async fn trace_replay_block_transactions(
        &self,
        block_number: u64,
    ) -> Result<Vec<ParityTransactionTraces>, RPCError> {
        self.retry_policy
            .retry_request(|| async {
                self.inner
                    .request("trace_replayBlockTransactions", (U64::from(block_number), ["trace"]))
                    .await
            })
            .await
            .with_rpc_context(|| format!("Failed to replay transactions of block {block_number}"))
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn trace_replay_transaction(
        &self,
        transaction_hash: B256,
    ) -> Result<ParityTransactionTraces, RPCError> {
        self.retry_policy
            .retry_request(|| async {
                self.inner
                    .request("trace_replayTransaction", (transaction_hash, ["trace"]))
                    .await
            })
            .await
            .with_rpc_context(|| format!("Failed to replay transaction {transaction_hash}"))
    }

    /// Runs geth's `callTracer` over a whole block.
    #[instrument(level = "debug", skip(self))]
    pub async fn debug_trace_block_by_number(
        &self,
        block_number: u64,
    ) -> Result<Vec<GethTransactionTrace>, RPCError> {
        self.retry_policy
            .retry_request(|| async {
                self.inner
                    .request(
                        "debug_traceBlockByNumber",
                        (U64::from(block_number), json!({"tracer": "callTracer"})),
                    )
                    .await
            })
            .await
            .with_rpc_context(|| format!("Failed to trace block {block_number}"))
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn debug_trace_transaction(
        &self,
        transaction_hash: B256,
    ) -> Result<CallFrame, RPCError> {
        self.retry_policy
            .retry_request(|| async {
                self.inner
                    .request(
                        "debug_traceTransaction",
                        (transaction_hash, json!({"tracer": "callTracer"})),
                    )
                    .await
            })
            .await
            .with_rpc_context(|| format!("Failed to trace transaction {transaction_hash}"))
    }
}
