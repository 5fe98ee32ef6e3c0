//! [`InternalTransactionTracer`] backed by a JSON-RPC node.
//!
//! Parity style nodes (Nethermind, Erigon, Besu, ...) are traced through the `trace_replay*`
//! methods. Geth is traced through `debug_trace*` with the built-in `callTracer`, whose nested
//! frames are flattened into the same shape.

use std::collections::HashMap;

use async_trait::async_trait;
use futures03::future::join_all;
use itx_common::{
    models::{
        blockchain::{BlockSummary, TraceRequest, Transaction},
        error::{RpcErrorResponse, TraceError},
        internal_transaction::InternalTransaction,
        BlockNumber, JsonRpcVariant, TxHash,
    },
    traits::InternalTransactionTracer,
};
use serde_json::{json, Map, Value};
use tracing::{debug, instrument, warn};

use crate::rpc::{errors::RPCError, EthereumRpcClient};

mod geth;
mod parity;

/// Code reported for per transaction failures that geth embeds in an otherwise successful
/// `debug_traceBlockByNumber` answer.
const GETH_TRACE_FAILURE_CODE: i64 = -32000;
/// JSON-RPC internal error, used for transport failures merged into node responses.
const TRANSPORT_ERROR_CODE: i64 = -32603;

#[derive(Clone, Debug)]
pub struct EthereumTracer {
    client: EthereumRpcClient,
    variant: JsonRpcVariant,
}

impl EthereumTracer {
    pub fn new(client: EthereumRpcClient, variant: JsonRpcVariant) -> Self {
        Self { client, variant }
    }

    pub fn variant(&self) -> JsonRpcVariant {
        self.variant
    }

    async fn trace_block(
        &self,
        block_number: BlockNumber,
    ) -> Result<Vec<InternalTransaction>, TraceError> {
        if self.variant.uses_parity_traces() {
            self.trace_block_parity(block_number)
                .await
        } else {
            self.trace_block_geth(block_number)
                .await
        }
    }

    async fn trace_block_parity(
        &self,
        block_number: BlockNumber,
    ) -> Result<Vec<InternalTransaction>, TraceError> {
        let replays = self
            .client
            .trace_replay_block_transactions(block_number)
            .await
            .map_err(|e| to_trace_error(e, block_number, None))?;

        let mut result = Vec::new();
        for (transaction_index, replay) in replays.into_iter().enumerate() {
            let transaction_hash = replay.transaction_hash.ok_or_else(|| {
                TraceError::Transport(format!(
                    "replay of block {block_number} lacks the hash of transaction {transaction_index}"
                ))
            })?;
            let itxs = parity::to_internal_transactions(
                block_number,
                transaction_hash,
                transaction_index as u64,
                replay.trace,
            )
            .map_err(TraceError::Transport)?;
            result.extend(itxs);
        }
        Ok(result)
    }

    async fn trace_block_geth(
        &self,
        block_number: BlockNumber,
    ) -> Result<Vec<InternalTransaction>, TraceError> {
        let traces = self
            .client
            .debug_trace_block_by_number(block_number)
            .await
            .map_err(|e| to_trace_error(e, block_number, None))?;

        // older geth releases do not report the hash next to each trace
        let known_hashes = if traces
            .iter()
            .any(|t| t.tx_hash.is_none())
        {
            debug!(block_number, "Block trace lacks transaction hashes, fetching block");
            self.client
                .get_block_by_number(block_number)
                .await
                .map_err(|e| to_trace_error(e, block_number, None))?
                .transactions
                .into_iter()
                .map(|tx| tx.hash)
                .collect()
        } else {
            Vec::new()
        };

        let mut result = Vec::new();
        let mut errors = Vec::new();
        for (transaction_index, trace) in traces.into_iter().enumerate() {
            let Some(transaction_hash) = trace
                .tx_hash
                .or_else(|| known_hashes.get(transaction_index).copied())
            else {
                return Err(TraceError::Transport(format!(
                    "block {block_number} has no transaction at index {transaction_index}"
                )));
            };
            match (trace.result, trace.error) {
                (_, Some(message)) => errors.push(annotate(
                    RpcErrorResponse::new(GETH_TRACE_FAILURE_CODE, message, None),
                    block_number,
                    Some(transaction_hash),
                )),
                (Some(frame), None) => result.extend(
                    geth::to_internal_transactions(
                        block_number,
                        transaction_hash,
                        transaction_index as u64,
                        frame,
                    )
                    .map_err(TraceError::Transport)?,
                ),
                (None, None) => {
                    return Err(TraceError::Transport(format!(
                        "empty trace for transaction {transaction_hash}"
                    )))
                }
            }
        }

        if errors.is_empty() {
            Ok(result)
        } else {
            Err(TraceError::Responses(errors))
        }
    }

    async fn trace_transaction(
        &self,
        request: &TraceRequest,
    ) -> Result<Vec<InternalTransaction>, TraceError> {
        let TraceRequest { block_number, transaction_hash, transaction_index } = *request;
        let to_error = |e| to_trace_error(e, block_number, Some(transaction_hash));
        let itxs = if self.variant.uses_parity_traces() {
            let replay = self
                .client
                .trace_replay_transaction(transaction_hash)
                .await
                .map_err(to_error)?;
            parity::to_internal_transactions(
                block_number,
                transaction_hash,
                transaction_index,
                replay.trace,
            )
        } else {
            let root = self
                .client
                .debug_trace_transaction(transaction_hash)
                .await
                .map_err(to_error)?;
            geth::to_internal_transactions(block_number, transaction_hash, transaction_index, root)
        };
        itxs.map_err(TraceError::Transport)
    }
}

#[async_trait]
impl InternalTransactionTracer for EthereumTracer {
    #[instrument(skip(self), fields(variant = %self.variant))]
    async fn fetch_block_internal_transactions(
        &self,
        block_numbers: &[BlockNumber],
    ) -> Result<Vec<InternalTransaction>, TraceError> {
        let results = join_all(
            block_numbers
                .iter()
                .map(|&block| self.trace_block(block)),
        )
        .await;
        let mut itxs = collect_results(results)?;
        assign_block_indexes(&mut itxs);
        Ok(itxs)
    }

    #[instrument(skip_all, fields(variant = %self.variant, transactions = requests.len()))]
    async fn fetch_internal_transactions(
        &self,
        requests: &[TraceRequest],
    ) -> Result<Vec<InternalTransaction>, TraceError> {
        let results = join_all(
            requests
                .iter()
                .map(|request| self.trace_transaction(request)),
        )
        .await;
        let mut itxs = collect_results(results)?;
        assign_block_indexes(&mut itxs);
        Ok(itxs)
    }

    #[instrument(skip(self))]
    async fn fetch_blocks_by_number(
        &self,
        block_numbers: &[BlockNumber],
    ) -> Result<Vec<BlockSummary>, TraceError> {
        let results = join_all(block_numbers.iter().map(|&block_number| async move {
            let block = self
                .client
                .get_block_by_number(block_number)
                .await
                .map_err(|e| to_trace_error(e, block_number, None))?;
            let transactions = block
                .transactions
                .into_iter()
                .map(|tx| {
                    Transaction::new(
                        tx.hash,
                        block_number,
                        tx.transaction_index.to(),
                        tx.from,
                        tx.to,
                        tx.tx_type.map(|t| t.to()),
                    )
                })
                .collect();
            Ok::<_, TraceError>(vec![BlockSummary::new(block_number, block.hash, transactions)])
        }))
        .await;
        collect_results(results)
    }
}

/// Concatenates successful results in request order, or merges every failure into one error.
///
/// An unsupported backend wins over everything else. Node error objects of all failed requests
/// are reported together, with any transport failure folded in as an internal error object.
fn collect_results<T>(results: Vec<Result<Vec<T>, TraceError>>) -> Result<Vec<T>, TraceError> {
    let mut items = Vec::new();
    let mut errors = Vec::new();
    for result in results {
        match result {
            Ok(batch) => items.extend(batch),
            Err(err) => errors.push(err),
        }
    }
    if errors.is_empty() {
        return Ok(items);
    }

    if let Some(unsupported) = errors
        .iter()
        .find(|e| matches!(e, TraceError::Unsupported(_)))
    {
        return Err(unsupported.clone());
    }
    let has_responses = errors
        .iter()
        .any(|e| matches!(e, TraceError::Responses(_)));
    if !has_responses {
        return errors
            .into_iter()
            .next()
            .map_or(Ok(items), Err);
    }

    // node answers name the blocks to refetch, so they must survive a transport failure
    // elsewhere in the same batch
    Err(TraceError::Responses(
        errors
            .into_iter()
            .flat_map(|e| match e {
                TraceError::Responses(responses) => responses,
                TraceError::Transport(reason) => {
                    vec![RpcErrorResponse::new(TRANSPORT_ERROR_CODE, reason, None)]
                }
                TraceError::Unsupported(_) => Vec::new(),
            })
            .collect(),
    ))
}

/// Numbers frames consecutively within each block, in the order they were produced.
fn assign_block_indexes(itxs: &mut [InternalTransaction]) {
    let mut counters: HashMap<BlockNumber, u64> = HashMap::new();
    for itx in itxs {
        let counter = counters
            .entry(itx.block_number)
            .or_default();
        itx.block_index = *counter;
        *counter += 1;
    }
}

fn to_trace_error(
    err: RPCError,
    block_number: BlockNumber,
    transaction_hash: Option<TxHash>,
) -> TraceError {
    if err.is_method_not_found() {
        warn!(error = %err, "Trace node does not implement the tracing method");
        return TraceError::Unsupported(err.to_string());
    }
    match err.error_response() {
        Some(response) => {
            TraceError::Responses(vec![annotate(response, block_number, transaction_hash)])
        }
        None => TraceError::Transport(err.to_string()),
    }
}

/// Adds the request's block number and transaction hash to the error data unless the node
/// already reported them.
fn annotate(
    mut response: RpcErrorResponse,
    block_number: BlockNumber,
    transaction_hash: Option<TxHash>,
) -> RpcErrorResponse {
    let mut data = match response.data.take() {
        Some(Value::Object(map)) => map,
        None | Some(Value::Null) => Map::new(),
        Some(other) => {
            let mut map = Map::new();
            map.insert("data".to_string(), other);
            map
        }
    };
    if !data.contains_key("blockNumber") && !data.contains_key("block_number") {
        data.insert("blockNumber".to_string(), json!(block_number));
    }
    if let Some(hash) = transaction_hash {
        data.entry("transactionHash")
            .or_insert_with(|| json!(hash));
    }
    response.data = Some(Value::Object(data));
    response
}
