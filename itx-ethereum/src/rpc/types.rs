//! Wire types of the trace and block RPC methods.
//!
//! Only the fields the pipeline consumes are decoded; everything else in the node's answer is
//! ignored.

use alloy_primitives::{Address, Bytes, B256, U256, U64};
use serde::Deserialize;
use serde_json::Value;

/// One element of `trace_replayBlockTransactions`, or the answer of `trace_replayTransaction`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParityTransactionTraces {
    /// Absent in the answer of `trace_replayTransaction`.
    #[serde(default)]
    pub transaction_hash: Option<B256>,
    #[serde(default)]
    pub trace: Vec<ParityTrace>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParityTrace {
    #[serde(rename = "type")]
    pub trace_type: String,
    pub action: Value,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub trace_address: Vec<u32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParityCallAction {
    pub call_type: String,
    pub from: Address,
    pub to: Address,
    pub gas: U64,
    pub input: Bytes,
    pub value: U256,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParityCreateAction {
    pub from: Address,
    pub gas: U64,
    pub init: Bytes,
    pub value: U256,
    /// `create` or `create2`. Older nodes omit it.
    #[serde(default)]
    pub creation_method: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParitySuicideAction {
    pub address: Address,
    pub refund_address: Address,
    pub balance: U256,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParityCallResult {
    pub gas_used: U64,
    #[serde(default)]
    pub output: Option<Bytes>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParityCreateResult {
    pub gas_used: U64,
    pub address: Address,
    #[serde(default)]
    pub code: Option<Bytes>,
}

/// A frame of geth's `callTracer`, nested through `calls`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallFrame {
    #[serde(rename = "type")]
    pub frame_type: String,
    pub from: Address,
    #[serde(default)]
    pub to: Option<Address>,
    #[serde(default)]
    pub value: Option<U256>,
    #[serde(default)]
    pub gas: Option<U64>,
    #[serde(default)]
    pub gas_used: Option<U64>,
    #[serde(default)]
    pub input: Option<Bytes>,
    #[serde(default)]
    pub output: Option<Bytes>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub calls: Vec<CallFrame>,
}

/// One element of `debug_traceBlockByNumber`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GethTransactionTrace {
    /// Only reported by recent geth releases.
    #[serde(default)]
    pub tx_hash: Option<B256>,
    #[serde(default)]
    pub result: Option<CallFrame>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcBlock {
    pub number: U64,
    pub hash: B256,
    #[serde(default)]
    pub transactions: Vec<RpcTransaction>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcTransaction {
    pub hash: B256,
    pub transaction_index: U64,
    pub from: Address,
    #[serde(default)]
    pub to: Option<Address>,
    #[serde(default, rename = "type")]
    pub tx_type: Option<U64>,
}
