use std::fmt::Display;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::BlockNumber;

/// A JSON-RPC error object returned by the trace node.
///
/// `data` carries the node's own payload, annotated by the client with the `blockNumber` (and
/// `transactionHash` for per-transaction requests) of the request that failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorResponse {
    pub code: i64,
    pub message: String,
    pub data: Option<Value>,
}

impl RpcErrorResponse {
    pub fn new(code: i64, message: impl Into<String>, data: Option<Value>) -> Self {
        Self { code, message: message.into(), data }
    }

    /// Block number carried in `data`, under either `blockNumber` or `block_number`.
    ///
    /// Accepts both JSON numbers and hex quantities.
    pub fn block_number(&self) -> Option<BlockNumber> {
        let data = self.data.as_ref()?;
        let raw = data
            .get("blockNumber")
            .or_else(|| data.get("block_number"))?;
        match raw {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => match s.strip_prefix("0x") {
                Some(hex) => u64::from_str_radix(hex, 16).ok(),
                None => s.parse().ok(),
            },
            _ => None,
        }
    }
}

impl Display for RpcErrorResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)?;
        if let Some(block) = self.block_number() {
            write!(f, " at block {block}")?;
        }
        Ok(())
    }
}

/// Failure reported by a trace client.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TraceError {
    /// The node answered, but with one or more error objects. Recoverable by a later retry.
    #[error("trace node returned {} error(s): {}", .0.len(), join_responses(.0))]
    Responses(Vec<RpcErrorResponse>),
    /// The request never produced a usable answer (connection, timeout, undecodable payload).
    #[error("trace transport failure: {0}")]
    Transport(String),
    /// The backend does not support internal transaction tracing at all.
    #[error("internal transaction tracing is not supported: {0}")]
    Unsupported(String),
}

impl TraceError {
    pub fn responses(&self) -> &[RpcErrorResponse] {
        match self {
            TraceError::Responses(responses) => responses,
            _ => &[],
        }
    }
}

fn join_responses(responses: &[RpcErrorResponse]) -> String {
    responses
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
