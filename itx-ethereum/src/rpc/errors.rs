use std::fmt::Display;

use alloy::transports::{RpcError as AlloyRpcError, TransportErrorKind};
use itx_common::models::error::RpcErrorResponse;
use thiserror::Error;

/// Alloy RPC error type alias for convenience.
pub(crate) type AlloyError = AlloyRpcError<TransportErrorKind>;

/// JSON-RPC code for a method the node does not implement.
const METHOD_NOT_FOUND: i64 = -32601;

#[derive(Error, Debug)]
pub struct ReqwestError {
    pub msg: String,
    #[source]
    pub source: AlloyError,
}

impl Display for ReqwestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.msg, self.source)
    }
}

#[derive(Error, Debug)]
pub enum RequestError {
    Reqwest(ReqwestError),
    Other(String),
}

impl Display for RequestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestError::Reqwest(e) => write!(f, "{}: {}", e.msg, e.source),
            RequestError::Other(e) => write!(f, "{e}"),
        }
    }
}

#[derive(Error, Debug)]
pub enum RPCError {
    #[error("RPC setup error: {0}")]
    SetupError(String),
    #[error("Request error: {0}")]
    RequestError(RequestError),
    #[error("Unknown error: {0}")]
    UnknownError(String),
}

impl RPCError {
    pub(super) fn from_alloy<S: ToString>(msg: S, error: AlloyError) -> Self {
        RPCError::RequestError(RequestError::Reqwest(ReqwestError {
            msg: msg.to_string(),
            source: error,
        }))
    }

    /// The JSON-RPC error object the node answered with, if the request got that far.
    pub fn error_response(&self) -> Option<RpcErrorResponse> {
        let RPCError::RequestError(RequestError::Reqwest(ReqwestError {
            source: AlloyRpcError::ErrorResp(payload),
            ..
        })) = self
        else {
            return None;
        };
        let data = payload
            .try_data_as::<serde_json::Value>()
            .and_then(Result::ok);
        Some(RpcErrorResponse::new(payload.code, payload.message.to_string(), data))
    }

    /// Returns `true` if the node rejected the method itself.
    pub fn is_method_not_found(&self) -> bool {
        self.error_response()
            .is_some_and(|resp| resp.code == METHOD_NOT_FOUND)
    }
}

/// Extension trait for adding RPC context to Results containing Alloy errors.
///
/// Similar to `anyhow::Context`, this trait provides ergonomic error wrapping
/// that converts Alloy RPC errors into `RPCError` with contextual messages.
pub(crate) trait RpcResultExt<T> {
    /// Wraps the error with lazily-evaluated context.
    fn with_rpc_context<C: Display, F: FnOnce() -> C>(self, f: F) -> Result<T, RPCError>;
}

impl<T> RpcResultExt<T> for Result<T, AlloyError> {
    fn with_rpc_context<C: Display, F: FnOnce() -> C>(self, f: F) -> Result<T, RPCError> {
        self.map_err(|e| RPCError::from_alloy(f().to_string(), e))
    }
}
