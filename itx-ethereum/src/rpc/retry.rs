//! RPC retry logic and error classification
//!
//! Transient transport failures are retried with exponential backoff before they reach the
//! trace client. Anything that survives the retries is reported upwards, where the pipeline
//! decides whether the whole block batch is retried.

use std::time::Duration;

use alloy::{
    rpc::json_rpc::ErrorPayload,
    transports::{RpcError, TransportErrorKind},
};
use backoff::{exponential::ExponentialBackoffBuilder, ExponentialBackoff};
use serde::Deserialize;
use serde_json::value::RawValue;
use tracing::debug;

use super::{config::RPCRetryConfig, errors::AlloyError};

/// Extension trait to implement retry logic for [`RpcError<TransportErrorKind>`].
///
/// # Attribution
/// Adapted from alloy-transport:
/// https://github.com/alloy-rs/alloy/blob/a3899575fbc0c789275f95661516b99e9a92838d/crates/transport/src/error.rs#L156
/// License: MIT OR Apache-2.0
pub(crate) trait RpcErrorExt {
    /// Analyzes whether to retry the request depending on the error.
    ///
    /// Rate limiting, unavailable backends, null responses and retryable JSON-RPC codes are
    /// transient. Serialization errors and missing backends are permanent.
    fn is_retryable(&self) -> bool;

    /// Fetches the backoff hint from the error message if present.
    ///
    /// Some RPC providers (e.g., Infura) include a suggested backoff duration
    /// in their rate limit error responses under `data.rate.backoff_seconds`.
    fn backoff_hint(&self) -> Option<Duration>;

    /// Classifies errors into transient or permanent for backoff retry logic.
    fn classify_error(self) -> backoff::Error<Self>
    where
        Self: Sized;
}

impl<E: std::borrow::Borrow<RawValue>> RpcErrorExt for RpcError<TransportErrorKind, E> {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(err) => err.is_retry_err(),
            Self::SerError(_) => false,
            Self::DeserError { text, .. } => {
                if let Ok(resp) = serde_json::from_str::<ErrorPayload>(text) {
                    return resp.is_retry_err();
                }

                // some providers send invalid JSON RPC in the error case (no `id:u64`), but the
                // text should be a `JsonRpcError`
                #[derive(Deserialize)]
                struct Resp {
                    error: ErrorPayload,
                }

                if let Ok(resp) = serde_json::from_str::<Resp>(text) {
                    return resp.error.is_retry_err();
                }

                false
            }
            Self::ErrorResp(err) => err.is_retry_err(),
            Self::NullResp => true,
            _ => false,
        }
    }

    fn backoff_hint(&self) -> Option<Duration> {
        if let Self::ErrorResp(resp) = self {
            let data = resp.try_data_as::<serde_json::Value>();
            if let Some(Ok(data)) = data {
                let backoff_seconds = &data["rate"]["backoff_seconds"];
                if let Some(seconds) = backoff_seconds.as_u64() {
                    return Some(Duration::from_secs(seconds));
                }
                // round up for safety
                if let Some(seconds) = backoff_seconds.as_f64() {
                    return Some(Duration::from_secs(seconds.ceil() as u64));
                }
            }
        }
        None
    }

    fn classify_error(self) -> backoff::Error<Self> {
        if self.is_retryable() {
            if let Some(hint) = self.backoff_hint() {
                backoff::Error::retry_after(self, hint)
            } else {
                backoff::Error::transient(self)
            }
        } else {
            backoff::Error::permanent(self)
        }
    }
}

/// Exponential backoff with a cap on the number of retries.
#[derive(Clone, Debug)]
pub(crate) struct RetryPolicy {
    backoff: ExponentialBackoff,
    max_retries: usize,
}

impl From<RPCRetryConfig> for RetryPolicy {
    fn from(config: RPCRetryConfig) -> Self {
        let backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(config.initial_backoff_ms))
            .with_multiplier(1.75)
            .with_max_interval(Duration::from_millis(config.max_backoff_ms))
            // the retry count bounds the loop instead
            .with_max_elapsed_time(None)
            .build();

        Self { backoff, max_retries: config.max_retries }
    }
}

impl From<&RetryPolicy> for RPCRetryConfig {
    fn from(policy: &RetryPolicy) -> Self {
        RPCRetryConfig::new(
            policy.max_retries,
            policy.backoff.initial_interval.as_millis() as u64,
            policy.backoff.max_interval.as_millis() as u64,
        )
    }
}

impl RetryPolicy {
    /// Creates a retry policy optimized for testing (very short intervals).
    #[cfg(test)]
    pub(crate) fn for_testing(max_retries: usize) -> Self {
        RPCRetryConfig::new(max_retries, 1, 5).into()
    }

    /// Executes an RPC request with automatic retry on transient failures.
    ///
    /// Permanent errors fail immediately. Transient errors are retried until `max_retries`
    /// retries have been spent, after which the last error is returned.
    pub(crate) async fn retry_request<F, Fut, T>(&self, mut operation: F) -> Result<T, AlloyError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, AlloyError>>,
    {
        let max_retries = self.max_retries;
        let mut attempt = 0usize;
        backoff::future::retry(self.backoff.clone(), || {
            attempt += 1;
            let current = attempt;
            let fut = operation();
            async move {
                fut.await.map_err(|err| {
                    if current > max_retries {
                        debug!(attempts = current, error = %err, "Giving up on RPC request");
                        backoff::Error::permanent(err)
                    } else {
                        err.classify_error()
                    }
                })
            }
        })
        .await
    }
}
