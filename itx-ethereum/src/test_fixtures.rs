//! Helpers to serve canned JSON-RPC answers from a mockito server.

use serde_json::{json, Value};

use crate::rpc::{config::RPCRetryConfig, EthereumRpcClient};

pub(crate) fn test_client(server: &mockito::ServerGuard) -> EthereumRpcClient {
    EthereumRpcClient::new(&server.url())
        .unwrap()
        .with_retry(RPCRetryConfig::disabled())
}

/// Answers requests for `method` whose params match `params` with the given `result`.
pub(crate) async fn mock_result(
    server: &mut mockito::ServerGuard,
    method: &str,
    params: Value,
    result: Value,
) -> mockito::Mock {
    mock_reply(server, method, params, json!({ "result": result })).await
}

/// Answers requests for `method` whose params match `params` with a JSON-RPC error object.
pub(crate) async fn mock_error(
    server: &mut mockito::ServerGuard,
    method: &str,
    params: Value,
    error: Value,
) -> mockito::Mock {
    mock_reply(server, method, params, json!({ "error": error })).await
}

async fn mock_reply(
    server: &mut mockito::ServerGuard,
    method: &str,
    params: Value,
    payload: Value,
) -> mockito::Mock {
    server
        .mock("POST", "/")
        .match_body(mockito::Matcher::PartialJson(json!({
            "method": method,
            "params": params,
        })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body_from_request(move |request| {
            let body: Value = serde_json::from_slice(request.body().unwrap()).unwrap();
            let mut reply = payload.clone();
            reply["jsonrpc"] = json!("2.0");
            reply["id"] = body["id"].clone();
            serde_json::to_vec(&reply).unwrap()
        })
        .create_async()
        .await
}
