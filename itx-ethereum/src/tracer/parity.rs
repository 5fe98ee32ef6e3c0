//! Conversion of parity style `trace` output into internal transactions.

use std::str::FromStr;

use itx_common::models::{
    internal_transaction::{CallType, InternalTransaction, InternalTransactionType},
    BlockNumber, TxHash, U256,
};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::rpc::types::{
    ParityCallAction, ParityCallResult, ParityCreateAction, ParityCreateResult,
    ParitySuicideAction, ParityTrace,
};

/// Converts the traces of one transaction, in the order the node reported them.
///
/// `block_index` is left at zero; the caller numbers frames across the whole block.
pub(super) fn to_internal_transactions(
    block_number: BlockNumber,
    transaction_hash: TxHash,
    transaction_index: u64,
    traces: Vec<ParityTrace>,
) -> Result<Vec<InternalTransaction>, String> {
    let mut result = Vec::with_capacity(traces.len());
    for trace in traces {
        // block rewards are not part of any transaction
        if trace.trace_type == "reward" {
            continue;
        }
        let mut itx = convert_trace(block_number, transaction_hash, transaction_index, trace)?;
        itx.index = result.len() as u64;
        result.push(itx);
    }
    Ok(result)
}

fn convert_trace(
    block_number: BlockNumber,
    transaction_hash: TxHash,
    transaction_index: u64,
    trace: ParityTrace,
) -> Result<InternalTransaction, String> {
    let error = trace
        .error
        .filter(|e| !e.is_empty());
    let base = |r#type, from_address_hash| InternalTransaction {
        block_number,
        transaction_hash,
        transaction_index,
        index: 0,
        block_index: 0,
        trace_address: trace.trace_address.clone(),
        r#type,
        call_type: None,
        from_address_hash,
        to_address_hash: None,
        value: U256::ZERO,
        gas: None,
        gas_used: None,
        input: None,
        init: None,
        output: None,
        created_contract_address_hash: None,
        created_contract_code: None,
        error: error.clone(),
    };

    match trace.trace_type.as_str() {
        "call" => {
            let action: ParityCallAction = decode("call action", trace.action)?;
            let call_type = CallType::from_str(&action.call_type)
                .map_err(|_| format!("unknown call type `{}`", action.call_type))?;
            let mut itx = base(InternalTransactionType::Call, action.from);
            itx.call_type = Some(call_type);
            itx.to_address_hash = Some(action.to);
            itx.value = action.value;
            itx.gas = Some(action.gas.to());
            itx.input = Some(action.input);
            if let Some(result) = decode_result::<ParityCallResult>("call result", trace.result)? {
                itx.gas_used = Some(result.gas_used.to());
                itx.output = result.output;
            }
            Ok(itx)
        }
        "create" => {
            let action: ParityCreateAction = decode("create action", trace.action)?;
            let r#type = match action.creation_method.as_deref() {
                Some("create2") => InternalTransactionType::Create2,
                _ => InternalTransactionType::Create,
            };
            let mut itx = base(r#type, action.from);
            itx.value = action.value;
            itx.gas = Some(action.gas.to());
            itx.init = Some(action.init);
            if let Some(result) =
                decode_result::<ParityCreateResult>("create result", trace.result)?
            {
                itx.gas_used = Some(result.gas_used.to());
                itx.created_contract_address_hash = Some(result.address);
                itx.created_contract_code = result.code;
            }
            Ok(itx)
        }
        "suicide" => {
            let action: ParitySuicideAction = decode("suicide action", trace.action)?;
            let mut itx = base(InternalTransactionType::Selfdestruct, action.address);
            itx.to_address_hash = Some(action.refund_address);
            itx.value = action.balance;
            Ok(itx)
        }
        other => Err(format!("unknown trace type `{other}`")),
    }
}

fn decode<T: DeserializeOwned>(what: &str, value: Value) -> Result<T, String> {
    serde_json::from_value(value).map_err(|e| format!("undecodable {what}: {e}"))
}

fn decode_result<T: DeserializeOwned>(what: &str, value: Option<Value>) -> Result<Option<T>, String> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(value) => decode(what, value).map(Some),
    }
}
