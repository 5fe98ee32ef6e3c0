//! Flattening of geth `callTracer` frames into internal transactions.

use std::str::FromStr;

use itx_common::models::{
    internal_transaction::{CallType, InternalTransaction, InternalTransactionType},
    BlockNumber, TxHash, U256,
};

use crate::rpc::types::CallFrame;

/// Walks the call tree depth first, so frames come out in the same order parity nodes report
/// them and `index` follows execution order.
pub(super) fn to_internal_transactions(
    block_number: BlockNumber,
    transaction_hash: TxHash,
    transaction_index: u64,
    root: CallFrame,
) -> Result<Vec<InternalTransaction>, String> {
    let mut result = Vec::new();
    let mut stack = vec![(Vec::new(), root)];
    while let Some((trace_address, mut frame)) = stack.pop() {
        let calls = std::mem::take(&mut frame.calls);
        for (i, child) in calls.into_iter().enumerate().rev() {
            let mut child_address = trace_address.clone();
            child_address.push(i as u32);
            stack.push((child_address, child));
        }

        let mut itx =
            convert_frame(block_number, transaction_hash, transaction_index, trace_address, frame)?;
        itx.index = result.len() as u64;
        result.push(itx);
    }
    Ok(result)
}

fn convert_frame(
    block_number: BlockNumber,
    transaction_hash: TxHash,
    transaction_index: u64,
    trace_address: Vec<u32>,
    frame: CallFrame,
) -> Result<InternalTransaction, String> {
    let error = frame
        .error
        .filter(|e| !e.is_empty());
    let failed = error.is_some();
    let mut itx = InternalTransaction {
        block_number,
        transaction_hash,
        transaction_index,
        index: 0,
        block_index: 0,
        trace_address,
        r#type: InternalTransactionType::Call,
        call_type: None,
        from_address_hash: frame.from,
        to_address_hash: None,
        value: frame.value.unwrap_or(U256::ZERO),
        gas: frame.gas.map(|g| g.to()),
        gas_used: frame.gas_used.map(|g| g.to()),
        input: None,
        init: None,
        output: None,
        created_contract_address_hash: None,
        created_contract_code: None,
        error,
    };

    let frame_type = frame.frame_type.to_ascii_uppercase();
    match frame_type.as_str() {
        "CALL" | "CALLCODE" | "DELEGATECALL" | "STATICCALL" => {
            itx.call_type = Some(
                CallType::from_str(&frame_type)
                    .map_err(|_| format!("unknown call type `{frame_type}`"))?,
            );
            itx.to_address_hash = frame.to;
            itx.input = frame.input;
            itx.output = frame.output;
        }
        "CREATE" | "CREATE2" => {
            itx.r#type = if frame_type == "CREATE2" {
                InternalTransactionType::Create2
            } else {
                InternalTransactionType::Create
            };
            itx.init = frame.input;
            // a failed creation leaves no contract behind
            if !failed {
                itx.created_contract_address_hash = frame.to;
                itx.created_contract_code = frame.output;
            }
        }
        "SELFDESTRUCT" => {
            itx.r#type = InternalTransactionType::Selfdestruct;
            itx.to_address_hash = frame.to;
            itx.gas = None;
            itx.gas_used = None;
        }
        other => return Err(format!("unknown call frame type `{other}`")),
    }
    Ok(itx)
}
