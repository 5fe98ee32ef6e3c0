use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use super::{Address, BlockNumber, Bytes, TraceAddress, TxHash, U256};

/// Kind of frame in a transaction's call tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum InternalTransactionType {
    Call,
    Create,
    Create2,
    Selfdestruct,
}

/// Flavour of a message call frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum CallType {
    Call,
    CallCode,
    DelegateCall,
    StaticCall,
}

/// One node of a transaction's call tree.
///
/// Records are produced per run from upstream responses and may be rewritten in place (see
/// [`InternalTransaction::mark_parent_reverted`]) before they are handed to storage. They are
/// never modified after persistence.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InternalTransaction {
    pub block_number: BlockNumber,
    pub transaction_hash: TxHash,
    pub transaction_index: u64,
    /// Position of this frame within the transaction's flattened trace list.
    pub index: u64,
    /// Position of this frame within the block, across all transactions.
    pub block_index: u64,
    pub trace_address: TraceAddress,
    pub r#type: InternalTransactionType,
    pub call_type: Option<CallType>,
    pub from_address_hash: Address,
    pub to_address_hash: Option<Address>,
    pub value: U256,
    pub gas: Option<u64>,
    pub gas_used: Option<u64>,
    pub input: Option<Bytes>,
    pub init: Option<Bytes>,
    pub output: Option<Bytes>,
    pub created_contract_address_hash: Option<Address>,
    pub created_contract_code: Option<Bytes>,
    pub error: Option<String>,
}

impl InternalTransaction {
    pub const PARENT_REVERTED: &'static str = "Parent reverted";

    /// Returns `true` if the frame carries a non-empty error of its own.
    pub fn has_error(&self) -> bool {
        self.error
            .as_deref()
            .is_some_and(|e| !e.is_empty())
    }

    pub fn is_root(&self) -> bool {
        self.trace_address.is_empty()
    }

    /// Strips the artifacts a reverted ancestor unwinds and records the reversion.
    pub fn mark_parent_reverted(&mut self) {
        self.created_contract_address_hash = None;
        self.created_contract_code = None;
        self.gas_used = None;
        self.output = None;
        self.error = Some(Self::PARENT_REVERTED.to_string());
    }
}

/// Synthesized for a requested block that produced no internal transactions, so the store can
/// record "fetched, nothing found".
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EmptyBlockMarker {
    pub block_number: BlockNumber,
}

impl EmptyBlockMarker {
    pub fn new(block_number: BlockNumber) -> Self {
        Self { block_number }
    }
}

/// A single row of the internal transactions import: either a call frame or the marker of a
/// block without any.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InternalTransactionEntry {
    Frame(InternalTransaction),
    Empty(EmptyBlockMarker),
}

impl InternalTransactionEntry {
    pub fn block_number(&self) -> BlockNumber {
        match self {
            InternalTransactionEntry::Frame(itx) => itx.block_number,
            InternalTransactionEntry::Empty(marker) => marker.block_number,
        }
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub mod fixtures {
    use super::*;

    /// A successful plain call frame at the given position.
    pub fn call(tx: TxHash, trace_address: &[u32]) -> InternalTransaction {
        InternalTransaction {
            block_number: 100,
            transaction_hash: tx,
            transaction_index: 0,
            index: trace_address.len() as u64,
            block_index: 0,
            trace_address: trace_address.to_vec(),
            r#type: InternalTransactionType::Call,
            call_type: Some(CallType::Call),
            from_address_hash: Address::repeat_byte(0x11),
            to_address_hash: Some(Address::repeat_byte(0x22)),
            value: U256::ZERO,
            gas: Some(50_000),
            gas_used: Some(21_000),
            input: Some(Bytes::from_static(&[0xca, 0xfe])),
            init: None,
            output: Some(Bytes::from_static(&[0x01])),
            created_contract_address_hash: None,
            created_contract_code: None,
            error: None,
        }
    }
}
