pub mod address;
pub mod blockchain;
pub mod error;
pub mod internal_transaction;
pub mod token;

pub use alloy_primitives::{Address, Bytes, B256, U256};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

/// Height of a block. The unit of deduplication and retry for the pipeline.
pub type BlockNumber = u64;

/// Block hash literal type to uniquely identify a block in the chain.
pub type BlockHash = B256;

/// Transaction hash literal type to uniquely identify a transaction in the chain.
pub type TxHash = B256;

/// Path of child indices from the root call of a transaction to a given call.
///
/// The root call has an empty trace address.
pub type TraceAddress = Vec<u32>;

/// The chain being indexed.
///
/// Only chains with behaviour that differs from plain EVM chains are listed explicitly.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display, Default,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Chain {
    #[default]
    Ethereum,
    Celo,
    Zetachain,
}

/// The node implementation behind the trace RPC endpoint.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display, Default,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum JsonRpcVariant {
    Geth,
    #[default]
    Nethermind,
    Erigon,
    Besu,
    Rsk,
    Filecoin,
}

impl JsonRpcVariant {
    /// Variants that can return the traces of a whole block in a single call.
    pub const BLOCK_TRACEABLE: [JsonRpcVariant; 5] = [
        JsonRpcVariant::Nethermind,
        JsonRpcVariant::Erigon,
        JsonRpcVariant::Besu,
        JsonRpcVariant::Rsk,
        JsonRpcVariant::Filecoin,
    ];

    /// Returns `true` if this variant speaks the parity `trace_*` namespace rather than geth's
    /// `debug_*` tracers.
    pub fn uses_parity_traces(&self) -> bool {
        !matches!(self, JsonRpcVariant::Geth)
    }
}
