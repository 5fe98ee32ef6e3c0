use serde::{Deserialize, Serialize};

use super::{Address, BlockHash, BlockNumber, TxHash, U256};

pub const ERC20: &str = "ERC-20";

/// A token transfer derived from chain data other than event logs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenTransfer {
    pub transaction_hash: TxHash,
    pub block_number: BlockNumber,
    pub block_hash: BlockHash,
    /// Negative for transfers that do not originate from a log, so they never collide with real
    /// log indices.
    pub log_index: i64,
    pub from_address_hash: Address,
    pub to_address_hash: Address,
    pub token_contract_address_hash: Address,
    pub amount: U256,
    pub token_type: String,
}

/// Request for the downstream token balance fetcher.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TokenBalanceRequest {
    pub address_hash: Address,
    pub token_contract_address_hash: Address,
    pub block_number: BlockNumber,
    pub token_type: String,
}
