use serde::{Deserialize, Serialize};

use super::{Address, BlockNumber, Bytes};

/// An address referenced by an internal transaction, together with the block at which its
/// coin balance has to be considered stale.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressParam {
    pub hash: Address,
    /// Code of a contract created at this address, if the referencing frame created it.
    pub contract_code: Option<Bytes>,
    pub fetched_coin_balance_block_number: BlockNumber,
}

impl AddressParam {
    pub fn new(hash: Address, fetched_coin_balance_block_number: BlockNumber) -> Self {
        Self { hash, contract_code: None, fetched_coin_balance_block_number }
    }

    pub fn with_contract_code(mut self, code: Bytes) -> Self {
        self.contract_code = Some(code);
        self
    }

    /// Folds another sighting of the same address into this one, keeping the most recent block
    /// and any known contract code.
    pub fn merge(&mut self, other: AddressParam) {
        debug_assert_eq!(self.hash, other.hash);
        self.fetched_coin_balance_block_number = self
            .fetched_coin_balance_block_number
            .max(other.fetched_coin_balance_block_number);
        if self.contract_code.is_none() {
            self.contract_code = other.contract_code;
        }
    }
}

/// Request for the downstream coin balance fetcher.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CoinBalanceRequest {
    pub address_hash: Address,
    pub block_number: BlockNumber,
}

impl From<&AddressParam> for CoinBalanceRequest {
    fn from(param: &AddressParam) -> Self {
        Self { address_hash: param.hash, block_number: param.fetched_coin_balance_block_number }
    }
}
