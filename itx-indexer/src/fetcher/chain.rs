//! Chain specific behaviour, selected once at startup.

use std::{collections::HashMap, fmt::Debug, sync::Arc};

use itx_common::models::{
    blockchain::Transaction,
    internal_transaction::{CallType, InternalTransaction},
    token::{TokenBalanceRequest, TokenTransfer, ERC20},
    Address, BlockHash, BlockNumber, Chain,
};

use crate::{config::FetcherConfig, IndexerError};

pub trait ChainBehavior: Send + Sync + Debug {
    /// Whether the node can trace this transaction.
    fn is_traceable(&self, _tx: &Transaction) -> bool {
        true
    }

    /// Whether [`ChainBehavior::token_transfers`] can yield anything on this chain.
    fn derives_token_transfers(&self) -> bool {
        false
    }

    /// Token transfers implied by internal transactions.
    fn token_transfers(
        &self,
        _itxs: &[InternalTransaction],
        _block_hashes: &HashMap<BlockNumber, BlockHash>,
    ) -> Vec<TokenTransfer> {
        Vec::new()
    }
}

pub fn for_config(config: &FetcherConfig) -> Result<Arc<dyn ChainBehavior>, IndexerError> {
    Ok(match config.chain {
        Chain::Ethereum => Arc::new(DefaultChain),
        Chain::Zetachain => Arc::new(Zetachain),
        Chain::Celo => {
            let token = config
                .celo_token_address
                .ok_or_else(|| {
                    IndexerError::Config("celo_token_address is required on celo".to_string())
                })?;
            Arc::new(Celo::new(token))
        }
    })
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultChain;

impl ChainBehavior for DefaultChain {}

#[derive(Debug, Clone, Copy, Default)]
pub struct Zetachain;

impl Zetachain {
    /// Cross-chain transactions injected by the zetachain protocol; nodes can not replay them.
    pub const NON_TRACEABLE_TX_TYPE: u64 = 88;
}

impl ChainBehavior for Zetachain {
    fn is_traceable(&self, tx: &Transaction) -> bool {
        tx.tx_type != Some(Self::NON_TRACEABLE_TX_TYPE)
    }
}

/// On celo the native coin is also an ERC-20 token, so value moving calls are token transfers.
#[derive(Debug, Clone, Copy)]
pub struct Celo {
    token: Address,
}

impl Celo {
    pub fn new(token: Address) -> Self {
        Self { token }
    }

    fn is_native_transfer(itx: &InternalTransaction) -> bool {
        !itx.is_root() &&
            itx.call_type == Some(CallType::Call) &&
            !itx.value.is_zero() &&
            !itx.has_error() &&
            itx.to_address_hash.is_some()
    }
}

impl ChainBehavior for Celo {
    fn derives_token_transfers(&self) -> bool {
        true
    }

    fn token_transfers(
        &self,
        itxs: &[InternalTransaction],
        block_hashes: &HashMap<BlockNumber, BlockHash>,
    ) -> Vec<TokenTransfer> {
        itxs.iter()
            .filter(|itx| Self::is_native_transfer(itx))
            .filter_map(|itx| {
                let block_hash = *block_hashes.get(&itx.block_number)?;
                Some(TokenTransfer {
                    transaction_hash: itx.transaction_hash,
                    block_number: itx.block_number,
                    block_hash,
                    // negative so they never collide with the log index of a real event
                    log_index: -(itx.block_index as i64) - 1,
                    from_address_hash: itx.from_address_hash,
                    to_address_hash: itx.to_address_hash?,
                    token_contract_address_hash: self.token,
                    amount: itx.value,
                    token_type: ERC20.to_string(),
                })
            })
            .collect()
    }
}

/// Balance refreshes for both parties of every transfer, excluding the zero address.
pub fn token_balance_requests(transfers: &[TokenTransfer]) -> Vec<TokenBalanceRequest> {
    let mut requests = Vec::new();
    for transfer in transfers {
        for holder in [transfer.from_address_hash, transfer.to_address_hash] {
            if holder == Address::ZERO {
                continue;
            }
            let request = TokenBalanceRequest {
                address_hash: holder,
                token_contract_address_hash: transfer.token_contract_address_hash,
                block_number: transfer.block_number,
                token_type: transfer.token_type.clone(),
            };
            if !requests.contains(&request) {
                requests.push(request);
            }
        }
    }
    requests
}

#[cfg(test)]
mod tests {
    use itx_common::models::{internal_transaction::fixtures::call, TxHash, U256};
    use rstest::rstest;

    use super::*;

    fn tx_of_type(tx_type: Option<u64>) -> Transaction {
        Transaction::new(TxHash::repeat_byte(1), 1, 0, Address::repeat_byte(1), None, tx_type)
    }

    #[rstest]
    #[case::cross_chain(Some(88), false)]
    #[case::legacy(Some(0), true)]
    #[case::untyped(None, true)]
    fn test_zetachain_skips_cross_chain_transactions(
        #[case] tx_type: Option<u64>,
        #[case] expected: bool,
    ) {
        assert_eq!(Zetachain.is_traceable(&tx_of_type(tx_type)), expected);
        assert!(DefaultChain.is_traceable(&tx_of_type(tx_type)));
    }

    #[test]
    fn test_celo_transfers() {
        let token = Address::repeat_byte(0xce);
        let tx = TxHash::repeat_byte(1);
        let hashes = HashMap::from([(100, BlockHash::repeat_byte(0xaa))]);

        let mut root = call(tx, &[]);
        root.value = U256::from(5);
        let mut transfer = call(tx, &[0]);
        transfer.value = U256::from(7);
        transfer.block_index = 1;
        let zero_value = call(tx, &[1]);
        let mut reverted = call(tx, &[2]);
        reverted.value = U256::from(1);
        reverted.error = Some("Parent reverted".to_string());
        let mut delegate = call(tx, &[3]);
        delegate.value = U256::from(1);
        delegate.call_type = Some(CallType::DelegateCall);
        let mut unknown_block = call(tx, &[4]);
        unknown_block.value = U256::from(1);
        unknown_block.block_number = 101;

        let transfers = Celo::new(token).token_transfers(
            &[root, transfer, zero_value, reverted, delegate, unknown_block],
            &hashes,
        );

        assert_eq!(
            transfers,
            vec![TokenTransfer {
                transaction_hash: tx,
                block_number: 100,
                block_hash: BlockHash::repeat_byte(0xaa),
                log_index: -2,
                from_address_hash: Address::repeat_byte(0x11),
                to_address_hash: Address::repeat_byte(0x22),
                token_contract_address_hash: token,
                amount: U256::from(7),
                token_type: "ERC-20".to_string(),
            }]
        );
    }

    #[test]
    fn test_token_balance_requests_skip_zero_address_and_duplicates() {
        let transfer = TokenTransfer {
            transaction_hash: TxHash::repeat_byte(1),
            block_number: 100,
            block_hash: BlockHash::repeat_byte(0xaa),
            log_index: -1,
            from_address_hash: Address::ZERO,
            to_address_hash: Address::repeat_byte(0x22),
            token_contract_address_hash: Address::repeat_byte(0xce),
            amount: U256::from(1),
            token_type: ERC20.to_string(),
        };

        let requests = token_balance_requests(&[transfer.clone(), transfer]);

        assert_eq!(
            requests,
            vec![TokenBalanceRequest {
                address_hash: Address::repeat_byte(0x22),
                token_contract_address_hash: Address::repeat_byte(0xce),
                block_number: 100,
                token_type: ERC20.to_string(),
            }]
        );
    }

    #[test]
    fn test_celo_requires_token_address() {
        let config = FetcherConfig { chain: Chain::Celo, ..Default::default() };

        assert!(matches!(for_config(&config), Err(IndexerError::Config(_))));
    }
}
