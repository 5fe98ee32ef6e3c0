//! Transactional import of a fetched batch.

use std::{collections::HashSet, sync::Arc};

use itx_common::{
    models::{
        address::CoinBalanceRequest,
        internal_transaction::{EmptyBlockMarker, InternalTransaction, InternalTransactionEntry},
        BlockNumber,
    },
    storage::{ChainCache, ChainGateway, ImportBatch, ImportError, StepFailure},
    traits::BalanceRefresher,
};
use metrics::counter;
use tracing::{debug, error, instrument};

use crate::fetcher::{
    addresses,
    chain::{token_balance_requests, ChainBehavior},
    RunOutcome,
};

pub struct Importer {
    gateway: Arc<dyn ChainGateway>,
    cache: Arc<dyn ChainCache>,
    refresher: Arc<dyn BalanceRefresher>,
    chain: Arc<dyn ChainBehavior>,
}

impl Importer {
    pub fn new(
        gateway: Arc<dyn ChainGateway>,
        cache: Arc<dyn ChainCache>,
        refresher: Arc<dyn BalanceRefresher>,
        chain: Arc<dyn ChainBehavior>,
    ) -> Self {
        Self { gateway, cache, refresher, chain }
    }

    /// Persists the internal transactions of `block_numbers` in one store transaction.
    ///
    /// Requested blocks without any internal transaction are recorded with an empty marker.
    #[instrument(skip_all, fields(block_count = block_numbers.len(), itx_count = itxs.len()))]
    pub async fn import(
        &self,
        block_numbers: Vec<BlockNumber>,
        itxs: Vec<InternalTransaction>,
    ) -> RunOutcome {
        let addresses = addresses::extract(&itxs);
        let empty_markers = empty_block_markers(&block_numbers, &itxs);

        let token_transfers = if self.chain.derives_token_transfers() {
            let block_hashes = match self
                .gateway
                .get_block_hashes(&block_numbers)
                .await
            {
                Ok(hashes) => hashes,
                Err(err) => {
                    error!(block_count = block_numbers.len(), error = %err, "Failed to read block hashes, retrying batch");
                    return RunOutcome::Retry(block_numbers);
                }
            };
            self.chain
                .token_transfers(&itxs, &block_hashes)
        } else {
            Vec::new()
        };

        let internal_transactions = itxs
            .into_iter()
            .map(InternalTransactionEntry::Frame)
            .chain(
                empty_markers
                    .into_iter()
                    .map(InternalTransactionEntry::Empty),
            )
            .collect();
        let batch = ImportBatch { token_transfers, addresses, internal_transactions };

        match self
            .gateway
            .import_internal_transactions(batch)
            .await
        {
            Ok(imported) => {
                let address_hashes: Vec<_> = imported
                    .addresses
                    .iter()
                    .map(|a| a.hash)
                    .collect();
                self.cache
                    .evict_addresses(&address_hashes);
                self.cache
                    .evict_blocks(&imported.blocks);

                self.refresher.refresh_coin_balances(
                    imported
                        .addresses
                        .iter()
                        .map(CoinBalanceRequest::from)
                        .collect(),
                );
                if !imported.token_transfers.is_empty() {
                    self.refresher
                        .refresh_token_balances(token_balance_requests(&imported.token_transfers));
                }

                counter!("itx_imported_internal_transactions")
                    .increment(imported.internal_transactions as u64);
                debug!(
                    blocks = imported.blocks.len(),
                    internal_transactions = imported.internal_transactions,
                    "Imported batch"
                );
                RunOutcome::Done
            }
            Err(err) => self.handle_import_error(block_numbers, err).await,
        }
    }

    async fn handle_import_error(&self, block_numbers: Vec<BlockNumber>, err: ImportError) -> RunOutcome {
        match &err {
            ImportError::Step { step, reason: StepFailure::UniqueViolation { .. } } => {
                self.flag_refetch_needed(&block_numbers)
                    .await;
                error!(
                    block_count = block_numbers.len(),
                    step,
                    reason = %err,
                    "Unique violation while importing, blocks flagged for refetch"
                );
            }
            ImportError::Step { step, reason } => {
                error!(
                    block_count = block_numbers.len(),
                    step,
                    reason = %reason,
                    "Failed to import internal transactions, retrying batch"
                );
            }
            ImportError::ForeignKeyViolation { constraint, transaction_hashes } => {
                self.flag_refetch_needed(&block_numbers)
                    .await;
                error!(
                    block_count = block_numbers.len(),
                    constraint,
                    transaction_hashes = ?transaction_hashes,
                    "Foreign key violation while importing, blocks flagged for refetch"
                );
            }
        }
        counter!("itx_import_failures").increment(1);
        RunOutcome::Retry(block_numbers)
    }

    async fn flag_refetch_needed(&self, block_numbers: &[BlockNumber]) {
        if let Err(err) = self
            .gateway
            .set_refetch_needed(block_numbers)
            .await
        {
            error!(block_count = block_numbers.len(), error = %err, "Failed to flag blocks for refetch");
        }
    }
}

/// Markers for the requested blocks that produced no internal transaction at all.
fn empty_block_markers(
    block_numbers: &[BlockNumber],
    itxs: &[InternalTransaction],
) -> Vec<EmptyBlockMarker> {
    let non_empty: HashSet<BlockNumber> = itxs
        .iter()
        .map(|itx| itx.block_number)
        .collect();
    block_numbers
        .iter()
        .filter(|n| !non_empty.contains(n))
        .map(|&n| EmptyBlockMarker::new(n))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use itx_common::{
        models::{
            internal_transaction::fixtures::call, Address, BlockHash, TxHash, U256,
        },
        storage::Imported,
        traits::MockBalanceRefresher,
    };
    use rstest::rstest;

    use super::*;
    use crate::{
        fetcher::chain::{Celo, DefaultChain},
        testing::MockGateway,
    };

    fn importer(
        gateway: MockGateway,
        refresher: MockBalanceRefresher,
        chain: Arc<dyn ChainBehavior>,
    ) -> Importer {
        let gateway = Arc::new(gateway);
        Importer::new(gateway.clone(), gateway, Arc::new(refresher), chain)
    }

    fn imported_from(batch: &ImportBatch) -> Imported {
        let mut blocks: Vec<BlockNumber> = batch
            .internal_transactions
            .iter()
            .map(InternalTransactionEntry::block_number)
            .collect();
        blocks.dedup();
        Imported {
            addresses: batch.addresses.clone(),
            token_transfers: batch.token_transfers.clone(),
            blocks,
            internal_transactions: batch
                .internal_transactions
                .iter()
                .filter(|e| matches!(e, InternalTransactionEntry::Frame(_)))
                .count(),
        }
    }

    #[tokio::test]
    async fn test_successful_import_evicts_and_refreshes() {
        let mut gateway = MockGateway::new();
        gateway
            .expect_import_internal_transactions()
            .withf(|batch| {
                batch.internal_transactions.len() == 2 &&
                    batch.internal_transactions[1] ==
                        InternalTransactionEntry::Empty(EmptyBlockMarker::new(101)) &&
                    batch.token_transfers.is_empty()
            })
            .times(1)
            .returning(|batch| Ok(imported_from(&batch)));
        gateway
            .expect_evict_addresses()
            .withf(|addresses| {
                addresses.to_vec() == vec![Address::repeat_byte(0x11), Address::repeat_byte(0x22)]
            })
            .times(1)
            .return_const(());
        gateway
            .expect_evict_blocks()
            .withf(|blocks| blocks.to_vec() == vec![100, 101])
            .times(1)
            .return_const(());
        gateway
            .expect_get_block_hashes()
            .never();
        let mut refresher = MockBalanceRefresher::new();
        refresher
            .expect_refresh_coin_balances()
            .withf(|requests| {
                *requests ==
                    vec![
                        CoinBalanceRequest { address_hash: Address::repeat_byte(0x11), block_number: 100 },
                        CoinBalanceRequest { address_hash: Address::repeat_byte(0x22), block_number: 100 },
                    ]
            })
            .times(1)
            .return_const(());
        refresher
            .expect_refresh_token_balances()
            .never();

        let outcome = importer(gateway, refresher, Arc::new(DefaultChain))
            .import(vec![100, 101], vec![call(TxHash::repeat_byte(1), &[])])
            .await;

        assert_eq!(outcome, RunOutcome::Done);
    }

    #[tokio::test]
    async fn test_celo_import_derives_transfers_and_token_refresh() {
        let token = Address::repeat_byte(0xce);
        let mut gateway = MockGateway::new();
        gateway
            .expect_get_block_hashes()
            .returning(|_| Ok(HashMap::from([(100, BlockHash::repeat_byte(0xaa))])));
        gateway
            .expect_import_internal_transactions()
            .withf(|batch| batch.token_transfers.len() == 1)
            .returning(|batch| Ok(imported_from(&batch)));
        gateway
            .expect_evict_addresses()
            .return_const(());
        gateway
            .expect_evict_blocks()
            .return_const(());
        let mut refresher = MockBalanceRefresher::new();
        refresher
            .expect_refresh_coin_balances()
            .return_const(());
        refresher
            .expect_refresh_token_balances()
            .withf(move |requests| {
                requests
                    .iter()
                    .map(|r| (r.address_hash, r.token_contract_address_hash))
                    .collect::<Vec<_>>() ==
                    vec![(Address::repeat_byte(0x11), token), (Address::repeat_byte(0x22), token)]
            })
            .times(1)
            .return_const(());
        let mut transfer = call(TxHash::repeat_byte(1), &[0]);
        transfer.value = U256::from(3);

        let outcome = importer(gateway, refresher, Arc::new(Celo::new(token)))
            .import(vec![100], vec![call(TxHash::repeat_byte(1), &[]), transfer])
            .await;

        assert_eq!(outcome, RunOutcome::Done);
    }

    #[rstest]
    #[case::unique_violation(
        ImportError::Step {
            step: "internal_transactions".to_string(),
            reason: StepFailure::UniqueViolation {
                constraint: "internal_transactions_block_number_block_index_index".to_string(),
                detail: "duplicate key".to_string(),
            },
        },
        true
    )]
    #[case::other_step_failure(
        ImportError::Step {
            step: "addresses".to_string(),
            reason: StepFailure::Other("deadlock detected".to_string()),
        },
        false
    )]
    #[case::foreign_key_violation(
        ImportError::ForeignKeyViolation {
            constraint: "internal_transactions_transaction_hash_fkey".to_string(),
            transaction_hashes: vec![TxHash::repeat_byte(1)],
        },
        true
    )]
    #[tokio::test]
    async fn test_failed_import_is_retried(#[case] failure: ImportError, #[case] flags: bool) {
        let mut gateway = MockGateway::new();
        gateway
            .expect_import_internal_transactions()
            .times(1)
            .returning(move |_| Err(failure.clone()));
        gateway
            .expect_set_refetch_needed()
            .withf(|blocks| blocks.to_vec() == vec![100, 101])
            .times(if flags { 1 } else { 0 })
            .returning(|_| Ok(()));
        gateway
            .expect_evict_addresses()
            .never();
        gateway
            .expect_evict_blocks()
            .never();
        let mut refresher = MockBalanceRefresher::new();
        refresher
            .expect_refresh_coin_balances()
            .never();

        let outcome = importer(gateway, refresher, Arc::new(DefaultChain))
            .import(vec![100, 101], vec![call(TxHash::repeat_byte(1), &[])])
            .await;

        assert_eq!(outcome, RunOutcome::Retry(vec![100, 101]));
    }

    #[test]
    fn test_empty_block_markers() {
        let itxs = vec![call(TxHash::repeat_byte(1), &[])];

        let markers = empty_block_markers(&[99, 100, 101], &itxs);

        assert_eq!(markers, vec![EmptyBlockMarker::new(99), EmptyBlockMarker::new(101)]);
    }
}
