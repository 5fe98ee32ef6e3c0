//! Fetch strategy selection.
//!
//! Backends that can trace whole blocks get one call per batch. Any other backend is traced per
//! transaction, using the transactions the store already knows for each block.

use std::sync::Arc;

use itx_common::{
    models::{blockchain::TraceRequest, internal_transaction::InternalTransaction, BlockNumber},
    storage::ChainGateway,
    traits::InternalTransactionTracer,
};
use tracing::{debug, instrument, warn};

use crate::{
    config::FetcherConfig,
    fetcher::{chain::ChainBehavior, FetchError},
};

pub struct FetchStrategy {
    config: Arc<FetcherConfig>,
    gateway: Arc<dyn ChainGateway>,
    tracer: Arc<dyn InternalTransactionTracer>,
    chain: Arc<dyn ChainBehavior>,
}

impl FetchStrategy {
    pub fn new(
        config: Arc<FetcherConfig>,
        gateway: Arc<dyn ChainGateway>,
        tracer: Arc<dyn InternalTransactionTracer>,
        chain: Arc<dyn ChainBehavior>,
    ) -> Self {
        Self { config, gateway, tracer, chain }
    }

    /// Drops blocks outside the traceable ranges, and the genesis block unless it holds
    /// transactions.
    #[instrument(skip_all)]
    pub async fn filter_blocks(&self, block_numbers: Vec<BlockNumber>) -> Vec<BlockNumber> {
        let mut filtered: Vec<BlockNumber> = block_numbers
            .into_iter()
            .filter(|n| self.config.is_traceable_block(*n))
            .collect();

        let genesis = self.config.genesis_block_number;
        if filtered.contains(&genesis) && !self.genesis_has_transactions().await {
            debug!(genesis, "Dropping genesis block without transactions");
            filtered.retain(|n| *n != genesis);
        }
        filtered
    }

    async fn genesis_has_transactions(&self) -> bool {
        let genesis = self.config.genesis_block_number;
        match self
            .tracer
            .fetch_blocks_by_number(&[genesis])
            .await
        {
            Ok(blocks) => blocks
                .iter()
                .any(|block| block.has_transactions()),
            Err(err) => {
                warn!(genesis, error = %err, "Failed to fetch genesis block, skipping it");
                false
            }
        }
    }

    /// Fetches the internal transactions of every block, or fails for the whole batch.
    #[instrument(skip_all, fields(block_count = block_numbers.len()))]
    pub async fn fetch(
        &self,
        block_numbers: &[BlockNumber],
    ) -> Result<Vec<InternalTransaction>, FetchError> {
        if self.config.is_block_traceable() {
            return self
                .tracer
                .fetch_block_internal_transactions(block_numbers)
                .await
                .map_err(|err| {
                    FetchError::trace(err)
                        .with_context(format!("block trace of blocks {block_numbers:?}"))
                });
        }

        let mut result = Vec::new();
        for &block_number in block_numbers {
            let requests: Vec<TraceRequest> = self
                .gateway
                .get_transactions_of_block(block_number)
                .await?
                .iter()
                .filter(|tx| self.chain.is_traceable(tx))
                .map(TraceRequest::from)
                .collect();
            if requests.is_empty() {
                continue;
            }

            let itxs = self
                .tracer
                .fetch_internal_transactions(&requests)
                .await
                .map_err(|err| {
                    FetchError::trace(err).with_context(format!(
                        "transaction traces of block {block_number} ({} transactions)",
                        requests.len()
                    ))
                })?;
            result.extend(itxs);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use itx_common::{
        models::{
            blockchain::{BlockSummary, Transaction},
            error::TraceError,
            internal_transaction::fixtures::call,
            Address, BlockHash, JsonRpcVariant, TxHash,
        },
        traits::MockInternalTransactionTracer,
    };
    use rstest::rstest;

    use super::*;
    use crate::{
        config::TraceRange,
        fetcher::chain::{DefaultChain, Zetachain},
        testing::MockGateway,
    };

    fn tx(byte: u8, block_number: BlockNumber, index: u64, tx_type: Option<u64>) -> Transaction {
        Transaction::new(
            TxHash::repeat_byte(byte),
            block_number,
            index,
            Address::repeat_byte(0x11),
            None,
            tx_type,
        )
    }

    fn strategy(
        config: FetcherConfig,
        gateway: MockGateway,
        tracer: MockInternalTransactionTracer,
        chain: Arc<dyn ChainBehavior>,
    ) -> FetchStrategy {
        FetchStrategy::new(Arc::new(config), Arc::new(gateway), Arc::new(tracer), chain)
    }

    #[tokio::test]
    async fn test_block_traceable_backend_uses_one_block_call() {
        let mut tracer = MockInternalTransactionTracer::new();
        tracer
            .expect_fetch_block_internal_transactions()
            .withf(|blocks| blocks.to_vec() == vec![5, 7])
            .times(1)
            .returning(|_| Ok(vec![call(TxHash::repeat_byte(1), &[])]));
        tracer
            .expect_fetch_internal_transactions()
            .never();
        let config = FetcherConfig { json_rpc_variant: JsonRpcVariant::Erigon, ..Default::default() };

        let itxs = strategy(config, MockGateway::new(), tracer, Arc::new(DefaultChain))
            .fetch(&[5, 7])
            .await
            .unwrap();

        assert_eq!(itxs.len(), 1);
    }

    #[tokio::test]
    async fn test_per_transaction_fallback_calls_once_per_block_with_transactions() {
        let mut gateway = MockGateway::new();
        gateway
            .expect_get_transactions_of_block()
            .returning(|n| {
                Ok(match n {
                    5 => vec![tx(1, 5, 0, None), tx(2, 5, 1, Some(2))],
                    _ => vec![],
                })
            });
        let mut tracer = MockInternalTransactionTracer::new();
        tracer
            .expect_fetch_block_internal_transactions()
            .never();
        tracer
            .expect_fetch_internal_transactions()
            .withf(|requests| {
                requests.to_vec() ==
                    vec![
                        TraceRequest {
                            block_number: 5,
                            transaction_hash: TxHash::repeat_byte(1),
                            transaction_index: 0,
                        },
                        TraceRequest {
                            block_number: 5,
                            transaction_hash: TxHash::repeat_byte(2),
                            transaction_index: 1,
                        },
                    ]
            })
            .times(1)
            .returning(|_| Ok(vec![call(TxHash::repeat_byte(1), &[])]));
        let config = FetcherConfig { json_rpc_variant: JsonRpcVariant::Geth, ..Default::default() };

        let itxs = strategy(config, gateway, tracer, Arc::new(DefaultChain))
            .fetch(&[5, 6])
            .await
            .unwrap();

        assert_eq!(itxs.len(), 1);
    }

    #[tokio::test]
    async fn test_zetachain_cross_chain_transactions_are_not_traced() {
        let mut gateway = MockGateway::new();
        gateway
            .expect_get_transactions_of_block()
            .returning(|n| Ok(vec![tx(1, n, 0, Some(88)), tx(2, n, 1, Some(0))]));
        let mut tracer = MockInternalTransactionTracer::new();
        tracer
            .expect_fetch_internal_transactions()
            .withf(|requests| {
                requests
                    .iter()
                    .map(|r| r.transaction_hash)
                    .collect::<Vec<_>>() ==
                    vec![TxHash::repeat_byte(2)]
            })
            .times(1)
            .returning(|_| Ok(vec![]));
        let config = FetcherConfig {
            chain: itx_common::models::Chain::Zetachain,
            json_rpc_variant: JsonRpcVariant::Geth,
            ..Default::default()
        };

        strategy(config, gateway, tracer, Arc::new(Zetachain))
            .fetch(&[9])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_any_failing_block_aborts_the_batch() {
        let mut gateway = MockGateway::new();
        gateway
            .expect_get_transactions_of_block()
            .returning(|n| Ok(vec![tx(n as u8, n, 0, None)]));
        let mut tracer = MockInternalTransactionTracer::new();
        let mut calls = 0;
        tracer
            .expect_fetch_internal_transactions()
            .times(2)
            .returning(move |_| {
                calls += 1;
                if calls == 1 {
                    Ok(vec![call(TxHash::repeat_byte(1), &[])])
                } else {
                    Err(TraceError::Transport("connection reset".to_string()))
                }
            });
        let config = FetcherConfig { json_rpc_variant: JsonRpcVariant::Geth, ..Default::default() };

        let err = strategy(config, gateway, tracer, Arc::new(DefaultChain))
            .fetch(&[1, 2, 3])
            .await
            .unwrap_err();

        assert_eq!(err.trace_error(), Some(&TraceError::Transport("connection reset".to_string())));
        assert!(err
            .context()
            .unwrap()
            .contains("block 2"));
    }

    #[rstest]
    #[case::genesis_with_transactions(true, vec![0, 1, 2])]
    #[case::empty_genesis(false, vec![1, 2])]
    #[tokio::test]
    async fn test_genesis_filtering(#[case] has_transactions: bool, #[case] expected: Vec<BlockNumber>) {
        let mut tracer = MockInternalTransactionTracer::new();
        tracer
            .expect_fetch_blocks_by_number()
            .withf(|blocks| blocks.to_vec() == vec![0])
            .times(1)
            .returning(move |_| {
                let transactions =
                    if has_transactions { vec![tx(1, 0, 0, None)] } else { vec![] };
                Ok(vec![BlockSummary::new(0, BlockHash::ZERO, transactions)])
            });

        let filtered = strategy(FetcherConfig::default(), MockGateway::new(), tracer, Arc::new(DefaultChain))
            .filter_blocks(vec![0, 1, 2])
            .await;

        assert_eq!(filtered, expected);
    }

    #[tokio::test]
    async fn test_genesis_fetch_failure_drops_genesis() {
        let mut tracer = MockInternalTransactionTracer::new();
        tracer
            .expect_fetch_blocks_by_number()
            .returning(|_| Err(TraceError::Transport("timeout".to_string())));
        let config = FetcherConfig { genesis_block_number: 1, ..Default::default() };

        let filtered = strategy(config, MockGateway::new(), tracer, Arc::new(DefaultChain))
            .filter_blocks(vec![1, 2])
            .await;

        assert_eq!(filtered, vec![2]);
    }

    #[tokio::test]
    async fn test_blocks_outside_trace_range_are_dropped() {
        let mut tracer = MockInternalTransactionTracer::new();
        tracer
            .expect_fetch_blocks_by_number()
            .never();
        let config = FetcherConfig {
            trace_range: Some(vec![TraceRange::new(10, Some(20)), TraceRange::new(30, None)]),
            ..Default::default()
        };

        let filtered = strategy(config, MockGateway::new(), tracer, Arc::new(DefaultChain))
            .filter_blocks(vec![0, 5, 10, 20, 25, 30, 1000])
            .await;

        assert_eq!(filtered, vec![10, 20, 30, 1000]);
    }
}
