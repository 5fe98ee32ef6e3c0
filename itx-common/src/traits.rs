use async_trait::async_trait;

use crate::models::{
    address::CoinBalanceRequest,
    blockchain::{BlockSummary, TraceRequest},
    error::TraceError,
    internal_transaction::InternalTransaction,
    token::TokenBalanceRequest,
    BlockNumber,
};

/// Trait for retrieving the internal transactions produced by executing blocks.
///
/// Implementations own transport concerns (timeouts, cancellation, transient retries). Whatever
/// they return as an error is final for the current attempt; retrying a failed block is the
/// caller's responsibility.
#[cfg_attr(feature = "test-utils", mockall::automock)]
#[async_trait]
pub trait InternalTransactionTracer: Send + Sync {
    /// Traces every transaction of the given blocks in one go.
    ///
    /// Only meaningful for backends that can trace whole blocks.
    async fn fetch_block_internal_transactions(
        &self,
        block_numbers: &[BlockNumber],
    ) -> Result<Vec<InternalTransaction>, TraceError>;

    /// Traces the given transactions one by one.
    ///
    /// # Returns
    /// The flattened call frames of all requested transactions. If any transaction fails to
    /// trace, the whole call fails with every error collected in [`TraceError::Responses`].
    async fn fetch_internal_transactions(
        &self,
        requests: &[TraceRequest],
    ) -> Result<Vec<InternalTransaction>, TraceError>;

    /// Fetches block headers with their transactions.
    async fn fetch_blocks_by_number(
        &self,
        block_numbers: &[BlockNumber],
    ) -> Result<Vec<BlockSummary>, TraceError>;
}

/// Trait for triggering the downstream balance fetchers once internal transactions are stored.
///
/// Calls must not block: implementations only enqueue the work.
#[cfg_attr(feature = "test-utils", mockall::automock)]
pub trait BalanceRefresher: Send + Sync {
    /// Schedules a coin balance refresh for each address as of the given block.
    fn refresh_coin_balances(&self, requests: Vec<CoinBalanceRequest>);

    /// Schedules a token balance refresh for each holder/token/block tuple.
    fn refresh_token_balances(&self, requests: Vec<TokenBalanceRequest>);
}
