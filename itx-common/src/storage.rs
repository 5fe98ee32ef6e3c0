//! Storage contracts of the internal transaction pipeline.
//!
//! The pipeline talks to the chain database through [`ChainGateway`] for reads and the single
//! transactional import, and through [`ChainCache`] to evict cached entities that an import made
//! stale.

use std::collections::HashMap;

use async_trait::async_trait;
use futures03::stream::BoxStream;
use thiserror::Error;

use crate::models::{
    address::AddressParam,
    blockchain::Transaction,
    internal_transaction::InternalTransactionEntry,
    token::TokenTransfer,
    Address, BlockHash, BlockNumber, TxHash,
};

#[derive(Error, Debug, PartialEq, Clone)]
pub enum StorageError {
    #[error("Could not find {0} with id `{1}`!")]
    NotFound(String, String),
    #[error("Unexpected storage error: {0}")]
    Unexpected(String),
}

/// Reason a single step of the transactional import was rejected.
#[derive(Error, Debug, PartialEq, Clone)]
pub enum StepFailure {
    #[error("unique violation on `{constraint}`: {detail}")]
    UniqueViolation { constraint: String, detail: String },
    #[error("{0}")]
    Other(String),
}

/// Failure of the transactional import. Nothing of the batch is persisted in either case.
#[derive(Error, Debug, PartialEq, Clone)]
pub enum ImportError {
    /// A step of the import returned an error and the transaction was rolled back.
    #[error("import step `{step}` failed: {reason}")]
    Step { step: String, reason: StepFailure },
    /// A lower level constraint aborted the transaction because a referenced row is missing.
    #[error("foreign key violation on `{constraint}` for transactions {transaction_hashes:?}")]
    ForeignKeyViolation { constraint: String, transaction_hashes: Vec<TxHash> },
}

/// Everything persisted by one import, written in a single transaction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImportBatch {
    pub token_transfers: Vec<TokenTransfer>,
    pub addresses: Vec<AddressParam>,
    pub internal_transactions: Vec<InternalTransactionEntry>,
}

/// Entities written by a successful import.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Imported {
    pub addresses: Vec<AddressParam>,
    pub token_transfers: Vec<TokenTransfer>,
    /// Blocks whose internal transactions are now considered fetched.
    pub blocks: Vec<BlockNumber>,
    pub internal_transactions: usize,
}

#[async_trait]
pub trait ChainGateway: Send + Sync {
    /// Transactions already known for a block, ordered by index.
    async fn get_transactions_of_block(
        &self,
        block_number: BlockNumber,
    ) -> Result<Vec<Transaction>, StorageError>;

    /// Hashes of the given blocks. Unknown blocks are absent from the result.
    async fn get_block_hashes(
        &self,
        block_numbers: &[BlockNumber],
    ) -> Result<HashMap<BlockNumber, BlockHash>, StorageError>;

    /// Persists the batch atomically.
    async fn import_internal_transactions(&self, batch: ImportBatch)
        -> Result<Imported, ImportError>;

    /// Durably flags the blocks as needing a refetch of their internal transactions.
    async fn set_refetch_needed(&self, block_numbers: &[BlockNumber]) -> Result<(), StorageError>;

    /// Lazy sequence of blocks that are still missing their internal transactions.
    fn stream_blocks_with_unfetched_internal_transactions(
        &self,
    ) -> BoxStream<'static, Result<BlockNumber, StorageError>>;
}

pub trait ChainCache: Send + Sync {
    fn evict_addresses(&self, addresses: &[Address]);

    fn evict_blocks(&self, block_numbers: &[BlockNumber]);
}
