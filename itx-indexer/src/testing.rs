use std::collections::HashMap;

use async_trait::async_trait;
use futures03::stream::BoxStream;
use itx_common::{
    models::{blockchain::Transaction, Address, BlockHash, BlockNumber},
    storage::{
        ChainCache, ChainGateway, ImportBatch, ImportError, Imported, StorageError,
    },
};
use mockall::mock;

mock! {
    pub Gateway {}
    #[async_trait]
    impl ChainGateway for Gateway {
        async fn get_transactions_of_block(
            &self,
            block_number: BlockNumber,
        ) -> Result<Vec<Transaction>, StorageError>;
        async fn get_block_hashes(
            &self,
            block_numbers: &[BlockNumber],
        ) -> Result<HashMap<BlockNumber, BlockHash>, StorageError>;
        async fn import_internal_transactions(
            &self,
            batch: ImportBatch,
        ) -> Result<Imported, ImportError>;
        async fn set_refetch_needed(&self, block_numbers: &[BlockNumber]) -> Result<(), StorageError>;
        fn stream_blocks_with_unfetched_internal_transactions(
            &self,
        ) -> BoxStream<'static, Result<BlockNumber, StorageError>>;
    }

    impl ChainCache for Gateway {
        fn evict_addresses(&self, addresses: &[Address]);
        fn evict_blocks(&self, block_numbers: &[BlockNumber]);
    }
}
