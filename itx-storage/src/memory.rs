//! In-memory [`ChainGateway`].
//!
//! Holds blocks, transactions and everything the pipeline imports behind a single lock. An
//! import validates the whole batch before applying any of it, so a rejected import leaves the
//! state untouched, just like a rolled back database transaction. The same constraints a
//! relational schema would enforce are checked:
//! - an import replaces everything stored for the blocks it covers,
//! - internal transactions are keyed by `(transaction_hash, index)`,
//! - `(block_number, block_index)` is unique across internal transactions,
//! - internal transactions and token transfers must reference a known transaction.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
};

use async_trait::async_trait;
use futures03::{stream::BoxStream, StreamExt};
use itx_common::{
    models::{
        address::AddressParam,
        blockchain::{BlockSummary, Transaction},
        internal_transaction::{InternalTransaction, InternalTransactionEntry},
        token::TokenTransfer,
        Address, BlockHash, BlockNumber, TxHash,
    },
    storage::{ChainGateway, ImportBatch, ImportError, Imported, StepFailure, StorageError},
};
use tokio::sync::RwLock;
use tracing::{debug, instrument};

use crate::cache::EntityCache;

const TOKEN_TRANSFERS_STEP: &str = "token_transfers";
const INTERNAL_TRANSACTIONS_STEP: &str = "internal_transactions";
const BLOCK_INDEX_CONSTRAINT: &str = "internal_transactions_block_number_block_index_index";
const ITX_TRANSACTION_FKEY: &str = "internal_transactions_transaction_hash_fkey";
const TOKEN_TRANSFER_TRANSACTION_FKEY: &str = "token_transfers_transaction_hash_fkey";

type ItxKey = (TxHash, u64);
type BlockSlot = (BlockNumber, u64);

#[derive(Debug, Clone)]
struct BlockRecord {
    hash: BlockHash,
    transactions: Vec<Transaction>,
    internal_transactions_fetched: bool,
    empty_marker: bool,
    refetch_needed: bool,
}

#[derive(Debug, Default)]
struct ChainState {
    blocks: BTreeMap<BlockNumber, BlockRecord>,
    transactions: HashMap<TxHash, BlockNumber>,
    internal_transactions: HashMap<ItxKey, InternalTransaction>,
    block_slots: HashMap<BlockSlot, ItxKey>,
    addresses: HashMap<Address, AddressParam>,
    token_transfers: BTreeMap<(TxHash, BlockHash, i64), TokenTransfer>,
}

/// Counts of the entities currently held, for reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GatewaySummary {
    pub blocks: usize,
    pub fetched_blocks: usize,
    pub refetch_needed_blocks: usize,
    pub empty_blocks: usize,
    pub internal_transactions: usize,
    pub addresses: usize,
    pub token_transfers: usize,
}

#[derive(Debug, Clone)]
pub struct MemoryGateway {
    state: Arc<RwLock<ChainState>>,
    cache: Arc<EntityCache>,
}

impl Default for MemoryGateway {
    fn default() -> Self {
        Self::new(Arc::new(EntityCache::default()))
    }
}

impl MemoryGateway {
    pub fn new(cache: Arc<EntityCache>) -> Self {
        Self { state: Arc::new(RwLock::new(ChainState::default())), cache }
    }

    pub fn cache(&self) -> Arc<EntityCache> {
        self.cache.clone()
    }

    /// Records a block and its transactions as seen by the chain scanner.
    ///
    /// Re-inserting a known block replaces its transactions but keeps its fetch state.
    pub async fn insert_block(&self, block: BlockSummary) {
        let mut state = self.state.write().await;
        for tx in &block.transactions {
            state
                .transactions
                .insert(tx.hash, block.number);
        }
        match state.blocks.get_mut(&block.number) {
            Some(record) => {
                record.hash = block.hash;
                record.transactions = block.transactions;
            }
            None => {
                state.blocks.insert(
                    block.number,
                    BlockRecord {
                        hash: block.hash,
                        transactions: block.transactions,
                        internal_transactions_fetched: false,
                        empty_marker: false,
                        refetch_needed: false,
                    },
                );
            }
        }
    }

    /// Internal transactions stored for a block, ordered by `block_index`.
    pub async fn internal_transactions_of_block(
        &self,
        block_number: BlockNumber,
    ) -> Vec<InternalTransaction> {
        let state = self.state.read().await;
        let mut itxs: Vec<_> = state
            .internal_transactions
            .values()
            .filter(|itx| itx.block_number == block_number)
            .cloned()
            .collect();
        itxs.sort_by_key(|itx| itx.block_index);
        itxs
    }

    pub async fn is_fetched(&self, block_number: BlockNumber) -> bool {
        self.with_block(block_number, |b| b.internal_transactions_fetched)
            .await
    }

    pub async fn is_refetch_needed(&self, block_number: BlockNumber) -> bool {
        self.with_block(block_number, |b| b.refetch_needed)
            .await
    }

    pub async fn has_empty_marker(&self, block_number: BlockNumber) -> bool {
        self.with_block(block_number, |b| b.empty_marker)
            .await
    }

    /// Looks up an address, going through the address cache.
    pub async fn get_address(&self, address: &Address) -> Option<AddressParam> {
        if let Some(cached) = self.cache.get_address(address) {
            return Some(cached);
        }
        let stored = self
            .state
            .read()
            .await
            .addresses
            .get(address)
            .cloned()?;
        self.cache
            .put_address(stored.clone());
        Some(stored)
    }

    pub async fn token_transfers(&self) -> Vec<TokenTransfer> {
        self.state
            .read()
            .await
            .token_transfers
            .values()
            .cloned()
            .collect()
    }

    pub async fn summary(&self) -> GatewaySummary {
        let state = self.state.read().await;
        let blocks = state.blocks.values();
        GatewaySummary {
            blocks: state.blocks.len(),
            fetched_blocks: blocks
                .clone()
                .filter(|b| b.internal_transactions_fetched)
                .count(),
            refetch_needed_blocks: blocks
                .clone()
                .filter(|b| b.refetch_needed)
                .count(),
            empty_blocks: blocks
                .filter(|b| b.empty_marker)
                .count(),
            internal_transactions: state.internal_transactions.len(),
            addresses: state.addresses.len(),
            token_transfers: state.token_transfers.len(),
        }
    }

    async fn with_block<F: FnOnce(&BlockRecord) -> bool>(
        &self,
        block_number: BlockNumber,
        f: F,
    ) -> bool {
        self.state
            .read()
            .await
            .blocks
            .get(&block_number)
            .is_some_and(f)
    }
}

impl ChainState {
    fn validate_token_transfers(&self, transfers: &[TokenTransfer]) -> Result<(), ImportError> {
        let mut missing = Vec::new();
        for transfer in transfers {
            match self.blocks.get(&transfer.block_number) {
                Some(block) if block.hash == transfer.block_hash => {}
                _ => {
                    return Err(ImportError::Step {
                        step: TOKEN_TRANSFERS_STEP.to_string(),
                        reason: StepFailure::Other(format!(
                            "block {} with hash {} is unknown",
                            transfer.block_number, transfer.block_hash
                        )),
                    })
                }
            }
            if !self
                .transactions
                .contains_key(&transfer.transaction_hash)
            {
                missing.push(transfer.transaction_hash);
            }
        }
        foreign_key_check(TOKEN_TRANSFER_TRANSACTION_FKEY, missing)
    }

    fn validate_internal_transactions(
        &self,
        entries: &[InternalTransactionEntry],
    ) -> Result<(), ImportError> {
        // every block of the batch is replaced, so only slots staged by this batch can collide
        let mut missing = Vec::new();
        let mut staged_slots: HashMap<BlockSlot, ItxKey> = HashMap::new();
        for entry in entries {
            let itx = match entry {
                InternalTransactionEntry::Empty(marker) => {
                    if !self
                        .blocks
                        .contains_key(&marker.block_number)
                    {
                        return Err(step_failure(format!(
                            "block {} is unknown",
                            marker.block_number
                        )));
                    }
                    continue;
                }
                InternalTransactionEntry::Frame(itx) => itx,
            };

            match self
                .transactions
                .get(&itx.transaction_hash)
            {
                None => {
                    missing.push(itx.transaction_hash);
                    continue;
                }
                Some(&block_number) if block_number != itx.block_number => {
                    return Err(step_failure(format!(
                        "transaction {} belongs to block {block_number}, not {}",
                        itx.transaction_hash, itx.block_number
                    )));
                }
                Some(_) => {}
            }

            let key = (itx.transaction_hash, itx.index);
            let slot = (itx.block_number, itx.block_index);
            let holder = staged_slots.insert(slot, key);
            if let Some(holder) = holder.filter(|holder| *holder != key) {
                return Err(ImportError::Step {
                    step: INTERNAL_TRANSACTIONS_STEP.to_string(),
                    reason: StepFailure::UniqueViolation {
                        constraint: BLOCK_INDEX_CONSTRAINT.to_string(),
                        detail: format!(
                            "Key (block_number, block_index)=({}, {}) already exists for \
                             transaction {} index {}",
                            slot.0, slot.1, holder.0, holder.1
                        ),
                    },
                });
            }
        }
        foreign_key_check(ITX_TRANSACTION_FKEY, missing)
    }

    /// Drops everything previously stored for the blocks, so an import replaces them.
    fn clear_internal_transactions(&mut self, block_numbers: &[BlockNumber]) {
        let replaced: HashSet<BlockNumber> = block_numbers.iter().copied().collect();
        self.internal_transactions
            .retain(|_, itx| !replaced.contains(&itx.block_number));
        self.block_slots
            .retain(|(block_number, _), _| !replaced.contains(block_number));
    }

    fn apply(&mut self, batch: &ImportBatch) -> Vec<BlockNumber> {
        for transfer in &batch.token_transfers {
            self.token_transfers.insert(
                (transfer.transaction_hash, transfer.block_hash, transfer.log_index),
                transfer.clone(),
            );
        }

        for address in &batch.addresses {
            match self.addresses.get_mut(&address.hash) {
                Some(existing) => existing.merge(address.clone()),
                None => {
                    self.addresses
                        .insert(address.hash, address.clone());
                }
            }
        }

        let mut blocks = Vec::new();
        for entry in &batch.internal_transactions {
            let block_number = entry.block_number();
            if !blocks.contains(&block_number) {
                blocks.push(block_number);
            }
        }
        self.clear_internal_transactions(&blocks);

        let mut with_frames = HashSet::new();
        for entry in &batch.internal_transactions {
            if let InternalTransactionEntry::Frame(itx) = entry {
                with_frames.insert(itx.block_number);
                let key = (itx.transaction_hash, itx.index);
                self.internal_transactions
                    .insert(key, itx.clone());
                self.block_slots
                    .insert((itx.block_number, itx.block_index), key);
            }
        }

        for block_number in &blocks {
            if let Some(record) = self.blocks.get_mut(block_number) {
                record.internal_transactions_fetched = true;
                record.empty_marker = !with_frames.contains(block_number);
            }
        }
        blocks
    }
}

fn step_failure(reason: String) -> ImportError {
    ImportError::Step {
        step: INTERNAL_TRANSACTIONS_STEP.to_string(),
        reason: StepFailure::Other(reason),
    }
}

fn foreign_key_check(constraint: &str, mut missing: Vec<TxHash>) -> Result<(), ImportError> {
    if missing.is_empty() {
        return Ok(());
    }
    missing.sort();
    missing.dedup();
    Err(ImportError::ForeignKeyViolation {
        constraint: constraint.to_string(),
        transaction_hashes: missing,
    })
}

#[async_trait]
impl ChainGateway for MemoryGateway {
    async fn get_transactions_of_block(
        &self,
        block_number: BlockNumber,
    ) -> Result<Vec<Transaction>, StorageError> {
        let state = self.state.read().await;
        let block = state
            .blocks
            .get(&block_number)
            .ok_or_else(|| StorageError::NotFound("Block".to_string(), block_number.to_string()))?;
        let mut transactions = block.transactions.clone();
        transactions.sort_by_key(|tx| tx.index);
        Ok(transactions)
    }

    async fn get_block_hashes(
        &self,
        block_numbers: &[BlockNumber],
    ) -> Result<HashMap<BlockNumber, BlockHash>, StorageError> {
        let mut result = HashMap::with_capacity(block_numbers.len());
        let mut misses = Vec::new();
        for &block_number in block_numbers {
            match self.cache.get_block_hash(block_number) {
                Some(hash) => {
                    result.insert(block_number, hash);
                }
                None => misses.push(block_number),
            }
        }
        if misses.is_empty() {
            return Ok(result);
        }

        let state = self.state.read().await;
        for block_number in misses {
            if let Some(block) = state.blocks.get(&block_number) {
                self.cache
                    .put_block_hash(block_number, block.hash);
                result.insert(block_number, block.hash);
            }
        }
        Ok(result)
    }

    #[instrument(skip_all, fields(entries = batch.internal_transactions.len()))]
    async fn import_internal_transactions(
        &self,
        batch: ImportBatch,
    ) -> Result<Imported, ImportError> {
        let mut state = self.state.write().await;
        state.validate_token_transfers(&batch.token_transfers)?;
        state.validate_internal_transactions(&batch.internal_transactions)?;

        let blocks = state.apply(&batch);
        let internal_transactions = batch
            .internal_transactions
            .iter()
            .filter(|entry| matches!(entry, InternalTransactionEntry::Frame(_)))
            .count();
        debug!(blocks = blocks.len(), internal_transactions, "Imported internal transactions");

        Ok(Imported {
            addresses: batch.addresses,
            token_transfers: batch.token_transfers,
            blocks,
            internal_transactions,
        })
    }

    async fn set_refetch_needed(&self, block_numbers: &[BlockNumber]) -> Result<(), StorageError> {
        let mut state = self.state.write().await;
        for block_number in block_numbers {
            match state.blocks.get_mut(block_number) {
                Some(record) => record.refetch_needed = true,
                None => debug!(block_number, "Skipping refetch flag for unknown block"),
            }
        }
        Ok(())
    }

    fn stream_blocks_with_unfetched_internal_transactions(
        &self,
    ) -> BoxStream<'static, Result<BlockNumber, StorageError>> {
        let state = self.state.clone();
        futures03::stream::once(async move {
            state
                .read()
                .await
                .blocks
                .iter()
                .filter(|(_, b)| !b.internal_transactions_fetched && !b.refetch_needed)
                .map(|(number, _)| Ok(*number))
                .collect::<Vec<_>>()
        })
        .flat_map(futures03::stream::iter)
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use futures03::TryStreamExt;
    use itx_common::models::{
        internal_transaction::{fixtures::call, EmptyBlockMarker},
        token::ERC20,
        U256,
    };
    use rstest::rstest;

    use super::*;

    fn tx(byte: u8, block_number: BlockNumber, index: u64) -> Transaction {
        Transaction::new(
            TxHash::repeat_byte(byte),
            block_number,
            index,
            Address::repeat_byte(0x11),
            Some(Address::repeat_byte(0x22)),
            None,
        )
    }

    fn frame(byte: u8, index: u64, block_index: u64) -> InternalTransactionEntry {
        let mut itx = call(TxHash::repeat_byte(byte), &[]);
        itx.index = index;
        itx.block_index = block_index;
        InternalTransactionEntry::Frame(itx)
    }

    async fn gateway() -> MemoryGateway {
        let gw = MemoryGateway::default();
        gw.insert_block(BlockSummary::new(100, BlockHash::repeat_byte(0xaa), vec![tx(1, 100, 0)]))
            .await;
        gw.insert_block(BlockSummary::new(101, BlockHash::repeat_byte(0xbb), vec![]))
            .await;
        gw
    }

    fn batch(entries: Vec<InternalTransactionEntry>) -> ImportBatch {
        ImportBatch { internal_transactions: entries, ..Default::default() }
    }

    #[tokio::test]
    async fn test_import_is_idempotent() {
        let gw = gateway().await;
        let entries = vec![
            frame(1, 0, 0),
            frame(1, 1, 1),
            InternalTransactionEntry::Empty(EmptyBlockMarker::new(101)),
        ];

        let first = gw
            .import_internal_transactions(batch(entries.clone()))
            .await
            .unwrap();
        let stored_first = gw
            .internal_transactions_of_block(100)
            .await;
        gw.import_internal_transactions(batch(entries))
            .await
            .unwrap();

        assert_eq!(first.blocks, vec![100, 101]);
        assert_eq!(first.internal_transactions, 2);
        assert_eq!(
            gw.internal_transactions_of_block(100)
                .await,
            stored_first
        );
        assert_eq!(gw.summary().await.internal_transactions, 2);
        assert!(gw.has_empty_marker(101).await);
        assert!(!gw.has_empty_marker(100).await);
        assert!(gw.is_fetched(100).await);
    }

    #[tokio::test]
    async fn test_block_index_collision_is_unique_violation_and_rolls_back() {
        let gw = gateway().await;
        gw.import_internal_transactions(batch(vec![frame(1, 0, 0)]))
            .await
            .unwrap();

        // two frames claiming the same slot, plus an address that must not be written
        let mut rejected = batch(vec![frame(1, 0, 3), frame(1, 5, 3)]);
        rejected.addresses = vec![AddressParam::new(Address::repeat_byte(0x99), 100)];
        let err = gw
            .import_internal_transactions(rejected)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ImportError::Step { ref step, reason: StepFailure::UniqueViolation { .. } }
                if step == "internal_transactions"
        ));
        assert_eq!(gw.summary().await.addresses, 0);
        let stored = gw
            .internal_transactions_of_block(100)
            .await;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].block_index, 0);
    }

    #[tokio::test]
    async fn test_reimport_replaces_stored_frames() {
        let gw = gateway().await;
        gw.import_internal_transactions(batch(vec![frame(1, 0, 0), frame(1, 1, 1), frame(1, 2, 2)]))
            .await
            .unwrap();

        gw.import_internal_transactions(batch(vec![frame(1, 0, 0)]))
            .await
            .unwrap();

        let stored = gw
            .internal_transactions_of_block(100)
            .await;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].index, 0);
        assert_eq!(gw.summary().await.internal_transactions, 1);
        assert!(!gw.has_empty_marker(100).await);
    }

    #[tokio::test]
    async fn test_reimport_as_empty_block_drops_frames() {
        let gw = gateway().await;
        gw.import_internal_transactions(batch(vec![frame(1, 0, 0), frame(1, 1, 1)]))
            .await
            .unwrap();

        gw.import_internal_transactions(batch(vec![InternalTransactionEntry::Empty(
            EmptyBlockMarker::new(100),
        )]))
        .await
        .unwrap();

        assert!(gw
            .internal_transactions_of_block(100)
            .await
            .is_empty());
        assert!(gw.has_empty_marker(100).await);
    }

    #[tokio::test]
    async fn test_reimport_with_shifted_positions_is_accepted() {
        let gw = gateway().await;
        gw.import_internal_transactions(batch(vec![frame(1, 0, 0), frame(1, 1, 1)]))
            .await
            .unwrap();

        // the same slots now held by different call positions
        gw.import_internal_transactions(batch(vec![frame(1, 1, 0), frame(1, 0, 1)]))
            .await
            .unwrap();

        let stored = gw
            .internal_transactions_of_block(100)
            .await;
        assert_eq!(
            stored
                .iter()
                .map(|itx| (itx.index, itx.block_index))
                .collect::<Vec<_>>(),
            vec![(1, 0), (0, 1)]
        );
    }

    #[tokio::test]
    async fn test_unknown_transaction_is_foreign_key_violation() {
        let gw = gateway().await;

        let err = gw
            .import_internal_transactions(batch(vec![frame(7, 0, 0), frame(7, 1, 1)]))
            .await
            .unwrap_err();

        assert_eq!(
            err,
            ImportError::ForeignKeyViolation {
                constraint: ITX_TRANSACTION_FKEY.to_string(),
                transaction_hashes: vec![TxHash::repeat_byte(7)],
            }
        );
    }

    #[rstest]
    #[case::unknown_marker_block(
        batch(vec![InternalTransactionEntry::Empty(EmptyBlockMarker::new(555))])
    )]
    #[case::unknown_transfer_block(ImportBatch {
        token_transfers: vec![TokenTransfer {
            transaction_hash: TxHash::repeat_byte(1),
            block_number: 100,
            block_hash: BlockHash::repeat_byte(0xff),
            log_index: -1,
            from_address_hash: Address::repeat_byte(0x11),
            to_address_hash: Address::repeat_byte(0x22),
            token_contract_address_hash: Address::repeat_byte(0xce),
            amount: U256::from(1),
            token_type: ERC20.to_string(),
        }],
        ..Default::default()
    })]
    #[tokio::test]
    async fn test_other_step_failures(#[case] rejected: ImportBatch) {
        let gw = gateway().await;

        let err = gw
            .import_internal_transactions(rejected)
            .await
            .unwrap_err();

        assert!(matches!(err, ImportError::Step { reason: StepFailure::Other(_), .. }));
    }

    #[test_log::test(tokio::test)]
    async fn test_stream_skips_fetched_and_flagged_blocks() {
        let gw = gateway().await;
        gw.insert_block(BlockSummary::new(102, BlockHash::repeat_byte(0xcc), vec![]))
            .await;
        gw.import_internal_transactions(batch(vec![InternalTransactionEntry::Empty(
            EmptyBlockMarker::new(101),
        )]))
        .await
        .unwrap();
        gw.set_refetch_needed(&[102, 999])
            .await
            .unwrap();

        let pending: Vec<_> = gw
            .stream_blocks_with_unfetched_internal_transactions()
            .try_collect()
            .await
            .unwrap();

        assert_eq!(pending, vec![100]);
        assert!(gw.is_refetch_needed(102).await);
    }

    #[tokio::test]
    async fn test_block_hashes_go_through_cache() {
        let gw = gateway().await;

        let hashes = gw
            .get_block_hashes(&[100, 404])
            .await
            .unwrap();

        assert_eq!(hashes.len(), 1);
        assert_eq!(gw.cache().get_block_hash(100), Some(BlockHash::repeat_byte(0xaa)));
    }

    #[tokio::test]
    async fn test_unknown_block_transactions_not_found() {
        let gw = gateway().await;

        let err = gw
            .get_transactions_of_block(404)
            .await
            .unwrap_err();

        assert_eq!(err, StorageError::NotFound("Block".to_string(), "404".to_string()));
    }
}
