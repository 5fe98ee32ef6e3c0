use serde::{Deserialize, Serialize};

use super::{Address, BlockHash, BlockNumber, TxHash};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub hash: TxHash,
    pub block_number: BlockNumber,
    pub index: u64,
    pub from: Address,
    pub to: Option<Address>,
    /// EIP-2718 transaction type, `None` for legacy transactions on nodes that omit it.
    pub tx_type: Option<u64>,
}

impl Transaction {
    pub fn new(
        hash: TxHash,
        block_number: BlockNumber,
        index: u64,
        from: Address,
        to: Option<Address>,
        tx_type: Option<u64>,
    ) -> Self {
        Transaction { hash, block_number, index, from, to, tx_type }
    }
}

/// A block as returned by `eth_getBlockByNumber`, reduced to what the pipeline needs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSummary {
    pub number: BlockNumber,
    pub hash: BlockHash,
    pub transactions: Vec<Transaction>,
}

impl BlockSummary {
    pub fn new(number: BlockNumber, hash: BlockHash, transactions: Vec<Transaction>) -> Self {
        Self { number, hash, transactions }
    }

    pub fn has_transactions(&self) -> bool {
        !self.transactions.is_empty()
    }
}

/// Minimal request to trace a single transaction.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TraceRequest {
    pub block_number: BlockNumber,
    pub transaction_hash: TxHash,
    pub transaction_index: u64,
}

impl From<&Transaction> for TraceRequest {
    fn from(tx: &Transaction) -> Self {
        TraceRequest {
            block_number: tx.block_number,
            transaction_hash: tx.hash,
            transaction_index: tx.index,
        }
    }
}
