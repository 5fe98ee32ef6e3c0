//! Recognizes trace errors that mean a block can not be traced the way it is stored.

use itx_common::models::{error::TraceError, BlockNumber};
use tracing::debug;

/// Node messages that identify a block needing a refetch.
const REFETCH_MESSAGES: [&str; 3] =
    ["historical backend error", "genesis is not traceable", "transaction not found"];

/// Blocks named by the known error responses in `err`, sorted and deduplicated.
///
/// Responses with other messages, or without a block number in their data, are skipped.
pub fn blocks_needing_refetch(err: &TraceError) -> Vec<BlockNumber> {
    let mut blocks: Vec<BlockNumber> = err
        .responses()
        .iter()
        .filter(|response| {
            let message = response.message.to_ascii_lowercase();
            REFETCH_MESSAGES
                .iter()
                .any(|known| message.contains(known))
        })
        .filter_map(|response| {
            let block = response.block_number();
            if block.is_none() {
                debug!(%response, "Known trace error without a block number");
            }
            block
        })
        .collect();
    blocks.sort_unstable();
    blocks.dedup();
    blocks
}
