//! Reverted-parent propagation.
//!
//! When a call reverts, every call nested below it is unwound as well, even if the trace still
//! reports outputs or created contracts for the nested frames. Those artifacts must not be
//! stored.

use std::collections::{HashMap, HashSet};

use itx_common::models::{internal_transaction::InternalTransaction, TraceAddress, TxHash};

/// Trace addresses of every errored call, per transaction.
#[derive(Debug, Default)]
struct FailedParents(HashMap<TxHash, HashSet<TraceAddress>>);

impl FailedParents {
    fn from_records(itxs: &[InternalTransaction]) -> Self {
        let mut failed: HashMap<TxHash, HashSet<TraceAddress>> = HashMap::new();
        for itx in itxs.iter().filter(|itx| itx.has_error()) {
            failed
                .entry(itx.transaction_hash)
                .or_default()
                .insert(itx.trace_address.clone());
        }
        Self(failed)
    }

    /// Whether a strict ancestor of `itx` failed. A call is never its own parent.
    fn has_failed_ancestor(&self, itx: &InternalTransaction) -> bool {
        let Some(failed) = self.0.get(&itx.transaction_hash) else {
            return false;
        };
        (0..itx.trace_address.len()).any(|depth| failed.contains(&itx.trace_address[..depth]))
    }
}

/// Marks every call below a reverted call as `Parent reverted` and strips its artifacts.
///
/// Calls carrying their own error keep it.
pub fn mark_failed_parents(mut itxs: Vec<InternalTransaction>) -> Vec<InternalTransaction> {
    let failed = FailedParents::from_records(&itxs);
    if failed.0.is_empty() {
        return itxs;
    }
    for itx in itxs.iter_mut() {
        if !itx.has_error() && failed.has_failed_ancestor(itx) {
            itx.mark_parent_reverted();
        }
    }
    itxs
}
