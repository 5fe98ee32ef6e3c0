//! Internal transaction fetcher.
//!
//! A batch of block numbers goes through four stages:
//! 1. [`strategy`] filters the batch and fetches the traces, per block or per transaction,
//! 2. [`propagation`] marks calls below a reverted call as reverted themselves,
//! 3. [`importer`] writes everything in one store transaction and triggers balance refreshes,
//! 4. [`coordinator`] re-queues the batch if any stage asked for a retry.

use std::sync::Arc;

use async_trait::async_trait;
use itx_common::{
    models::{error::TraceError, BlockNumber},
    storage::{ChainCache, ChainGateway, StorageError},
    traits::{BalanceRefresher, InternalTransactionTracer},
};
use thiserror::Error;
use tracing::{error, instrument, warn};

pub mod addresses;
pub mod chain;
pub mod classifier;
pub mod coordinator;
pub mod importer;
pub mod propagation;
pub mod strategy;

use crate::{
    config::FetcherConfig,
    fetcher::{importer::Importer, strategy::FetchStrategy},
    IndexerError,
};

/// What the coordinator should do with a batch after a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Done,
    /// Put these block numbers back into the pending set.
    Retry(Vec<BlockNumber>),
    /// Drop the batch without retrying.
    Ignore,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    /// The trace client failed. `context` describes the request for the logs.
    #[error("trace request failed: {source}")]
    Trace { source: TraceError, context: Option<String> },
    #[error("failed to read known transactions: {0}")]
    Storage(#[from] StorageError),
}

impl FetchError {
    pub fn trace(source: TraceError) -> Self {
        FetchError::Trace { source, context: None }
    }

    pub fn with_context(self, context: impl Into<String>) -> Self {
        match self {
            FetchError::Trace { source, .. } => {
                FetchError::Trace { source, context: Some(context.into()) }
            }
            other => other,
        }
    }

    pub fn trace_error(&self) -> Option<&TraceError> {
        match self {
            FetchError::Trace { source, .. } => Some(source),
            FetchError::Storage(_) => None,
        }
    }

    pub fn context(&self) -> Option<&str> {
        match self {
            FetchError::Trace { context, .. } => context.as_deref(),
            FetchError::Storage(_) => None,
        }
    }
}

/// Runs the whole fetch, normalize and import cycle for one batch.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BatchProcessor: Send + Sync {
    async fn run(&self, block_numbers: Vec<BlockNumber>) -> RunOutcome;
}

pub struct InternalTransactionFetcher {
    gateway: Arc<dyn ChainGateway>,
    strategy: FetchStrategy,
    importer: Importer,
}

impl InternalTransactionFetcher {
    pub fn new(
        config: Arc<FetcherConfig>,
        gateway: Arc<dyn ChainGateway>,
        tracer: Arc<dyn InternalTransactionTracer>,
        cache: Arc<dyn ChainCache>,
        refresher: Arc<dyn BalanceRefresher>,
    ) -> Result<Self, IndexerError> {
        let chain = chain::for_config(&config)?;
        Ok(Self {
            gateway: gateway.clone(),
            strategy: FetchStrategy::new(config, gateway.clone(), tracer, chain.clone()),
            importer: Importer::new(gateway, cache, refresher, chain),
        })
    }

    async fn handle_fetch_error(&self, block_numbers: Vec<BlockNumber>, err: FetchError) -> RunOutcome {
        if let Some(TraceError::Unsupported(reason)) = err.trace_error() {
            warn!(block_count = block_numbers.len(), reason, "Internal transactions can not be traced, ignoring batch");
            return RunOutcome::Ignore;
        }

        let to_refetch = err
            .trace_error()
            .map(classifier::blocks_needing_refetch)
            .unwrap_or_default();
        if !to_refetch.is_empty() {
            if let Err(flag_err) = self
                .gateway
                .set_refetch_needed(&to_refetch)
                .await
            {
                error!(error = %flag_err, blocks = ?to_refetch, "Failed to flag blocks for refetch");
            }
        }

        error!(
            block_count = block_numbers.len(),
            flagged = to_refetch.len(),
            context = err.context(),
            error = %err,
            "Failed to fetch internal transactions, retrying batch"
        );
        RunOutcome::Retry(block_numbers)
    }
}

#[async_trait]
impl BatchProcessor for InternalTransactionFetcher {
    #[instrument(skip_all, fields(block_count = block_numbers.len()))]
    async fn run(&self, block_numbers: Vec<BlockNumber>) -> RunOutcome {
        let block_numbers = self
            .strategy
            .filter_blocks(block_numbers)
            .await;
        if block_numbers.is_empty() {
            return RunOutcome::Done;
        }

        match self
            .strategy
            .fetch(&block_numbers)
            .await
        {
            Ok(itxs) => {
                let itxs = propagation::mark_failed_parents(itxs);
                self.importer
                    .import(block_numbers, itxs)
                    .await
            }
            Err(err) => {
                self.handle_fetch_error(block_numbers, err)
                    .await
            }
        }
    }
}
