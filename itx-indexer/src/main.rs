use std::{sync::Arc, time::Duration};

use clap::Parser;
use itx_common::{models::BlockNumber, storage::ChainGateway, traits::InternalTransactionTracer};
use itx_ethereum::{EthereumRpcClient, EthereumTracer};
use itx_indexer::{
    cli::{Cli, Command, RunArgs},
    fetcher::{
        coordinator::{seed_from_stream, Coordinator, CoordinatorHandle},
        InternalTransactionFetcher,
    },
    refresh::ChannelBalanceRefresher,
};
use itx_storage::{EntityCache, MemoryGateway};
use tracing::{debug, info, instrument, warn};
use tracing_subscriber::EnvFilter;

/// Blocks requested from the node per `eth_getBlockByNumber` round while seeding.
const SEED_CHUNK_SIZE: usize = 50;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    create_tracing_subscriber();

    match cli.command() {
        Command::Run(args) => run(args).await,
    }
}

fn create_tracing_subscriber() {
    let format = tracing_subscriber::fmt::format()
        .with_level(true)
        .with_target(false)
        .compact();
    tracing_subscriber::fmt()
        .event_format(format)
        .with_env_filter(EnvFilter::from_default_env())
        .init();
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let config = Arc::new(args.fetcher_config()?);
    info!(
        chain = %config.chain,
        json_rpc_variant = %config.json_rpc_variant,
        from_block = args.from_block,
        to_block = args.to_block,
        "Starting internal transaction indexer"
    );

    let client = EthereumRpcClient::new(&args.rpc_url)?.with_retry(config.rpc_retry.clone());
    let tracer = Arc::new(EthereumTracer::new(client, config.json_rpc_variant));
    let cache = Arc::new(EntityCache::default());
    let gateway = Arc::new(MemoryGateway::new(cache.clone()));

    let block_numbers: Vec<BlockNumber> = args.block_range().collect();
    seed_blocks(&gateway, tracer.as_ref(), &block_numbers).await?;

    let (refresher, receivers) = ChannelBalanceRefresher::new();
    let refresh_task = tokio::spawn(receivers.log_until_closed());

    let fetcher = InternalTransactionFetcher::new(
        config.clone(),
        gateway.clone(),
        tracer,
        cache,
        Arc::new(refresher),
    )?;
    let (coordinator, handle) = Coordinator::new(&config, Arc::new(fetcher));
    let coordinator_task = tokio::spawn(coordinator.run());

    seed_from_stream(
        &handle,
        gateway.stream_blocks_with_unfetched_internal_transactions(),
        config.max_batch_size,
    )
    .await?;

    tokio::select! {
        _ = wait_until_idle(&handle, Duration::from_millis(args.idle_poll_ms)) => {
            info!("All pending blocks processed");
        }
        signal = tokio::signal::ctrl_c() => {
            signal?;
            warn!(pending = handle.pending_len().await, "Interrupted, stopping after in-flight batches");
        }
    }

    handle.stop().await?;
    coordinator_task.await??;
    drop(handle);

    let refreshes = refresh_task.await?;
    let summary = gateway.summary().await;
    info!(
        blocks = summary.blocks,
        fetched_blocks = summary.fetched_blocks,
        empty_blocks = summary.empty_blocks,
        refetch_needed_blocks = summary.refetch_needed_blocks,
        internal_transactions = summary.internal_transactions,
        addresses = summary.addresses,
        token_transfers = summary.token_transfers,
        coin_balance_refreshes = refreshes.coin_balances,
        token_balance_refreshes = refreshes.token_balances,
        "Indexing finished"
    );
    Ok(())
}

/// Loads block headers and transactions from the node into the gateway, playing the role of the
/// chain scanner.
#[instrument(skip_all, fields(block_count = block_numbers.len()))]
async fn seed_blocks(
    gateway: &MemoryGateway,
    tracer: &dyn InternalTransactionTracer,
    block_numbers: &[BlockNumber],
) -> anyhow::Result<()> {
    for chunk in block_numbers.chunks(SEED_CHUNK_SIZE) {
        for block in tracer
            .fetch_blocks_by_number(chunk)
            .await?
        {
            debug!(block_number = block.number, tx_count = block.transactions.len(), "Seeding block");
            gateway.insert_block(block).await;
        }
    }
    info!("Seeded blocks from node");
    Ok(())
}

async fn wait_until_idle(handle: &CoordinatorHandle, poll_interval: Duration) {
    let mut ticker = tokio::time::interval(poll_interval);
    loop {
        ticker.tick().await;
        if handle.is_idle().await {
            return;
        }
    }
}
