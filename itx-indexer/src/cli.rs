use std::str::FromStr;

use clap::{Args, Parser, Subcommand};
use itx_common::models::{BlockNumber, Chain, JsonRpcVariant};

use crate::{config::FetcherConfig, IndexerError};

/// Internal transaction indexer
///
/// Traces blocks through a JSON-RPC node and stores their internal transactions.
#[derive(Parser, PartialEq, Debug)]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

impl Cli {
    pub fn command(&self) -> Command {
        self.command.clone()
    }
}

#[derive(Subcommand, Clone, PartialEq, Debug)]
pub enum Command {
    /// Fetches the internal transactions of a block range until nothing is pending.
    Run(RunArgs),
}

#[derive(Args, Debug, Clone, PartialEq)]
pub struct RunArgs {
    /// The RPC URL of the tracing node
    #[clap(env = "RPC_URL", long, hide_env_values = true)]
    pub rpc_url: String,

    /// Fetcher configuration file
    #[clap(long, env = "ITX_CONFIG")]
    pub config: Option<String>,

    /// First block to index
    #[clap(long)]
    pub from_block: BlockNumber,

    /// Last block to index, inclusive
    #[clap(long)]
    pub to_block: BlockNumber,

    /// Overrides the configured chain
    #[clap(long)]
    pub chain: Option<String>,

    /// Overrides the configured JSON-RPC variant of the node
    #[clap(long)]
    pub json_rpc_variant: Option<String>,

    /// Overrides the configured number of concurrent batches
    #[clap(long)]
    pub max_concurrency: Option<usize>,

    /// Overrides the configured batch size
    #[clap(long)]
    pub max_batch_size: Option<usize>,

    /// How often to check whether the pipeline has drained, in milliseconds
    #[clap(long, default_value = "500")]
    pub idle_poll_ms: u64,
}

impl RunArgs {
    /// Loads the configuration file, if any, and applies the command line overrides.
    pub fn fetcher_config(&self) -> Result<FetcherConfig, IndexerError> {
        let mut config = match &self.config {
            Some(path) => FetcherConfig::from_yaml(path)?,
            None => FetcherConfig::default(),
        };
        if let Some(chain) = &self.chain {
            config.chain = Chain::from_str(chain)
                .map_err(|_| IndexerError::Config(format!("Unknown chain {chain}")))?;
        }
        if let Some(variant) = &self.json_rpc_variant {
            config.json_rpc_variant = JsonRpcVariant::from_str(variant)
                .map_err(|_| IndexerError::Config(format!("Unknown JSON-RPC variant {variant}")))?;
        }
        if let Some(max_concurrency) = self.max_concurrency {
            config.max_concurrency = max_concurrency;
        }
        if let Some(max_batch_size) = self.max_batch_size {
            config.max_batch_size = max_batch_size;
        }
        if self.from_block > self.to_block {
            return Err(IndexerError::Config(format!(
                "--from-block {} is after --to-block {}",
                self.from_block, self.to_block
            )));
        }
        config.validate()?;
        Ok(config)
    }

    pub fn block_range(&self) -> impl Iterator<Item = BlockNumber> {
        self.from_block..=self.to_block
    }
}
