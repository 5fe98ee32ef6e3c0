use std::{fs::File, io::Read, time::Duration};

use itx_common::models::{Address, BlockNumber, Chain, JsonRpcVariant};
use itx_ethereum::RPCRetryConfig;
use serde::Deserialize;

use crate::IndexerError;

/// Inclusive range of block numbers that may be traced. An open `to` extends to the chain head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct TraceRange {
    pub from: BlockNumber,
    #[serde(default)]
    pub to: Option<BlockNumber>,
}

impl TraceRange {
    pub fn new(from: BlockNumber, to: Option<BlockNumber>) -> Self {
        Self { from, to }
    }

    pub fn contains(&self, block_number: BlockNumber) -> bool {
        block_number >= self.from &&
            self.to
                .map_or(true, |to| block_number <= to)
    }
}

/// Settings of the internal transaction fetcher.
///
/// Built once at startup and shared immutably by every component of the pipeline.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct FetcherConfig {
    pub max_batch_size: usize,
    pub max_concurrency: usize,
    pub flush_interval_ms: u64,
    /// Traceable block ranges. `None` means every block is traceable.
    pub trace_range: Option<Vec<TraceRange>>,
    pub genesis_block_number: BlockNumber,
    pub chain: Chain,
    pub json_rpc_variant: JsonRpcVariant,
    /// Extra variant treated as able to trace whole blocks.
    pub block_traceable_variant: Option<JsonRpcVariant>,
    /// Contract of the native CELO token, required on celo.
    pub celo_token_address: Option<Address>,
    pub rpc_retry: RPCRetryConfig,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 10,
            max_concurrency: 4,
            flush_interval_ms: 3000,
            trace_range: None,
            genesis_block_number: 0,
            chain: Chain::default(),
            json_rpc_variant: JsonRpcVariant::default(),
            block_traceable_variant: None,
            celo_token_address: None,
            rpc_retry: RPCRetryConfig::default(),
        }
    }
}

impl FetcherConfig {
    pub fn from_yaml(path: &str) -> Result<Self, IndexerError> {
        let mut file = File::open(path)
            .map_err(|e| IndexerError::Config(format!("Failed to open {path}: {e}")))?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| IndexerError::Config(format!("Failed to read {path}: {e}")))?;
        Self::from_yaml_str(&contents)
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self, IndexerError> {
        let config: FetcherConfig = serde_yaml::from_str(contents)
            .map_err(|e| IndexerError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), IndexerError> {
        if self.max_batch_size == 0 {
            return Err(IndexerError::Config("max_batch_size must be at least 1".to_string()));
        }
        if self.max_concurrency == 0 {
            return Err(IndexerError::Config("max_concurrency must be at least 1".to_string()));
        }
        if let Some(range) = self
            .trace_range
            .iter()
            .flatten()
            .find(|r| r.to.is_some_and(|to| to < r.from))
        {
            return Err(IndexerError::Config(format!(
                "trace range {}..{:?} ends before it starts",
                range.from, range.to
            )));
        }
        if self.chain == Chain::Celo && self.celo_token_address.is_none() {
            return Err(IndexerError::Config(
                "celo_token_address is required on celo".to_string(),
            ));
        }
        Ok(())
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    /// Whether the configured backend can trace a whole block in one call.
    pub fn is_block_traceable(&self) -> bool {
        JsonRpcVariant::BLOCK_TRACEABLE.contains(&self.json_rpc_variant) ||
            self.block_traceable_variant == Some(self.json_rpc_variant)
    }

    pub fn is_traceable_block(&self, block_number: BlockNumber) -> bool {
        match &self.trace_range {
            None => true,
            Some(ranges) => ranges
                .iter()
                .any(|r| r.contains(block_number)),
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_defaults() {
        let config = FetcherConfig::from_yaml_str("{}").unwrap();

        assert_eq!(config, FetcherConfig::default());
        assert_eq!(config.flush_interval(), Duration::from_secs(3));
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
max_batch_size: 5
max_concurrency: 2
flush_interval_ms: 100
trace_range:
  - from: 10
    to: 20
  - from: 100
genesis_block_number: 1
chain: celo
json_rpc_variant: geth
block_traceable_variant: geth
celo_token_address: "0x471ece3750da237f93b8e339c536989b8978a438"
rpc_retry:
  max_retries: 1
"#;

        let config = FetcherConfig::from_yaml_str(yaml).unwrap();

        assert_eq!(config.max_batch_size, 5);
        assert_eq!(config.chain, Chain::Celo);
        assert_eq!(config.json_rpc_variant, JsonRpcVariant::Geth);
        assert_eq!(config.rpc_retry, RPCRetryConfig::new(1, 100, 5000));
        assert!(config.is_block_traceable());
        assert!(config.is_traceable_block(15));
        assert!(!config.is_traceable_block(50));
        assert!(config.is_traceable_block(1_000_000));
    }

    #[rstest]
    #[case::zero_batch("max_batch_size: 0")]
    #[case::zero_concurrency("max_concurrency: 0")]
    #[case::inverted_range("trace_range: [{from: 5, to: 1}]")]
    #[case::celo_without_token("chain: celo")]
    fn test_invalid_config(#[case] yaml: &str) {
        assert!(matches!(FetcherConfig::from_yaml_str(yaml), Err(IndexerError::Config(_))));
    }

    #[rstest]
    #[case::geth(JsonRpcVariant::Geth, None, false)]
    #[case::nethermind(JsonRpcVariant::Nethermind, None, true)]
    #[case::filecoin(JsonRpcVariant::Filecoin, None, true)]
    #[case::promoted_geth(JsonRpcVariant::Geth, Some(JsonRpcVariant::Geth), true)]
    #[case::other_promoted(JsonRpcVariant::Geth, Some(JsonRpcVariant::Besu), false)]
    fn test_block_traceable(
        #[case] variant: JsonRpcVariant,
        #[case] extra: Option<JsonRpcVariant>,
        #[case] expected: bool,
    ) {
        let config = FetcherConfig {
            json_rpc_variant: variant,
            block_traceable_variant: extra,
            ..Default::default()
        };

        assert_eq!(config.is_block_traceable(), expected);
    }
}
