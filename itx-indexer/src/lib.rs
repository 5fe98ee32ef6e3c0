#[cfg(test)]
#[macro_use]
extern crate pretty_assertions;

use itx_common::storage::StorageError;
use thiserror::Error;

pub mod cli;
pub mod config;
pub mod fetcher;
pub mod refresh;
#[cfg(test)]
pub mod testing;

#[derive(Error, Debug)]
pub enum IndexerError {
    #[error("Indexer setup failed: {0}")]
    Setup(String),
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Storage failure: {0}")]
    Storage(#[from] StorageError),
    #[error("Coordinator is not running: {0}")]
    Stopped(String),
}
