#[cfg(test)]
#[macro_use]
extern crate pretty_assertions;

pub mod rpc;
pub mod tracer;

#[cfg(test)]
pub mod test_fixtures;

pub use rpc::{
    config::RPCRetryConfig,
    errors::{RPCError, RequestError},
    EthereumRpcClient,
};
pub use tracer::EthereumTracer;
