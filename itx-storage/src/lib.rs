#[cfg(test)]
#[macro_use]
extern crate pretty_assertions;

pub mod cache;
pub mod memory;

pub use cache::EntityCache;
pub use memory::MemoryGateway;
