#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod config;
pub mod core;
pub mod index;
pub mod migrate;
pub mod policy;
pub mod query;
pub mod resolver;
pub mod stats;
pub mod storage;
pub mod tier;
pub mod vault;

#[cfg(test)]
mod testkit;
