//! Adapters behind the domain ports: provider clients, stores and sinks.

pub mod gateways;
pub mod in_memory;
#[cfg(feature = "storage-rocksdb")]
pub mod rocksdb;
pub mod sinks;
