//! Shared building blocks for the automation core.
//!
//! - [`AssetKey`]: identity of a data asset
//! - [`PartitionSubset`]: immutable set algebra over an asset's partition space
//! - [`PartitionsDefinition`]: the (opaque, ordered) partition key space
//! - [`Config`]: env-driven configuration for the daemon and stores

pub mod asset;
pub mod config;
pub mod error;
pub mod partitions;
pub mod subset;

pub use asset::AssetKey;
pub use config::{Config, DaemonConfig, StorageConfig};
pub use error::*;
pub use partitions::PartitionsDefinition;
pub use subset::PartitionSubset;
