//! Record store implementations for the ports defined in [`stevedore_core::records`].
mod config;
pub use config::MetadataConfig;
mod errors;
pub use errors::{Error, Result};
mod memory;
pub use memory::MemoryRecords;
mod postgres;
pub use postgres::{PostgresConfig, PostgresRecords};
