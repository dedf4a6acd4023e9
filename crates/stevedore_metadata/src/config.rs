use std::sync::Arc;

use serde::Deserialize;

use stevedore_core::records::RecordStore;

use super::errors::Result;
use super::memory::MemoryRecords;
use super::postgres::PostgresConfig;

#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type")]
pub enum MetadataConfig {
    Memory,
    Postgres(PostgresConfig),
}

impl MetadataConfig {
    pub async fn new_records(&self) -> Result<Arc<dyn RecordStore>> {
        match self {
            Self::Memory => {
                tracing::warn!("using in-memory metadata, records are lost on shutdown");
                Ok(Arc::new(MemoryRecords::new()))
            }
            Self::Postgres(cfg) => Ok(Arc::new(cfg.new_records().await?)),
        }
    }
}
