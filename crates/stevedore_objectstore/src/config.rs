use std::sync::Arc;

use serde::Deserialize;

use super::chunked::{ChunkedDriver, MemoryChunkBackend, DEFAULT_CHUNK_SIZE};
use super::filesystem::FilesystemConfig;
use super::s3::S3Config;
use super::ObjectStore;
use super::Result;

#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type")]
pub enum Config {
    Chunked(ChunkedConfig),
    Filesystem(FilesystemConfig),
    S3(S3Config),
}

impl Config {
    pub async fn new_objects(&self) -> Result<Arc<dyn ObjectStore>> {
        match self {
            Self::Chunked(cfg) => Ok(Arc::new(cfg.new_objects()?)),
            Self::Filesystem(cfg) => Ok(Arc::new(cfg.new_objects().await?)),
            Self::S3(cfg) => Ok(Arc::new(cfg.new_objects().await?)),
        }
    }

    /// Whether stored objects are lost when the process exits.
    pub fn is_volatile(&self) -> bool {
        matches!(
            self,
            Self::Chunked(ChunkedConfig {
                backend: ChunkBackendConfig::Memory,
                ..
            })
        )
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ChunkBackendConfig {
    /// Chunks live in process memory and are gone after a restart.
    Memory,
}

fn default_chunk_size() -> u64 {
    DEFAULT_CHUNK_SIZE
}

#[derive(Clone, Debug, Deserialize)]
pub struct ChunkedConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    pub backend: ChunkBackendConfig,
}

impl ChunkedConfig {
    pub fn new_objects(&self) -> Result<ChunkedDriver<MemoryChunkBackend>> {
        match self.backend {
            ChunkBackendConfig::Memory => {
                ChunkedDriver::new(MemoryChunkBackend::new(), self.chunk_size)
            }
        }
    }
}
