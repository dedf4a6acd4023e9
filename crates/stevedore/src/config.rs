use std::net::SocketAddr;

use serde::Deserialize;

use stevedore_metadata::MetadataConfig;
use stevedore_registry::StorageConfig;

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 13030))
}

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    pub metadata: MetadataConfig,
    pub storage: StorageConfig,
}
