use std::path::PathBuf;

use serde::Deserialize;

fn default_cachable() -> bool {
    true
}

/// Where blob bytes live.
///
/// `root` is the local staging directory holding upload sessions and committed blobs. With a
/// `remote` configured, blobs referenced by a manifest are pushed there; `cachable: false` drops
/// the local copy after a successful push. A volatile remote (chunks kept in memory) combined
/// with `cachable: false` keeps no pushed blob across a restart.
#[derive(Clone, Debug, Deserialize)]
pub struct StorageConfig {
    pub root: PathBuf,
    #[serde(default = "default_cachable")]
    pub cachable: bool,
    #[serde(default)]
    pub remote: Option<stevedore_objectstore::Config>,
}

impl StorageConfig {
    /// Whether pushed blobs only survive as long as the process does.
    pub fn is_volatile(&self) -> bool {
        !self.cachable && self.remote.as_ref().map_or(false, |r| r.is_volatile())
    }
}
