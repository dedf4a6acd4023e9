use std::sync::Arc;

use stevedore_core::records::RecordStore;
use stevedore_core::RepositoryName;
use stevedore_objectstore::{Filesystem, ObjectStore};

use super::blobs::BlobStore;
use super::config::StorageConfig;
use super::errors::{Context, Result};
use super::locks::KeyedLocks;
use super::manifests::ManifestStore;
use super::uploads::{Sessions, UploadSessionStore};

/// Shared state behind every [`RepositoryStore`]: records, blob storage, in-flight upload
/// sessions and the tag/repository locks.
#[derive(Clone)]
pub struct Registry {
    records: Arc<dyn RecordStore>,
    blobs: BlobStore,
    sessions: Arc<Sessions>,
    locks: Arc<KeyedLocks>,
    cachable: bool,
}

impl Registry {
    pub async fn new(records: Arc<dyn RecordStore>, config: &StorageConfig) -> Result<Self> {
        let local = Filesystem::new(&config.root)
            .await
            .context(|| format!("open staging directory {}", config.root.display()))?;
        let remote = match &config.remote {
            Some(remote) => Some(
                remote
                    .new_objects()
                    .await
                    .context(|| String::from("open remote object store"))?,
            ),
            None => None,
        };
        tracing::info!(
            "blob staging at {}, remote {}",
            local.root().display(),
            if remote.is_some() { "configured" } else { "disabled" }
        );
        if config.is_volatile() {
            tracing::warn!("volatile remote without local copies, pushed blobs are lost on restart");
        }
        Ok(Self::from_parts(records, local, remote, config.cachable))
    }

    pub fn from_parts(
        records: Arc<dyn RecordStore>,
        local: Filesystem,
        remote: Option<Arc<dyn ObjectStore>>,
        cachable: bool,
    ) -> Self {
        Self {
            blobs: BlobStore::new(records.clone(), local, remote),
            records,
            sessions: Arc::new(Sessions::default()),
            locks: Arc::new(KeyedLocks::default()),
            cachable,
        }
    }

    pub fn repository(&self, name: RepositoryName) -> RepositoryStore {
        RepositoryStore {
            name,
            registry: self.clone(),
        }
    }

    /// Names of every repository holding at least one tag, sorted.
    pub async fn catalog(&self) -> Result<Vec<RepositoryName>> {
        self.records
            .list_repositories()
            .await
            .context(|| String::from("list repositories"))
    }
}

/// Blob, manifest and upload session access scoped to one repository.
#[derive(Clone)]
pub struct RepositoryStore {
    name: RepositoryName,
    registry: Registry,
}

impl RepositoryStore {
    pub fn name(&self) -> &RepositoryName {
        &self.name
    }

    /// Blobs are shared by every repository; the name only scopes manifests and uploads.
    pub fn get_blob_store(&self) -> BlobStore {
        self.registry.blobs.clone()
    }

    pub fn get_manifest_store(&self) -> ManifestStore {
        ManifestStore::new(
            self.name.clone(),
            self.registry.records.clone(),
            self.registry.blobs.clone(),
            self.registry.locks.clone(),
            self.registry.cachable,
        )
    }

    pub fn get_upload_session_store(&self) -> UploadSessionStore {
        UploadSessionStore::new(
            self.name.clone(),
            self.registry.sessions.clone(),
            self.registry.blobs.clone(),
        )
    }
}
