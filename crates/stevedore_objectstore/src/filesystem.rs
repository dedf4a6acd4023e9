use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;

use crate::errors::{Error, Result};
use crate::{Key, ObjectStore};

#[derive(Clone, Debug, Deserialize)]
pub struct FilesystemConfig {
    pub root: PathBuf,
}

impl FilesystemConfig {
    pub async fn new_objects(&self) -> Result<Filesystem> {
        Filesystem::new(&self.root).await
    }
}

/// [`ObjectStore`] rooted at a local directory; every key maps to a file below the root.
#[derive(Clone, Debug)]
pub struct Filesystem {
    root: PathBuf,
}

fn not_found(key: &Key, e: std::io::Error) -> Error {
    if e.kind() == ErrorKind::NotFound {
        Error::NotFound(key.to_string())
    } else {
        e.into()
    }
}

impl Filesystem {
    /// Open (and create when missing) the directory at `root`.
    pub async fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Local file backing `key`.
    pub fn path(&self, key: &Key) -> PathBuf {
        self.root.join(key.as_path())
    }

    async fn ensure_parent(&self, key: &Key) -> Result<()> {
        if let Some(parent) = self.path(key).parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// Move the object at `from` to `to`, replacing anything already at `to`.
    pub async fn rename(&self, from: &Key, to: &Key) -> Result<()> {
        self.ensure_parent(to).await?;
        tokio::fs::rename(self.path(from), self.path(to))
            .await
            .map_err(|e| not_found(from, e))
    }
}

#[async_trait]
impl ObjectStore for Filesystem {
    async fn get(&self, key: &Key) -> Result<Bytes> {
        let body = tokio::fs::read(self.path(key))
            .await
            .map_err(|e| not_found(key, e))?;
        Ok(Bytes::from(body))
    }

    async fn exists(&self, key: &Key) -> Result<bool> {
        match tokio::fs::metadata(self.path(key)).await {
            Ok(m) => Ok(m.is_file()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, key: &Key, body: Bytes) -> Result<()> {
        self.ensure_parent(key).await?;
        let target = self.path(key);
        let staging = target.with_file_name(format!(
            ".{}.{}",
            key.file_name(),
            uuid::Uuid::new_v4().simple()
        ));
        tokio::fs::write(&staging, &body).await?;
        if let Err(e) = tokio::fs::rename(&staging, &target).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn delete(&self, key: &Key) -> Result<()> {
        tokio::fs::remove_file(self.path(key))
            .await
            .map_err(|e| not_found(key, e))
    }

    async fn save(&self, key: &Key, local: &Path) -> Result<()> {
        self.ensure_parent(key).await?;
        tokio::fs::copy(local, self.path(key)).await?;
        Ok(())
    }
}
