use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::RwLock;

use stevedore_core::records::{
    Blob, BlobRecords, Repository, RepositoryRecords, Tag, TagRecords,
};
use stevedore_core::{OciDigest, RepositoryName, Result};

use super::Error;

/// Process-local record store. Every port is served from maps guarded by their own lock, so the
/// compare-and-swap on reference counts is atomic with respect to other callers in the process.
#[derive(Debug, Default)]
pub struct MemoryRecords {
    blobs: RwLock<HashMap<OciDigest, Blob>>,
    tags: RwLock<BTreeMap<(RepositoryName, String), Tag>>,
    repositories: RwLock<BTreeMap<RepositoryName, Repository>>,
}

impl MemoryRecords {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobRecords for MemoryRecords {
    async fn get_blob(&self, digest: &OciDigest) -> Result<Option<Blob>> {
        Ok(self.blobs.read().await.get(digest).cloned())
    }

    async fn insert_blob(&self, blob: &Blob) -> Result<bool> {
        let mut blobs = self.blobs.write().await;
        if blobs.contains_key(&blob.digest) {
            return Ok(false);
        }
        blobs.insert(blob.digest.clone(), blob.clone());
        Ok(true)
    }

    async fn swap_ref_count(&self, digest: &OciDigest, expected: u64, new: u64) -> Result<bool> {
        let mut blobs = self.blobs.write().await;
        match blobs.get_mut(digest) {
            Some(blob) if blob.ref_count == expected => {
                blob.ref_count = new;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_blob(&self, digest: &OciDigest) -> Result<()> {
        self.blobs.write().await.remove(digest);
        Ok(())
    }
}

#[async_trait]
impl TagRecords for MemoryRecords {
    async fn get_tag(&self, name: &RepositoryName, tag: &str) -> Result<Option<Tag>> {
        Ok(self
            .tags
            .read()
            .await
            .get(&(name.clone(), tag.to_string()))
            .cloned())
    }

    async fn get_tags_by_reference(
        &self,
        name: &RepositoryName,
        reference: &str,
    ) -> Result<Vec<Tag>> {
        Ok(self
            .tags
            .read()
            .await
            .values()
            .filter(|t| &t.name == name && t.reference == reference)
            .cloned()
            .collect())
    }

    async fn insert_tag(&self, tag: &Tag) -> Result<()> {
        let mut tags = self.tags.write().await;
        let key = (tag.name.clone(), tag.tag.clone());
        if tags.contains_key(&key) {
            return Err(Error::Conflict(format!("tag {}:{}", tag.name, tag.tag)).into());
        }
        tags.insert(key, tag.clone());
        Ok(())
    }

    async fn update_tag(&self, tag: &Tag) -> Result<()> {
        self.tags
            .write()
            .await
            .insert((tag.name.clone(), tag.tag.clone()), tag.clone());
        Ok(())
    }

    async fn delete_tag(&self, name: &RepositoryName, tag: &str) -> Result<()> {
        self.tags
            .write()
            .await
            .remove(&(name.clone(), tag.to_string()));
        Ok(())
    }
}

#[async_trait]
impl RepositoryRecords for MemoryRecords {
    async fn get_repository(&self, name: &RepositoryName) -> Result<Option<Repository>> {
        Ok(self.repositories.read().await.get(name).cloned())
    }

    async fn insert_repository(&self, repository: &Repository) -> Result<()> {
        let mut repositories = self.repositories.write().await;
        if repositories.contains_key(&repository.name) {
            return Err(Error::Conflict(format!("repository {}", repository.name)).into());
        }
        repositories.insert(repository.name.clone(), repository.clone());
        Ok(())
    }

    async fn update_repository(&self, repository: &Repository) -> Result<()> {
        self.repositories
            .write()
            .await
            .insert(repository.name.clone(), repository.clone());
        Ok(())
    }

    async fn delete_repository(&self, name: &RepositoryName) -> Result<()> {
        self.repositories.write().await.remove(name);
        Ok(())
    }

    async fn list_repositories(&self) -> Result<Vec<RepositoryName>> {
        Ok(self.repositories.read().await.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;

    use super::*;

    fn blob(content: &[u8], ref_count: u64) -> Blob {
        let digest = OciDigest::from(content);
        Blob {
            path: format!("blobs/{}/{}", digest.algorithm(), digest.encoded()),
            digest,
            size: content.len() as u64,
            ref_count,
        }
    }

    fn tag(name: &RepositoryName, tag: &str, manifest: &[u8]) -> Tag {
        let digest = OciDigest::from(manifest);
        Tag {
            name: name.clone(),
            tag: tag.to_string(),
            image_id: "schemaV2".to_string(),
            manifest: String::from_utf8_lossy(manifest).into_owned(),
            schema: 2,
            reference: digest.to_string(),
            digest,
            memo: String::new(),
            created: Utc::now(),
            updated: Utc::now(),
        }
    }

    #[tokio::test]
    async fn insert_blob_only_once() {
        let records = MemoryRecords::new();
        let b = blob(b"layer", 0);
        assert!(records.insert_blob(&b).await.unwrap());
        assert!(!records.insert_blob(&blob(b"layer", 7)).await.unwrap());
        assert_eq!(records.get_blob(&b.digest).await.unwrap().unwrap().ref_count, 0);
    }

    #[tokio::test]
    async fn swap_ref_count_compares() {
        let records = MemoryRecords::new();
        let b = blob(b"layer", 0);
        records.insert_blob(&b).await.unwrap();

        assert!(records.swap_ref_count(&b.digest, 0, 1).await.unwrap());
        assert!(!records.swap_ref_count(&b.digest, 0, 1).await.unwrap());
        assert!(records.swap_ref_count(&b.digest, 1, 2).await.unwrap());
        assert!(!records
            .swap_ref_count(&OciDigest::from(&b"other"[..]), 0, 1)
            .await
            .unwrap());

        records.delete_blob(&b.digest).await.unwrap();
        assert!(records.get_blob(&b.digest).await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_swaps_do_not_lose_updates() {
        let records = Arc::new(MemoryRecords::new());
        let b = blob(b"shared", 0);
        records.insert_blob(&b).await.unwrap();

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let records = records.clone();
                let digest = b.digest.clone();
                tokio::spawn(async move {
                    loop {
                        let current = records.get_blob(&digest).await.unwrap().unwrap().ref_count;
                        if records
                            .swap_ref_count(&digest, current, current + 1)
                            .await
                            .unwrap()
                        {
                            break;
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(records.get_blob(&b.digest).await.unwrap().unwrap().ref_count, 32);
    }

    #[tokio::test]
    async fn tags_by_reference() {
        let records = MemoryRecords::new();
        let ubuntu = RepositoryName::new("library", "ubuntu").unwrap();
        let debian = RepositoryName::new("library", "debian").unwrap();

        records.insert_tag(&tag(&ubuntu, "latest", b"m1")).await.unwrap();
        records.insert_tag(&tag(&ubuntu, "22.04", b"m1")).await.unwrap();
        records.insert_tag(&tag(&ubuntu, "20.04", b"m2")).await.unwrap();
        records.insert_tag(&tag(&debian, "latest", b"m1")).await.unwrap();

        let reference = OciDigest::from(&b"m1"[..]).to_string();
        let mut found: Vec<String> = records
            .get_tags_by_reference(&ubuntu, &reference)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.tag)
            .collect();
        found.sort();
        assert_eq!(found, vec!["22.04", "latest"]);

        records.delete_tag(&ubuntu, "latest").await.unwrap();
        assert!(records.get_tag(&ubuntu, "latest").await.unwrap().is_none());
        assert!(records.get_tag(&debian, "latest").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn inserts_do_not_overwrite() {
        let records = MemoryRecords::new();
        let ubuntu = RepositoryName::new("library", "ubuntu").unwrap();

        records.insert_tag(&tag(&ubuntu, "latest", b"m1")).await.unwrap();
        let err = records
            .insert_tag(&tag(&ubuntu, "latest", b"m2"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already exists"), "{err}");
        let stored = records.get_tag(&ubuntu, "latest").await.unwrap().unwrap();
        assert_eq!(stored.digest, OciDigest::from(&b"m1"[..]));

        records.update_tag(&tag(&ubuntu, "latest", b"m2")).await.unwrap();
        let stored = records.get_tag(&ubuntu, "latest").await.unwrap().unwrap();
        assert_eq!(stored.digest, OciDigest::from(&b"m2"[..]));

        let now = Utc::now();
        let repository = Repository {
            name: ubuntu.clone(),
            tags: vec!["latest".to_string()],
            images: vec![],
            agent: "first".to_string(),
            api_version: "v2".to_string(),
            created: now,
            updated: now,
        };
        records.insert_repository(&repository).await.unwrap();
        let second = Repository {
            agent: "second".to_string(),
            ..repository.clone()
        };
        assert!(records.insert_repository(&second).await.is_err());
        let stored = records.get_repository(&ubuntu).await.unwrap().unwrap();
        assert_eq!(stored.agent, "first");
    }

    #[tokio::test]
    async fn repositories_list_sorted() {
        let records = MemoryRecords::new();
        for repo in ["zeta", "alpha", "mid"] {
            let now = Utc::now();
            records
                .insert_repository(&Repository {
                    name: RepositoryName::new("library", repo).unwrap(),
                    tags: vec!["latest".to_string()],
                    images: vec![],
                    agent: String::new(),
                    api_version: "v2".to_string(),
                    created: now,
                    updated: now,
                })
                .await
                .unwrap();
        }
        let names: Vec<String> = records
            .list_repositories()
            .await
            .unwrap()
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(names, vec!["library/alpha", "library/mid", "library/zeta"]);

        records
            .delete_repository(&RepositoryName::new("library", "mid").unwrap())
            .await
            .unwrap();
        assert_eq!(records.list_repositories().await.unwrap().len(), 2);
    }
}
