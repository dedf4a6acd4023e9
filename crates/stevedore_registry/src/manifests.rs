//! # Tag/Repository Index
//!
//! Manifest submission and deletion keep Tag and Repository records consistent with blob
//! reference counts. Every tag holds exactly one reference on each distinct digest of its
//! manifest. Work on a tag is serialized by a per-tag lock and repository record updates by a
//! per-repository lock; blob locks are always taken last.
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;

use stevedore_core::records::{RecordStore, Repository, Tag, API_VERSION};
use stevedore_core::{
    validate_tag, Error as CoreError, ManifestRef, ManifestSpec, OciDigest, RepositoryName,
};

use super::blobs::BlobStore;
use super::errors::{Context, Error, Result};
use super::locks::KeyedLocks;

/// Outcome of a manifest submission.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PutManifest {
    pub digest: OciDigest,
    pub schema: u8,
}

#[derive(Clone)]
pub struct ManifestStore {
    name: RepositoryName,
    records: Arc<dyn RecordStore>,
    blobs: BlobStore,
    locks: Arc<KeyedLocks>,
    cachable: bool,
}

impl ManifestStore {
    pub(crate) fn new(
        name: RepositoryName,
        records: Arc<dyn RecordStore>,
        blobs: BlobStore,
        locks: Arc<KeyedLocks>,
        cachable: bool,
    ) -> Self {
        Self {
            name,
            records,
            blobs,
            locks,
            cachable,
        }
    }

    fn tag_lock_key(&self, tag: &str) -> String {
        format!("tag:{}:{}", self.name, tag)
    }

    fn repository_lock_key(&self) -> String {
        format!("repository:{}", self.name)
    }

    /// Store `body` under `tag`. `agent` is recorded on the repository when it is created.
    pub async fn put(&self, tag: &str, body: Bytes, agent: &str) -> Result<PutManifest> {
        validate_tag(tag)?;
        let spec = ManifestSpec::try_from(&body[..])?;
        let manifest = String::from_utf8(body.to_vec())
            .map_err(|e| CoreError::ManifestInvalid(Some(e.to_string())))?;
        let digests = spec.distinct_digests();
        for digest in &digests {
            if self.blobs.get(digest).await?.is_none() {
                return Err(CoreError::ManifestBlobUnknown(Some(digest.to_string())).into());
            }
        }
        let digest = OciDigest::from(&body[..]);

        let _guard = self.locks.lock(&self.tag_lock_key(tag)).await;
        let existing = self
            .records
            .get_tag(&self.name, tag)
            .await
            .context(|| format!("get tag {}:{tag}", self.name))?;

        let (increments, decrements) = match &existing {
            Some(old) if old.digest == digest => {
                tracing::debug!("{}:{tag} already points at {digest}", self.name);
                (Vec::new(), Vec::new())
            }
            Some(old) => (
                digests.clone(),
                ManifestSpec::try_from(old.manifest.as_bytes())?.distinct_digests(),
            ),
            None => (digests.clone(), Vec::new()),
        };

        let mut incremented = Vec::with_capacity(increments.len());
        for d in &increments {
            if let Err(e) = self.blobs.increment_for_tag(d).await {
                self.rollback(&[], &incremented).await;
                return Err(e);
            }
            incremented.push(d.clone());
        }

        let mut pushed = Vec::new();
        for d in &digests {
            match self.blobs.push(d).await {
                Ok(true) => pushed.push(d.clone()),
                Ok(false) => {}
                Err(e) => {
                    self.rollback(&pushed, &incremented).await;
                    return Err(e);
                }
            }
        }

        let now = Utc::now();
        let record = Tag {
            name: self.name.clone(),
            tag: tag.to_string(),
            image_id: spec.image_id(),
            manifest,
            schema: spec.schema_version(),
            digest: digest.clone(),
            memo: existing.as_ref().map(|t| t.memo.clone()).unwrap_or_default(),
            reference: digest.to_string(),
            created: existing.as_ref().map(|t| t.created).unwrap_or(now),
            updated: now,
        };
        let images: Vec<String> = spec.images().into_iter().map(|i| i.id).collect();
        if let Err(e) = self.store(&record, existing.is_some(), &images, agent).await {
            self.rollback(&pushed, &incremented).await;
            return Err(e);
        }

        let mut first_error = None;
        for d in &decrements {
            if let Err(e) = self.blobs.decrement_for_tag(d).await {
                tracing::warn!("failed to release {d} from {}:{tag}: {e}", self.name);
                first_error.get_or_insert(e);
            }
        }

        if !self.cachable {
            for d in &digests {
                if let Err(e) = self.blobs.evict_local(d).await {
                    tracing::warn!("failed to evict local copy of {d}: {e}");
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }
        tracing::info!("stored {}:{tag} as {digest}", self.name);
        Ok(PutManifest {
            digest,
            schema: spec.schema_version(),
        })
    }

    /// Write the repository record, then the tag record. The repository record is restored if
    /// the tag cannot be written, so a failed submission leaves neither behind.
    async fn store(&self, tag: &Tag, exists: bool, images: &[String], agent: &str) -> Result<()> {
        let _guard = self.locks.lock(&self.repository_lock_key()).await;
        let previous = self
            .records
            .get_repository(&self.name)
            .await
            .context(|| format!("get repository {}", self.name))?;
        match &previous {
            Some(previous) => {
                let mut repository = previous.clone();
                if !repository.tags.contains(&tag.tag) {
                    repository.tags.push(tag.tag.clone());
                }
                for image in images {
                    if !repository.images.contains(image) {
                        repository.images.push(image.clone());
                    }
                }
                repository.updated = tag.updated;
                self.records.update_repository(&repository).await
            }
            None => {
                let repository = Repository {
                    name: self.name.clone(),
                    tags: vec![tag.tag.clone()],
                    images: images.to_vec(),
                    agent: agent.to_string(),
                    api_version: API_VERSION.to_string(),
                    created: tag.updated,
                    updated: tag.updated,
                };
                self.records.insert_repository(&repository).await
            }
        }
        .context(|| format!("write repository {}", self.name))?;

        let written = if exists {
            self.records.update_tag(tag).await
        } else {
            self.records.insert_tag(tag).await
        }
        .context(|| format!("write tag {}:{}", self.name, tag.tag));
        if written.is_err() {
            let restored = match &previous {
                Some(previous) => self.records.update_repository(previous).await,
                None => self.records.delete_repository(&self.name).await,
            };
            if let Err(e) = restored {
                tracing::warn!("rollback: failed to restore repository {}: {e}", self.name);
            }
        }
        written
    }

    /// Undo the side effects of a failed submission. Failures are logged; the submission error is
    /// what the caller reports.
    async fn rollback(&self, pushed: &[OciDigest], incremented: &[OciDigest]) {
        for d in incremented {
            if let Err(e) = self.blobs.revert_increment(d).await {
                tracing::warn!("rollback: failed to revert increment of {d}: {e}");
            }
        }
        // copies another submission has since taken a reference on stay in place
        for d in pushed {
            if let Err(e) = self.blobs.unpush(d).await {
                tracing::warn!("rollback: failed to remove pushed copy of {d}: {e}");
            }
        }
    }

    /// The tag record `reference` resolves to.
    pub async fn get(&self, reference: &ManifestRef) -> Result<Tag> {
        let found = match reference {
            ManifestRef::Tag(tag) => self
                .records
                .get_tag(&self.name, tag)
                .await
                .context(|| format!("get tag {}:{tag}", self.name))?,
            ManifestRef::Digest(digest) => self
                .records
                .get_tags_by_reference(&self.name, &digest.to_string())
                .await
                .context(|| format!("get tags of {}@{digest}", self.name))?
                .into_iter()
                .next(),
        };
        found.ok_or_else(|| {
            CoreError::ManifestUnknown(Some(format!("{}:{reference}", self.name))).into()
        })
    }

    /// Remove the tag `reference` names, or every tag pointing at the digest it names, then
    /// release their blob references.
    pub async fn delete(&self, reference: &ManifestRef) -> Result<()> {
        let tags: Vec<String> = match reference {
            ManifestRef::Tag(tag) => vec![tag.clone()],
            ManifestRef::Digest(_) => self
                .get_tags_by_reference(reference)
                .await?
                .into_iter()
                .map(|t| t.tag)
                .collect(),
        };

        let mut first_error: Option<Error> = None;
        let mut removed = Vec::new();
        for tag in &tags {
            match self.remove_tag(tag, reference).await {
                Ok(Some(record)) => removed.push(record),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!("failed to delete {}:{tag}: {e}", self.name);
                    first_error = Some(e);
                    break;
                }
            }
        }
        if removed.is_empty() {
            return Err(first_error.unwrap_or_else(|| {
                CoreError::ManifestUnknown(Some(format!("{}:{reference}", self.name))).into()
            }));
        }

        // removed tags no longer hold their references, whatever happens to the repository record
        if let Err(e) = self.prune(&removed).await {
            tracing::warn!("failed to prune repository {}: {e}", self.name);
            first_error.get_or_insert(e);
        }

        for record in &removed {
            let digests = match ManifestSpec::try_from(record.manifest.as_bytes()) {
                Ok(spec) => spec.distinct_digests(),
                Err(e) => {
                    tracing::warn!(
                        "stored manifest of {}:{} is unreadable: {e}",
                        self.name,
                        record.tag
                    );
                    first_error.get_or_insert(e.into());
                    continue;
                }
            };
            for d in &digests {
                if let Err(e) = self.blobs.decrement_for_tag(d).await {
                    tracing::warn!("failed to release {d} from {}:{}: {e}", self.name, record.tag);
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Delete the record of `tag` if `reference` still names it. Returns the removed record.
    async fn remove_tag(&self, tag: &str, reference: &ManifestRef) -> Result<Option<Tag>> {
        let _guard = self.locks.lock(&self.tag_lock_key(tag)).await;
        let record = match self
            .records
            .get_tag(&self.name, tag)
            .await
            .context(|| format!("get tag {}:{tag}", self.name))?
        {
            Some(t) => t,
            None => return Ok(None),
        };
        if let ManifestRef::Digest(d) = reference {
            if &record.digest != d {
                return Ok(None);
            }
        }
        self.records
            .delete_tag(&self.name, tag)
            .await
            .context(|| format!("delete tag {}:{tag}", self.name))?;
        tracing::info!("deleted {}:{tag}", self.name);
        Ok(Some(record))
    }

    async fn get_tags_by_reference(&self, reference: &ManifestRef) -> Result<Vec<Tag>> {
        self.records
            .get_tags_by_reference(&self.name, &reference.to_string())
            .await
            .context(|| format!("get tags of {}@{reference}", self.name))
    }

    /// Drop removed tags from the repository record, deleting the record once no tag is left.
    async fn prune(&self, removed: &[Tag]) -> Result<()> {
        let _guard = self.locks.lock(&self.repository_lock_key()).await;
        let mut repository = match self
            .records
            .get_repository(&self.name)
            .await
            .context(|| format!("get repository {}", self.name))?
        {
            Some(r) => r,
            None => return Ok(()),
        };
        repository
            .tags
            .retain(|t| !removed.iter().any(|r| &r.tag == t));
        if repository.tags.is_empty() {
            tracing::info!("repository {} has no tags left, deleting it", self.name);
            self.records.delete_repository(&self.name).await
        } else {
            repository.updated = Utc::now();
            self.records.update_repository(&repository).await
        }
        .context(|| format!("prune repository {}", self.name))
    }

    /// Tags of the repository in the order they were first pushed.
    pub async fn tags(&self) -> Result<Vec<String>> {
        let repository = self
            .records
            .get_repository(&self.name)
            .await
            .context(|| format!("get repository {}", self.name))?;
        match repository {
            Some(r) if !r.tags.is_empty() => Ok(r.tags),
            _ => Err(CoreError::NameUnknown(Some(self.name.to_string())).into()),
        }
    }

    /// The repository record, if any tag was ever pushed and not all were deleted.
    pub async fn repository(&self) -> Result<Option<Repository>> {
        self.records
            .get_repository(&self.name)
            .await
            .context(|| format!("get repository {}", self.name))
    }
}
