//! # Blob Reference Store
//!
//! Maps each content digest to one physical object and a live reference count. The count is
//! changed under a per-digest lock with a compare-and-swap against the record store, so
//! concurrent manifest submissions never lose an update. Collection is synchronous: the
//! decrement that brings a count to zero deletes the bytes and then the record.
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::OwnedMutexGuard;

use stevedore_core::records::{Blob, RecordStore};
use stevedore_core::{Error as CoreError, OciDigest};
use stevedore_objectstore::{Filesystem, Key, ObjectStore};

use super::errors::{Context, Error, Result};
use super::locks::KeyedLocks;

/// Attempts at a reference count swap before giving up.
const MAX_SWAP_ATTEMPTS: usize = 8;

/// Storage key of the committed bytes for `digest`.
pub fn blob_key(digest: &OciDigest) -> Result<Key> {
    Key::try_from(format!("blobs/{}/{}", digest.algorithm(), digest.encoded()).as_str())
        .context(|| format!("derive storage key for {digest}"))
}

#[derive(Clone)]
pub struct BlobStore {
    records: Arc<dyn RecordStore>,
    local: Filesystem,
    remote: Option<Arc<dyn ObjectStore>>,
    locks: Arc<KeyedLocks>,
}

impl BlobStore {
    pub fn new(
        records: Arc<dyn RecordStore>,
        local: Filesystem,
        remote: Option<Arc<dyn ObjectStore>>,
    ) -> Self {
        Self {
            records,
            local,
            remote,
            locks: Arc::new(KeyedLocks::default()),
        }
    }

    pub(crate) fn local(&self) -> &Filesystem {
        &self.local
    }

    /// Exclusive access to the record and the copies of `digest`.
    pub(crate) async fn lock(&self, digest: &OciDigest) -> OwnedMutexGuard<()> {
        self.locks.lock(&digest.to_string()).await
    }

    pub async fn get(&self, digest: &OciDigest) -> Result<Option<Blob>> {
        self.records
            .get_blob(digest)
            .await
            .context(|| format!("get blob record {digest}"))
    }

    async fn require(&self, digest: &OciDigest) -> Result<Blob> {
        self.get(digest)
            .await?
            .ok_or_else(|| CoreError::BlobUnknown(Some(digest.to_string())).into())
    }

    /// Blob record and its bytes, read from the local copy if present and the remote otherwise.
    pub async fn read(&self, digest: &OciDigest) -> Result<(Blob, Bytes)> {
        let blob = self.require(digest).await?;
        let key = blob_key(digest)?;
        match self.local.get(&key).await {
            Ok(body) => return Ok((blob, body)),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e).context(|| format!("read local copy of {digest}")),
        }
        match &self.remote {
            Some(remote) => {
                let body = remote
                    .get(&key)
                    .await
                    .context(|| format!("read remote copy of {digest}"))?;
                Ok((blob, body))
            }
            None => Err(Error::Storage {
                op: format!("read {digest}"),
                source: Box::new(stevedore_objectstore::Error::NotFound(key.to_string())),
            }),
        }
    }

    /// Register committed bytes. Leaves an existing record untouched; the digest already fixes its
    /// content.
    pub async fn record_upload(&self, digest: &OciDigest, path: &Key, size: u64) -> Result<Blob> {
        let blob = Blob {
            digest: digest.clone(),
            path: path.to_string(),
            size,
            ref_count: 0,
        };
        let inserted = self
            .records
            .insert_blob(&blob)
            .await
            .context(|| format!("insert blob record {digest}"))?;
        if inserted {
            tracing::debug!("recorded blob {digest} ({size} bytes)");
            return Ok(blob);
        }
        tracing::debug!("blob {digest} already recorded");
        self.require(digest).await
    }

    /// Move the verified bytes at `from` to the key of `digest` and record them. Runs under the
    /// digest lock so a concurrent collection of the same digest cannot remove what was just
    /// committed.
    pub(crate) async fn commit_upload(
        &self,
        digest: &OciDigest,
        from: &Key,
        size: u64,
    ) -> Result<Blob> {
        let _guard = self.lock(digest).await;
        let target = blob_key(digest)?;
        if self
            .local
            .exists(&target)
            .await
            .context(|| format!("check for {target}"))?
        {
            tracing::debug!("replacing stale object at {target}");
        }
        self.local
            .rename(from, &target)
            .await
            .context(|| format!("move {from} to {target}"))?;
        self.record_upload(digest, &target, size).await
    }

    /// Apply `f` to the reference count of `digest` as a compare-and-swap, retrying on conflict.
    /// Returns the blob as it was before the successful swap.
    async fn swap<F>(&self, digest: &OciDigest, f: F) -> Result<Blob>
    where
        F: Fn(u64) -> Result<u64>,
    {
        for _ in 0..MAX_SWAP_ATTEMPTS {
            let blob = self.require(digest).await?;
            let new = f(blob.ref_count)?;
            if self
                .records
                .swap_ref_count(digest, blob.ref_count, new)
                .await
                .context(|| format!("swap reference count of {digest}"))?
            {
                return Ok(blob);
            }
            tracing::debug!("reference count of {digest} changed underneath, retrying");
        }
        Err(Error::RefCountContention(
            digest.to_string(),
            MAX_SWAP_ATTEMPTS,
        ))
    }

    fn underflow(digest: &OciDigest) -> Error {
        CoreError::ContentInconsistency(Some(format!(
            "reference count of {digest} is already zero"
        )))
        .into()
    }

    pub async fn increment_for_tag(&self, digest: &OciDigest) -> Result<u64> {
        let _guard = self.lock(digest).await;
        let before = self.swap(digest, |c| Ok(c + 1)).await?;
        tracing::debug!("reference count of {digest} now {}", before.ref_count + 1);
        Ok(before.ref_count + 1)
    }

    /// Decrement the count, collecting the blob when it reaches zero.
    pub async fn decrement_for_tag(&self, digest: &OciDigest) -> Result<u64> {
        let _guard = self.lock(digest).await;
        let before = self
            .swap(digest, |c| c.checked_sub(1).ok_or_else(|| Self::underflow(digest)))
            .await?;
        let count = before.ref_count - 1;
        tracing::debug!("reference count of {digest} now {count}");
        if count == 0 {
            self.collect(&before).await?;
        }
        Ok(count)
    }

    /// Undo an increment without collecting, for rolling back a failed submission.
    pub async fn revert_increment(&self, digest: &OciDigest) -> Result<u64> {
        let _guard = self.lock(digest).await;
        let before = self
            .swap(digest, |c| c.checked_sub(1).ok_or_else(|| Self::underflow(digest)))
            .await?;
        Ok(before.ref_count - 1)
    }

    /// Delete an unreferenced blob.
    pub async fn delete(&self, digest: &OciDigest) -> Result<()> {
        let _guard = self.lock(digest).await;
        let blob = self.require(digest).await?;
        if blob.ref_count > 0 {
            return Err(CoreError::ContentReferenced(Some(format!(
                "{digest} is referenced by {} tag(s)",
                blob.ref_count
            )))
            .into());
        }
        self.collect(&blob).await
    }

    /// Delete the bytes of `blob` everywhere, then its record. The record survives a failed
    /// physical delete.
    async fn collect(&self, blob: &Blob) -> Result<()> {
        let digest = &blob.digest;
        let key = blob_key(digest)?;
        match self.local.delete(&key).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e).context(|| format!("delete local copy of {digest}")),
        }
        if let Some(remote) = &self.remote {
            match remote.delete(&key).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e).context(|| format!("delete remote copy of {digest}")),
            }
        }
        self.records
            .delete_blob(digest)
            .await
            .context(|| format!("delete blob record {digest}"))?;
        tracing::info!("collected blob {digest}");
        Ok(())
    }

    /// Copy the local bytes of `digest` to the remote store. Returns `false` when there is no
    /// remote or it already holds the blob.
    pub async fn push(&self, digest: &OciDigest) -> Result<bool> {
        let remote = match &self.remote {
            Some(r) => r,
            None => return Ok(false),
        };
        let _guard = self.lock(digest).await;
        let key = blob_key(digest)?;
        if remote
            .exists(&key)
            .await
            .context(|| format!("check remote copy of {digest}"))?
        {
            return Ok(false);
        }
        remote
            .save(&key, &self.local.path(&key))
            .await
            .context(|| format!("push {digest}"))?;
        tracing::debug!("pushed {digest} to remote");
        Ok(true)
    }

    /// Remove a copy made by [`BlobStore::push`] unless some tag references the blob by now.
    /// Returns whether the remote copy was deleted.
    pub async fn unpush(&self, digest: &OciDigest) -> Result<bool> {
        let remote = match &self.remote {
            Some(r) => r,
            None => return Ok(false),
        };
        let _guard = self.lock(digest).await;
        match self.get(digest).await? {
            Some(blob) if blob.ref_count == 0 => {}
            Some(blob) => {
                tracing::debug!(
                    "keeping remote copy of {digest}, referenced by {} tag(s)",
                    blob.ref_count
                );
                return Ok(false);
            }
            None => return Ok(false),
        }
        let key = blob_key(digest)?;
        match remote.delete(&key).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e).context(|| format!("remove pushed copy of {digest}")),
        }
    }

    /// Drop the local copy of a blob the remote store holds.
    pub async fn evict_local(&self, digest: &OciDigest) -> Result<()> {
        if self.remote.is_none() {
            return Ok(());
        }
        let key = blob_key(digest)?;
        match self.local.delete(&key).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e).context(|| format!("evict local copy of {digest}")),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use rstest::*;
    use stevedore_core::ErrorCode;
    use stevedore_metadata::MemoryRecords;

    use super::*;

    /// In-memory remote whose deletes or puts can be made to fail.
    #[derive(Default)]
    pub(crate) struct FlakyRemote {
        pub(crate) objects: tokio::sync::Mutex<std::collections::HashMap<String, Bytes>>,
        pub(crate) fail_delete: AtomicBool,
        pub(crate) fail_put_after: std::sync::atomic::AtomicUsize,
    }

    impl FlakyRemote {
        pub(crate) fn new() -> Self {
            Self {
                fail_put_after: std::sync::atomic::AtomicUsize::new(usize::MAX),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl ObjectStore for FlakyRemote {
        async fn get(&self, key: &Key) -> stevedore_objectstore::Result<Bytes> {
            self.objects
                .lock()
                .await
                .get(&key.to_string())
                .cloned()
                .ok_or_else(|| stevedore_objectstore::Error::NotFound(key.to_string()))
        }

        async fn exists(&self, key: &Key) -> stevedore_objectstore::Result<bool> {
            Ok(self.objects.lock().await.contains_key(&key.to_string()))
        }

        async fn put(&self, key: &Key, body: Bytes) -> stevedore_objectstore::Result<()> {
            let remaining = self.fail_put_after.load(Ordering::SeqCst);
            if remaining == 0 {
                return Err(std::io::Error::new(std::io::ErrorKind::Other, "remote full").into());
            }
            self.fail_put_after.store(remaining.saturating_sub(1), Ordering::SeqCst);
            self.objects.lock().await.insert(key.to_string(), body);
            Ok(())
        }

        async fn delete(&self, key: &Key) -> stevedore_objectstore::Result<()> {
            if self.fail_delete.load(Ordering::SeqCst) {
                return Err(std::io::Error::new(std::io::ErrorKind::Other, "remote down").into());
            }
            match self.objects.lock().await.remove(&key.to_string()) {
                Some(_) => Ok(()),
                None => Err(stevedore_objectstore::Error::NotFound(key.to_string())),
            }
        }
    }

    pub(crate) async fn committed(store: &BlobStore, content: &[u8]) -> OciDigest {
        let digest = OciDigest::from(content);
        let key = blob_key(&digest).unwrap();
        store
            .local
            .put(&key, Bytes::copy_from_slice(content))
            .await
            .unwrap();
        store
            .record_upload(&digest, &key, content.len() as u64)
            .await
            .unwrap();
        digest
    }

    async fn store(remote: Option<Arc<dyn ObjectStore>>) -> (tempfile::TempDir, BlobStore) {
        let dir = tempfile::tempdir().unwrap();
        let local = Filesystem::new(dir.path()).await.unwrap();
        let store = BlobStore::new(Arc::new(MemoryRecords::new()), local, remote);
        (dir, store)
    }

    fn code(e: Error) -> ErrorCode {
        CoreError::from(e).code()
    }

    #[rstest]
    #[case::balanced(3, 2, Some(1))]
    #[case::to_zero(2, 2, None)]
    #[case::single(1, 1, None)]
    #[tokio::test]
    async fn count_follows_increments_and_decrements(
        #[case] increments: usize,
        #[case] decrements: usize,
        #[case] expected: Option<u64>,
    ) {
        let (_dir, store) = store(None).await;
        let digest = committed(&store, b"layer").await;

        for _ in 0..increments {
            store.increment_for_tag(&digest).await.unwrap();
        }
        for _ in 0..decrements {
            store.decrement_for_tag(&digest).await.unwrap();
        }

        let blob = store.get(&digest).await.unwrap();
        assert_eq!(blob.map(|b| b.ref_count), expected);
        let on_disk = store
            .local
            .exists(&blob_key(&digest).unwrap())
            .await
            .unwrap();
        assert_eq!(on_disk, expected.is_some());
    }

    #[tokio::test]
    async fn decrement_below_zero_is_inconsistent() {
        let (_dir, store) = store(None).await;
        let digest = committed(&store, b"layer").await;

        let err = store.decrement_for_tag(&digest).await.unwrap_err();
        assert_eq!(code(err), ErrorCode::ContentInconsistency);
        assert_eq!(store.get(&digest).await.unwrap().unwrap().ref_count, 0);
    }

    #[tokio::test]
    async fn unknown_digest() {
        let (_dir, store) = store(None).await;
        let digest = OciDigest::from(&b"nothing"[..]);
        assert_eq!(
            code(store.increment_for_tag(&digest).await.unwrap_err()),
            ErrorCode::BlobUnknown
        );
        assert_eq!(
            code(store.read(&digest).await.unwrap_err()),
            ErrorCode::BlobUnknown
        );
    }

    #[tokio::test]
    async fn record_upload_keeps_existing_count() {
        let (_dir, store) = store(None).await;
        let digest = committed(&store, b"layer").await;
        store.increment_for_tag(&digest).await.unwrap();

        let key = blob_key(&digest).unwrap();
        let blob = store.record_upload(&digest, &key, 5).await.unwrap();
        assert_eq!(blob.ref_count, 1);
    }

    #[tokio::test]
    async fn revert_does_not_collect() {
        let (_dir, store) = store(None).await;
        let digest = committed(&store, b"fresh").await;
        store.increment_for_tag(&digest).await.unwrap();
        assert_eq!(store.revert_increment(&digest).await.unwrap(), 0);

        let (blob, body) = store.read(&digest).await.unwrap();
        assert_eq!(blob.ref_count, 0);
        assert_eq!(&body[..], b"fresh");
    }

    #[tokio::test]
    async fn failed_physical_delete_keeps_record() {
        let remote = Arc::new(FlakyRemote::new());
        let (_dir, store) = store(Some(remote.clone())).await;
        let digest = committed(&store, b"layer").await;
        store.increment_for_tag(&digest).await.unwrap();
        assert!(store.push(&digest).await.unwrap());

        remote.fail_delete.store(true, Ordering::SeqCst);
        let err = store.decrement_for_tag(&digest).await.unwrap_err();
        assert!(matches!(err, Error::Storage { .. }));
        assert_eq!(store.get(&digest).await.unwrap().unwrap().ref_count, 0);

        remote.fail_delete.store(false, Ordering::SeqCst);
        store.delete(&digest).await.unwrap();
        assert!(store.get(&digest).await.unwrap().is_none());
        assert!(remote.objects.lock().await.is_empty());
    }

    #[tokio::test]
    async fn delete_referenced_blob_is_refused() {
        let (_dir, store) = store(None).await;
        let digest = committed(&store, b"layer").await;
        store.increment_for_tag(&digest).await.unwrap();

        assert_eq!(
            code(store.delete(&digest).await.unwrap_err()),
            ErrorCode::ContentReferenced
        );
        store.decrement_for_tag(&digest).await.unwrap();
        assert!(store.get(&digest).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn read_falls_back_to_remote() {
        let remote = Arc::new(FlakyRemote::new());
        let (_dir, store) = store(Some(remote.clone())).await;
        let digest = committed(&store, b"far away").await;

        assert!(store.push(&digest).await.unwrap());
        assert!(!store.push(&digest).await.unwrap());
        store.evict_local(&digest).await.unwrap();

        let (_, body) = store.read(&digest).await.unwrap();
        assert_eq!(&body[..], b"far away");
    }

    #[tokio::test]
    async fn unpush_keeps_referenced_copies() {
        let remote = Arc::new(FlakyRemote::new());
        let (_dir, store) = store(Some(remote.clone())).await;
        let digest = committed(&store, b"shared").await;

        // one submission pushed it, another took a reference and dropped the local copy
        assert!(store.push(&digest).await.unwrap());
        store.increment_for_tag(&digest).await.unwrap();
        store.evict_local(&digest).await.unwrap();

        assert!(!store.unpush(&digest).await.unwrap());
        let (_, body) = store.read(&digest).await.unwrap();
        assert_eq!(&body[..], b"shared");

        store.revert_increment(&digest).await.unwrap();
        assert!(store.unpush(&digest).await.unwrap());
        assert!(remote.objects.lock().await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn commit_waits_for_collection() {
        let (_dir, store) = store(None).await;
        let digest = OciDigest::from(&b"layer"[..]);
        let staged = Key::try_from("uploads/library/ubuntu/staged").unwrap();
        store
            .local
            .put(&staged, Bytes::from_static(b"layer"))
            .await
            .unwrap();

        let guard = store.lock(&digest).await;
        let committing = {
            let store = store.clone();
            let digest = digest.clone();
            let staged = staged.clone();
            tokio::spawn(async move { store.commit_upload(&digest, &staged, 5).await.unwrap() })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!committing.is_finished());
        assert!(store.get(&digest).await.unwrap().is_none());
        assert!(store.local.exists(&staged).await.unwrap());

        drop(guard);
        let blob = committing.await.unwrap();
        assert_eq!(blob.size, 5);
        let (_, body) = store.read(&digest).await.unwrap();
        assert_eq!(&body[..], b"layer");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_increments_are_not_lost() {
        let (_dir, store) = store(None).await;
        let digest = committed(&store, b"popular").await;

        let handles: Vec<_> = (0..50)
            .map(|_| {
                let store = store.clone();
                let digest = digest.clone();
                tokio::spawn(async move { store.increment_for_tag(&digest).await.unwrap() })
            })
            .collect();
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(store.get(&digest).await.unwrap().unwrap().ref_count, 50);

        let handles: Vec<_> = (0..49)
            .map(|_| {
                let store = store.clone();
                let digest = digest.clone();
                tokio::spawn(async move { store.decrement_for_tag(&digest).await.unwrap() })
            })
            .collect();
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(store.get(&digest).await.unwrap().unwrap().ref_count, 1);
    }
}
