//! # Upload Session Manager
//!
//! Session lifecycle: opened with an empty temporary object, accumulating contiguous ranges, then
//! committed under a claimed digest or aborted. Each session is guarded by its own mutex, so two
//! requests for the same token are applied one after the other and sessions never share buffers.
use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use stevedore_core::records::Blob;
use stevedore_core::{Error as CoreError, OciDigest, RepositoryName};
use stevedore_objectstore::{Key, ObjectStore};

use super::blobs::BlobStore;
use super::errors::{Context, Result};

#[derive(Debug)]
struct Session {
    name: RepositoryName,
    key: Key,
    size: u64,
    closed: bool,
}

/// In-flight sessions of every repository.
#[derive(Default)]
pub(crate) struct Sessions {
    sessions: RwLock<HashMap<Uuid, Arc<Mutex<Session>>>>,
}

/// Upload sessions of a single repository.
#[derive(Clone)]
pub struct UploadSessionStore {
    name: RepositoryName,
    sessions: Arc<Sessions>,
    blobs: BlobStore,
}

fn unknown(uuid: &Uuid) -> CoreError {
    CoreError::BlobUploadUnknown(Some(uuid.to_string()))
}

fn check_range(uuid: &Uuid, range: &RangeInclusive<u64>, size: u64, len: u64) -> Result<()> {
    let (start, end) = (*range.start(), *range.end());
    let message = if end < start {
        format!("range {start}-{end} ends before it starts")
    } else if start != size {
        format!("range starts at {start}, upload {uuid} holds {size} bytes")
    } else if end - start + 1 != len {
        format!("range {start}-{end} does not cover the {len} byte chunk")
    } else {
        return Ok(());
    };
    Err(CoreError::RangeInvalid(Some(message)).into())
}

impl UploadSessionStore {
    pub(crate) fn new(name: RepositoryName, sessions: Arc<Sessions>, blobs: BlobStore) -> Self {
        Self {
            name,
            sessions,
            blobs,
        }
    }

    async fn session(&self, uuid: &Uuid) -> Result<Arc<Mutex<Session>>> {
        let session = self
            .sessions
            .sessions
            .read()
            .await
            .get(uuid)
            .cloned()
            .ok_or_else(|| unknown(uuid))?;
        if session.lock().await.name != self.name {
            return Err(unknown(uuid).into());
        }
        Ok(session)
    }

    async fn forget(&self, uuid: &Uuid) {
        self.sessions.sessions.write().await.remove(uuid);
    }

    /// Start a session. Returns its token; the accumulated length is zero.
    pub async fn open(&self) -> Result<Uuid> {
        let uuid = Uuid::new_v4();
        let key = Key::try_from(
            format!(
                "uploads/{}/{}/{}",
                self.name.namespace(),
                self.name.repository(),
                uuid
            )
            .as_str(),
        )
        .context(|| format!("derive upload key for {uuid}"))?;

        self.blobs
            .local()
            .put(&key, Bytes::new())
            .await
            .context(|| format!("create upload object {key}"))?;

        let session = Session {
            name: self.name.clone(),
            key,
            size: 0,
            closed: false,
        };
        self.sessions
            .sessions
            .write()
            .await
            .insert(uuid, Arc::new(Mutex::new(session)));
        tracing::debug!("opened upload {uuid} for {}", self.name);
        Ok(uuid)
    }

    async fn append_locked(&self, uuid: &Uuid, session: &mut Session, bytes: &[u8]) -> Result<u64> {
        let local = self.blobs.local();
        let previous = local
            .get(&session.key)
            .await
            .context(|| format!("read upload object for {uuid}"))?;
        let mut content = BytesMut::with_capacity(previous.len() + bytes.len());
        content.extend_from_slice(&previous);
        content.extend_from_slice(bytes);
        let size = content.len() as u64;
        local
            .put(&session.key, content.freeze())
            .await
            .context(|| format!("rewrite upload object for {uuid}"))?;
        session.size = size;
        Ok(size)
    }

    /// Append `bytes` to the session. `range`, when given, is the inclusive byte range the chunk
    /// claims: it must start at the accumulated length and span exactly `bytes`. Returns the new
    /// accumulated length.
    pub async fn append(
        &self,
        uuid: &Uuid,
        range: Option<RangeInclusive<u64>>,
        bytes: &[u8],
    ) -> Result<u64> {
        let session = self.session(uuid).await?;
        let mut session = session.lock().await;
        if session.closed {
            return Err(unknown(uuid).into());
        }
        if let Some(range) = range {
            check_range(uuid, &range, session.size, bytes.len() as u64)?;
        }
        let size = self.append_locked(uuid, &mut session, bytes).await?;
        tracing::debug!("upload {uuid} now holds {size} bytes");
        Ok(size)
    }

    /// Accumulated length of the session.
    pub async fn status(&self, uuid: &Uuid) -> Result<u64> {
        let session = self.session(uuid).await?;
        let session = session.lock().await;
        if session.closed {
            return Err(unknown(uuid).into());
        }
        Ok(session.size)
    }

    /// Append `tail`, verify the content against `digest` and move it to its content addressed
    /// key. A digest mismatch leaves the session open.
    pub async fn commit(&self, uuid: &Uuid, digest: &OciDigest, tail: &[u8]) -> Result<Blob> {
        let session = self.session(uuid).await?;
        let mut session = session.lock().await;
        if session.closed {
            return Err(unknown(uuid).into());
        }
        if !tail.is_empty() {
            self.append_locked(uuid, &mut session, tail).await?;
        }

        let local = self.blobs.local();
        let content = local
            .get(&session.key)
            .await
            .context(|| format!("read upload object for {uuid}"))?;
        if !digest.matches(&content) {
            return Err(CoreError::DigestInvalid(Some(format!(
                "upload {uuid} does not match {digest}"
            )))
            .into());
        }

        let blob = self
            .blobs
            .commit_upload(digest, &session.key, content.len() as u64)
            .await?;

        session.closed = true;
        drop(session);
        self.forget(uuid).await;
        tracing::debug!("committed upload {uuid} as {digest}");
        Ok(blob)
    }

    /// Store a complete blob without a prior session.
    pub async fn upload(&self, digest: &OciDigest, body: &[u8]) -> Result<Blob> {
        let uuid = self.open().await?;
        match self.commit(&uuid, digest, body).await {
            Ok(blob) => Ok(blob),
            Err(e) => {
                if let Err(abort) = self.abort(&uuid).await {
                    tracing::warn!("failed to abort upload {uuid}: {abort}");
                }
                Err(e)
            }
        }
    }

    /// Drop the session and its temporary object.
    pub async fn abort(&self, uuid: &Uuid) -> Result<()> {
        let session = self.session(uuid).await?;
        let mut session = session.lock().await;
        if session.closed {
            return Err(unknown(uuid).into());
        }
        session.closed = true;
        let key = session.key.clone();
        drop(session);
        self.forget(uuid).await;

        match self.blobs.local().delete(&key).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e).context(|| format!("delete upload object for {uuid}")),
        }
        tracing::debug!("aborted upload {uuid}");
        Ok(())
    }
}
