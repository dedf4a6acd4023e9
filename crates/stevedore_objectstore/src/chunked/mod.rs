//! # Chunked Object Driver
//!
//! Stores logical objects of arbitrary length on a [`ChunkBackend`] whose objects are bounded in
//! size. A logical object with id `oid` is spread over backend objects `oid-0`, `oid-1`, ...,
//! where `oid-k` holds bytes `[k * chunk_size, (k + 1) * chunk_size)`. The logical length lives in
//! the `total-size` attribute of `oid-0` as an 8 byte little endian integer; it cannot be
//! recovered from the chunks themselves.
//!
//! Human readable paths are mapped to object ids through directory objects: the object named
//! `dir:<parent>` holds an omap entry `<file name> -> oid` for every linked path below `<parent>`.
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::errors::{Error, Result};
use crate::{Key, ObjectStore};

mod backend;
pub use backend::{ChunkBackend, ObjectStat};
mod memory;
pub use memory::MemoryChunkBackend;
mod reader;
pub use reader::ChunkReader;

pub const DEFAULT_CHUNK_SIZE: u64 = 4 << 20;
pub const TOTAL_SIZE_XATTR: &str = "total-size";

const ROOT_DIRECTORY: &str = ".";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileInfo {
    pub path: String,
    pub size: u64,
    /// Set for paths that do not resolve to an object.
    pub is_dir: bool,
    pub modified: Option<DateTime<Utc>>,
}

pub struct ChunkedDriver<B> {
    backend: Arc<B>,
    chunk_size: u64,
}

impl<B> Clone for ChunkedDriver<B> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            chunk_size: self.chunk_size,
        }
    }
}

/// Name of the chunk holding `offset` and the offset within that chunk.
pub fn chunk_position(oid: &str, chunk_size: u64, offset: u64) -> (String, u64) {
    (
        format!("{}-{}", oid, offset / chunk_size),
        offset % chunk_size,
    )
}

fn directory_oid(parent: &str) -> String {
    format!("dir:{parent}")
}

fn split_path(path: &str) -> (String, String) {
    let trimmed = path.trim_matches('/');
    match trimmed.rsplit_once('/') {
        Some((parent, base)) => (directory_oid(parent), base.to_string()),
        None => (directory_oid(ROOT_DIRECTORY), trimmed.to_string()),
    }
}

/// Fill `buf` from `reader`, stopping early only at end of input.
async fn fill<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]).await? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

impl<B: ChunkBackend> ChunkedDriver<B> {
    pub fn new(backend: B, chunk_size: u64) -> Result<Self> {
        Self::with_shared_backend(Arc::new(backend), chunk_size)
    }

    pub fn with_shared_backend(backend: Arc<B>, chunk_size: u64) -> Result<Self> {
        if chunk_size == 0 {
            return Err(Error::InvalidChunkSize);
        }
        Ok(Self {
            backend,
            chunk_size,
        })
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub(crate) fn chunk(&self, oid: &str, offset: u64) -> (String, u64) {
        chunk_position(oid, self.chunk_size, offset)
    }

    /// Logical length of `oid`.
    pub async fn size(&self, oid: &str) -> Result<u64> {
        let (first, _) = self.chunk(oid, 0);
        let raw = self.backend.get_xattr(&first, TOTAL_SIZE_XATTR).await?;
        let raw: [u8; 8] = raw
            .as_ref()
            .try_into()
            .map_err(|_| Error::CorruptSize(oid.to_string()))?;
        Ok(u64::from_le_bytes(raw))
    }

    async fn size_if_exists(&self, oid: &str) -> Result<Option<u64>> {
        match self.size(oid).await {
            Ok(size) => Ok(Some(size)),
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn set_size(&self, oid: &str, size: u64) -> Result<()> {
        let (first, _) = self.chunk(oid, 0);
        self.backend
            .set_xattr(&first, TOTAL_SIZE_XATTR, &size.to_le_bytes())
            .await
    }

    /// Write everything `reader` yields to `oid`, starting at `offset`.
    ///
    /// Any gap between the current length and `offset` is zero filled first. Data is written one
    /// chunk-aligned segment at a time and the length attribute is raised after every segment
    /// that extends the object. End of input ends the write. The first backend failure stops the
    /// write and is returned as [`Error::Interrupted`] carrying the number of bytes persisted.
    pub async fn write<R>(&self, oid: &str, offset: u64, mut reader: R) -> Result<u64>
    where
        R: AsyncRead + Unpin + Send,
    {
        let existed = self.size_if_exists(oid).await?;
        let mut total = existed.unwrap_or(0);

        let interrupted = |written: u64, e: Error| Error::Interrupted {
            written,
            source: Box::new(e),
        };

        while total < offset {
            let (chunk, chunk_offset) = self.chunk(oid, total);
            let n = (self.chunk_size - chunk_offset).min(offset - total);
            let zeros = vec![0u8; n as usize];
            self.backend
                .write(&chunk, chunk_offset, &zeros)
                .await
                .map_err(|e| interrupted(0, e))?;
            total += n;
            self.set_size(oid, total)
                .await
                .map_err(|e| interrupted(0, e))?;
            tracing::trace!("zero filled {n} bytes of {chunk} at {chunk_offset}");
        }

        let mut written = 0u64;
        let mut buf = vec![0u8; self.chunk_size as usize];
        loop {
            let (chunk, chunk_offset) = self.chunk(oid, offset + written);
            let want = (self.chunk_size - chunk_offset) as usize;
            let n = fill(&mut reader, &mut buf[..want])
                .await
                .map_err(|e| interrupted(written, e.into()))?;
            if n == 0 {
                break;
            }

            self.backend
                .write(&chunk, chunk_offset, &buf[..n])
                .await
                .map_err(|e| interrupted(written, e))?;
            written += n as u64;

            let end = offset + written;
            if end > total {
                self.set_size(oid, end)
                    .await
                    .map_err(|e| interrupted(written, e))?;
                total = end;
            }

            if n < want {
                break;
            }
        }

        if existed.is_none() && total == 0 {
            self.set_size(oid, 0)
                .await
                .map_err(|e| interrupted(0, e))?;
        }

        tracing::debug!("wrote {written} bytes to {oid} at {offset}, length now {total}");
        Ok(written)
    }

    /// Lazily read `oid` from `offset` to its end.
    pub async fn read(&self, oid: &str, offset: u64) -> Result<ChunkReader<B>> {
        let size = self.size(oid).await?;
        if offset > size {
            return Err(Error::InvalidOffset {
                oid: oid.to_string(),
                offset,
                size,
            });
        }
        Ok(ChunkReader::new(self.clone(), oid, offset, size))
    }

    /// Remove every chunk of `oid`, highest index first so chunk 0 and its length attribute go
    /// last.
    pub async fn remove(&self, oid: &str) -> Result<()> {
        let size = self.size(oid).await?;
        let chunks = ((size + self.chunk_size - 1) / self.chunk_size).max(1);
        for k in (1..chunks).rev() {
            let (chunk, _) = self.chunk(oid, k * self.chunk_size);
            match self.backend.remove(&chunk).await {
                Ok(()) | Err(Error::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        let (first, _) = self.chunk(oid, 0);
        self.backend.remove(&first).await
    }

    /// Object id `path` is linked to, if any.
    pub async fn resolve(&self, path: &str) -> Result<Option<String>> {
        let (dir, base) = split_path(path);
        match self.backend.get_omap_value(&dir, &base).await? {
            Some(v) => Ok(Some(String::from_utf8_lossy(&v).into_owned())),
            None => Ok(None),
        }
    }

    async fn link(&self, path: &str, oid: &str) -> Result<()> {
        let (dir, base) = split_path(path);
        self.backend
            .set_omap_value(&dir, &base, oid.as_bytes())
            .await
    }

    async fn unlink(&self, path: &str) -> Result<()> {
        let (dir, base) = split_path(path);
        self.backend.remove_omap_key(&dir, &base).await
    }

    /// Describe `path`. Paths that are not linked to an object are reported as empty virtual
    /// directories.
    pub async fn stat(&self, path: &str) -> Result<FileInfo> {
        let oid = match self.resolve(path).await? {
            Some(oid) => oid,
            None => {
                return Ok(FileInfo {
                    path: path.to_string(),
                    size: 0,
                    is_dir: true,
                    modified: None,
                })
            }
        };
        let (first, _) = self.chunk(&oid, 0);
        let stat = self.backend.stat(&first).await?;
        Ok(FileInfo {
            path: path.to_string(),
            size: self.size(&oid).await?,
            is_dir: false,
            modified: Some(stat.modified),
        })
    }
}

#[async_trait]
impl<B: ChunkBackend> ObjectStore for ChunkedDriver<B> {
    async fn get(&self, key: &Key) -> Result<Bytes> {
        let path = String::from(key);
        let oid = self
            .resolve(&path)
            .await?
            .ok_or_else(|| Error::NotFound(path))?;
        self.read(&oid, 0).await?.read_to_end().await
    }

    async fn exists(&self, key: &Key) -> Result<bool> {
        Ok(self.resolve(&String::from(key)).await?.is_some())
    }

    async fn put(&self, key: &Key, body: Bytes) -> Result<()> {
        let path = String::from(key);
        let previous = self.resolve(&path).await?;

        // the path only ever points at a fully written object
        let oid = uuid::Uuid::new_v4().simple().to_string();
        if let Err(e) = self.write(&oid, 0, &body[..]).await {
            match self.remove(&oid).await {
                Ok(()) | Err(Error::NotFound(_)) => {}
                Err(cleanup) => tracing::warn!("leaving partial object {oid} behind: {cleanup}"),
            }
            return Err(e);
        }
        self.link(&path, &oid).await?;

        if let Some(previous) = previous {
            match self.remove(&previous).await {
                Ok(()) | Err(Error::NotFound(_)) => {}
                Err(e) => tracing::warn!("failed to remove replaced object {previous}: {e}"),
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &Key) -> Result<()> {
        let path = String::from(key);
        let oid = self
            .resolve(&path)
            .await?
            .ok_or_else(|| Error::NotFound(path.clone()))?;
        match self.remove(&oid).await {
            Ok(()) | Err(Error::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        self.unlink(&path).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use rstest::*;

    use super::*;

    const CHUNK: u64 = 8;

    fn driver() -> ChunkedDriver<MemoryChunkBackend> {
        ChunkedDriver::new(MemoryChunkBackend::new(), CHUNK).unwrap()
    }

    fn content(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8 + 1).collect()
    }

    #[rstest]
    #[case::first(0, ("oid-0".into(), 0))]
    #[case::inside_first(7, ("oid-0".into(), 7))]
    #[case::boundary(8, ("oid-1".into(), 0))]
    #[case::far(8 * 5 + 3, ("oid-5".into(), 3))]
    fn maps_offsets_to_chunks(#[case] offset: u64, #[case] expected: (String, u64)) {
        assert_eq!(chunk_position("oid", CHUNK, offset), expected);
    }

    #[rstest]
    #[case::empty(0)]
    #[case::one(1)]
    #[case::short_of_chunk(7)]
    #[case::one_chunk(8)]
    #[case::past_chunk(9)]
    #[case::several_chunks(3 * 8 + 5)]
    #[case::exact_multiple(4 * 8)]
    #[tokio::test]
    async fn write_then_read(#[case] len: usize) {
        let driver = driver();
        let data = content(len);

        let written = driver.write("oid", 0, &data[..]).await.unwrap();
        assert_eq!(written, len as u64);
        assert_eq!(driver.size("oid").await.unwrap(), len as u64);

        let read = driver.read("oid", 0).await.unwrap().read_to_end().await.unwrap();
        assert_eq!(&read[..], &data[..]);
    }

    #[tokio::test]
    async fn chunks_hold_fixed_ranges() {
        let driver = driver();
        let data = content(20);
        driver.write("oid", 0, &data[..]).await.unwrap();

        let backend = driver.backend();
        assert_eq!(backend.stat("oid-0").await.unwrap().size, 8);
        assert_eq!(backend.stat("oid-1").await.unwrap().size, 8);
        assert_eq!(backend.stat("oid-2").await.unwrap().size, 4);
        assert!(!backend.contains("oid-3").await);
        let raw = backend.get_xattr("oid-0", TOTAL_SIZE_XATTR).await.unwrap();
        assert_eq!(&raw[..], &20u64.to_le_bytes()[..]);
    }

    #[rstest]
    #[case::within_first_chunk(3)]
    #[case::chunk_boundary(8)]
    #[case::several_chunks_away(19)]
    #[tokio::test]
    async fn writing_past_the_end_zero_fills(#[case] gap_end: u64) {
        let driver = driver();
        driver.write("oid", 0, &b"ab"[..]).await.unwrap();
        driver.write("oid", gap_end, &b"xyz"[..]).await.unwrap();

        let size = driver.size("oid").await.unwrap();
        assert_eq!(size, gap_end + 3);

        let read = driver.read("oid", 0).await.unwrap().read_to_end().await.unwrap();
        assert_eq!(&read[..2], b"ab");
        assert!(read[2..gap_end as usize].iter().all(|b| *b == 0));
        assert_eq!(&read[gap_end as usize..], b"xyz");
    }

    #[tokio::test]
    async fn zero_fill_on_fresh_object() {
        let driver = driver();
        driver.write("oid", 10, &b"z"[..]).await.unwrap();
        let read = driver.read("oid", 0).await.unwrap().read_to_end().await.unwrap();
        assert_eq!(read.len(), 11);
        assert!(read[..10].iter().all(|b| *b == 0));
        assert_eq!(read[10], b'z');
    }

    #[tokio::test]
    async fn overwrite_inside_does_not_shrink() {
        let driver = driver();
        driver.write("oid", 0, &content(20)[..]).await.unwrap();
        driver.write("oid", 4, &b"ZZ"[..]).await.unwrap();
        assert_eq!(driver.size("oid").await.unwrap(), 20);
        let read = driver.read("oid", 0).await.unwrap().read_to_end().await.unwrap();
        assert_eq!(&read[4..6], b"ZZ");
    }

    #[rstest]
    #[case::start(0)]
    #[case::middle_of_chunk(5)]
    #[case::chunk_boundary(16)]
    #[case::end(21)]
    #[tokio::test]
    async fn read_from_offset(#[case] offset: u64) {
        let driver = driver();
        let data = content(21);
        driver.write("oid", 0, &data[..]).await.unwrap();

        let read = driver
            .read("oid", offset)
            .await
            .unwrap()
            .read_to_end()
            .await
            .unwrap();
        assert_eq!(&read[..], &data[offset as usize..]);
    }

    #[tokio::test]
    async fn read_past_end_is_invalid_offset() {
        let driver = driver();
        driver.write("oid", 0, &content(5)[..]).await.unwrap();
        match driver.read("oid", 6).await {
            Err(Error::InvalidOffset { offset, size, .. }) => {
                assert_eq!((offset, size), (6, 5));
            }
            other => panic!("expected invalid offset, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn reads_stay_within_one_chunk() {
        let driver = driver();
        driver.write("oid", 0, &content(20)[..]).await.unwrap();
        let mut reader = driver.read("oid", 6).await.unwrap();

        assert_eq!(reader.read(100).await.unwrap().len(), 2);
        assert_eq!(reader.read(3).await.unwrap().len(), 3);
        assert_eq!(reader.read(100).await.unwrap().len(), 5);
        assert_eq!(reader.read(100).await.unwrap().len(), 4);
        assert!(reader.read(100).await.unwrap().is_empty());
        assert_eq!(reader.position(), 20);
    }

    #[tokio::test]
    async fn stat_reports_unlinked_paths_as_directories() {
        let driver = driver();
        let info = driver.stat("blobs/sha256").await.unwrap();
        assert!(info.is_dir);
        assert_eq!(info.size, 0);

        let key = Key::try_from("blobs/sha256/abc").unwrap();
        driver.put(&key, Bytes::from_static(b"0123456789")).await.unwrap();
        let info = driver.stat("blobs/sha256/abc").await.unwrap();
        assert!(!info.is_dir);
        assert_eq!(info.size, 10);
        assert!(info.modified.is_some());
    }

    #[tokio::test]
    async fn object_store_lifecycle() {
        let driver = driver();
        let key = Key::try_from("blobs/sha256/abc").unwrap();
        assert!(!driver.exists(&key).await.unwrap());

        driver.put(&key, Bytes::from(content(30))).await.unwrap();
        assert!(driver.exists(&key).await.unwrap());
        assert_eq!(&driver.get(&key).await.unwrap()[..], &content(30)[..]);

        driver.put(&key, Bytes::from_static(b"short")).await.unwrap();
        assert_eq!(&driver.get(&key).await.unwrap()[..], b"short");

        driver.delete(&key).await.unwrap();
        assert!(!driver.exists(&key).await.unwrap());
        assert_eq!(driver.backend().len().await, 0);
        assert!(driver.delete(&key).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn empty_objects_exist() {
        let driver = driver();
        let key = Key::try_from("empty").unwrap();
        driver.put(&key, Bytes::new()).await.unwrap();
        assert!(driver.get(&key).await.unwrap().is_empty());
        driver.delete(&key).await.unwrap();
    }

    /// Fails every chunk write after the first `allowed`.
    struct FailingBackend {
        inner: MemoryChunkBackend,
        allowed: AtomicUsize,
        writes: AtomicUsize,
    }

    impl FailingBackend {
        fn allowing(allowed: usize) -> Self {
            Self {
                inner: MemoryChunkBackend::new(),
                allowed: AtomicUsize::new(allowed),
                writes: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ChunkBackend for FailingBackend {
        async fn read(&self, oid: &str, offset: u64, len: usize) -> Result<Bytes> {
            self.inner.read(oid, offset, len).await
        }
        async fn write(&self, oid: &str, offset: u64, data: &[u8]) -> Result<()> {
            if self.writes.fetch_add(1, Ordering::SeqCst) >= self.allowed.load(Ordering::SeqCst) {
                return Err(Error::IoError(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "backend unavailable",
                )));
            }
            self.inner.write(oid, offset, data).await
        }
        async fn stat(&self, oid: &str) -> Result<ObjectStat> {
            self.inner.stat(oid).await
        }
        async fn remove(&self, oid: &str) -> Result<()> {
            self.inner.remove(oid).await
        }
        async fn get_xattr(&self, oid: &str, name: &str) -> Result<Bytes> {
            self.inner.get_xattr(oid, name).await
        }
        async fn set_xattr(&self, oid: &str, name: &str, value: &[u8]) -> Result<()> {
            self.inner.set_xattr(oid, name, value).await
        }
        async fn get_omap_value(&self, oid: &str, key: &str) -> Result<Option<Bytes>> {
            self.inner.get_omap_value(oid, key).await
        }
        async fn set_omap_value(&self, oid: &str, key: &str, value: &[u8]) -> Result<()> {
            self.inner.set_omap_value(oid, key, value).await
        }
        async fn remove_omap_key(&self, oid: &str, key: &str) -> Result<()> {
            self.inner.remove_omap_key(oid, key).await
        }
    }

    #[tokio::test]
    async fn failed_write_reports_persisted_bytes() {
        let driver = ChunkedDriver::new(FailingBackend::allowing(2), CHUNK).unwrap();
        let data = content(30);

        match driver.write("oid", 0, &data[..]).await {
            Err(Error::Interrupted { written, .. }) => assert_eq!(written, 16),
            other => panic!("expected interrupted write, got {other:?}"),
        }

        // nothing is rolled back
        assert_eq!(driver.size("oid").await.unwrap(), 16);
        let read = driver.read("oid", 0).await.unwrap().read_to_end().await.unwrap();
        assert_eq!(&read[..], &data[..16]);
    }

    #[tokio::test]
    async fn failed_zero_fill_is_interrupted() {
        let driver = ChunkedDriver::new(FailingBackend::allowing(1), CHUNK).unwrap();

        match driver.write("oid", 20, &b"xyz"[..]).await {
            Err(Error::Interrupted { written, .. }) => assert_eq!(written, 0),
            other => panic!("expected interrupted write, got {other:?}"),
        }
        assert_eq!(driver.size("oid").await.unwrap(), 8);
    }

    #[tokio::test]
    async fn failed_put_leaves_no_link() {
        let driver = ChunkedDriver::new(FailingBackend::allowing(0), CHUNK).unwrap();
        let key = Key::try_from("blobs/sha256/abc").unwrap();

        assert!(driver.put(&key, Bytes::from(content(20))).await.is_err());
        assert!(!driver.exists(&key).await.unwrap());
        assert_eq!(driver.resolve("blobs/sha256/abc").await.unwrap(), None);

        driver.backend().allowed.store(usize::MAX, Ordering::SeqCst);
        driver.put(&key, Bytes::from(content(20))).await.unwrap();
        assert_eq!(&driver.get(&key).await.unwrap()[..], &content(20)[..]);
    }

    #[tokio::test]
    async fn failed_overwrite_keeps_previous_object() {
        let driver = ChunkedDriver::new(FailingBackend::allowing(3), CHUNK).unwrap();
        let key = Key::try_from("blobs/sha256/abc").unwrap();
        driver.put(&key, Bytes::from(content(20))).await.unwrap();

        assert!(driver.put(&key, Bytes::from_static(b"short")).await.is_err());
        assert_eq!(&driver.get(&key).await.unwrap()[..], &content(20)[..]);
    }

    #[test]
    fn zero_chunk_size_is_rejected() {
        assert!(matches!(
            ChunkedDriver::new(MemoryChunkBackend::new(), 0),
            Err(Error::InvalidChunkSize)
        ));
    }
}
