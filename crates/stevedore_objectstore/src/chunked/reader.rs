use bytes::{Bytes, BytesMut};
use futures::stream::{BoxStream, StreamExt};

use super::{ChunkBackend, ChunkedDriver};
use crate::errors::{Error, Result};

/// Cursor over a chunked object, created by [`ChunkedDriver::read`].
///
/// Every call to [`ChunkReader::read`] touches at most one chunk. The cursor stops exactly at the
/// object length recorded when the reader was created.
pub struct ChunkReader<B> {
    driver: ChunkedDriver<B>,
    oid: String,
    position: u64,
    size: u64,
}

impl<B: ChunkBackend> ChunkReader<B> {
    pub(crate) fn new(driver: ChunkedDriver<B>, oid: &str, position: u64, size: u64) -> Self {
        Self {
            driver,
            oid: oid.to_string(),
            position,
            size,
        }
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Read at most `max` bytes from the cursor. An empty result means end of object.
    pub async fn read(&mut self, max: usize) -> Result<Bytes> {
        if self.position >= self.size || max == 0 {
            return Ok(Bytes::new());
        }
        let (chunk, chunk_offset) = self.driver.chunk(&self.oid, self.position);
        let n = (max as u64)
            .min(self.driver.chunk_size() - chunk_offset)
            .min(self.size - self.position);

        let data = self
            .driver
            .backend()
            .read(&chunk, chunk_offset, n as usize)
            .await?;
        if data.is_empty() {
            return Err(Error::ShortRead {
                oid: chunk,
                offset: chunk_offset,
            });
        }
        self.position += data.len() as u64;
        Ok(data)
    }

    pub async fn read_to_end(mut self) -> Result<Bytes> {
        let mut out = BytesMut::with_capacity((self.size - self.position) as usize);
        loop {
            let data = self.read(self.driver.chunk_size() as usize).await?;
            if data.is_empty() {
                return Ok(out.freeze());
            }
            out.extend_from_slice(&data);
        }
    }

    /// Stream the rest of the object in reads of at most `buf_size` bytes.
    pub fn into_stream(self, buf_size: usize) -> BoxStream<'static, Result<Bytes>> {
        futures::stream::try_unfold(self, move |mut reader| async move {
            let data = reader.read(buf_size).await?;
            if data.is_empty() {
                Ok(None)
            } else {
                Ok(Some((data, reader)))
            }
        })
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use futures::stream::TryStreamExt;

    use super::super::MemoryChunkBackend;
    use super::*;

    #[tokio::test]
    async fn stream_yields_whole_object() {
        let driver = ChunkedDriver::new(MemoryChunkBackend::new(), 4).unwrap();
        driver.write("oid", 0, &b"hello, chunks"[..]).await.unwrap();

        let parts: Vec<Bytes> = driver
            .read("oid", 0)
            .await
            .unwrap()
            .into_stream(3)
            .try_collect()
            .await
            .unwrap();
        let lens: Vec<usize> = parts.iter().map(|p| p.len()).collect();
        assert_eq!(lens, vec![3, 1, 3, 1, 3, 1, 1]);
        assert_eq!(parts.concat(), b"hello, chunks");
    }

    #[tokio::test]
    async fn missing_chunk_bytes_are_a_short_read() {
        let driver = ChunkedDriver::new(MemoryChunkBackend::new(), 4).unwrap();
        driver.write("oid", 0, &b"12345678"[..]).await.unwrap();
        driver.backend().remove("oid-1").await.unwrap();

        let mut reader = driver.read("oid", 0).await.unwrap();
        assert_eq!(&reader.read(10).await.unwrap()[..], b"1234");
        assert!(reader.read(10).await.is_err());
    }
}
