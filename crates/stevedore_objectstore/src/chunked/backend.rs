use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::errors::Result;

#[derive(Clone, Debug)]
pub struct ObjectStat {
    pub size: u64,
    pub modified: DateTime<Utc>,
}

/// Addressed object I/O against a store of bounded-size objects, in the style of a RADOS I/O
/// context.
///
/// Objects are created implicitly by the first write, attribute set or omap set. Reading or
/// stating an object that does not exist is [`crate::Error::NotFound`]; reading a missing
/// attribute is [`crate::Error::AttributeNotFound`]. Backend errors are returned as is, the
/// driver above never retries.
#[async_trait]
pub trait ChunkBackend: Send + Sync + 'static {
    /// Read up to `len` bytes starting at `offset`. Fewer bytes are returned when the object ends
    /// before `offset + len`.
    async fn read(&self, oid: &str, offset: u64, len: usize) -> Result<Bytes>;

    /// Write `data` at `offset`, extending the object as needed.
    async fn write(&self, oid: &str, offset: u64, data: &[u8]) -> Result<()>;

    async fn stat(&self, oid: &str) -> Result<ObjectStat>;

    async fn remove(&self, oid: &str) -> Result<()>;

    async fn get_xattr(&self, oid: &str, name: &str) -> Result<Bytes>;

    async fn set_xattr(&self, oid: &str, name: &str, value: &[u8]) -> Result<()>;

    /// Look up `key` in the object's key/value map. A missing object has an empty map.
    async fn get_omap_value(&self, oid: &str, key: &str) -> Result<Option<Bytes>>;

    async fn set_omap_value(&self, oid: &str, key: &str, value: &[u8]) -> Result<()>;

    async fn remove_omap_key(&self, oid: &str, key: &str) -> Result<()>;
}
