use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::backend::{ChunkBackend, ObjectStat};
use crate::errors::{Error, Result};

#[derive(Debug)]
struct MemoryObject {
    modified: DateTime<Utc>,
    data: Vec<u8>,
    xattrs: HashMap<String, Vec<u8>>,
    omap: BTreeMap<String, Vec<u8>>,
}

impl Default for MemoryObject {
    fn default() -> Self {
        Self {
            modified: Utc::now(),
            data: Vec::new(),
            xattrs: HashMap::new(),
            omap: BTreeMap::new(),
        }
    }
}

/// [`ChunkBackend`] that keeps objects in memory.
#[derive(Debug, Default)]
pub struct MemoryChunkBackend {
    objects: RwLock<HashMap<String, MemoryObject>>,
}

impl MemoryChunkBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects, directory objects included.
    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn contains(&self, oid: &str) -> bool {
        self.objects.read().await.contains_key(oid)
    }
}

#[async_trait]
impl ChunkBackend for MemoryChunkBackend {
    async fn read(&self, oid: &str, offset: u64, len: usize) -> Result<Bytes> {
        let objects = self.objects.read().await;
        let object = objects
            .get(oid)
            .ok_or_else(|| Error::NotFound(oid.to_string()))?;
        let start = (offset as usize).min(object.data.len());
        let end = start.saturating_add(len).min(object.data.len());
        Ok(Bytes::copy_from_slice(&object.data[start..end]))
    }

    async fn write(&self, oid: &str, offset: u64, data: &[u8]) -> Result<()> {
        let mut objects = self.objects.write().await;
        let object = objects.entry(oid.to_string()).or_default();
        let start = offset as usize;
        let end = start + data.len();
        if object.data.len() < end {
            object.data.resize(end, 0);
        }
        object.data[start..end].copy_from_slice(data);
        object.modified = Utc::now();
        Ok(())
    }

    async fn stat(&self, oid: &str) -> Result<ObjectStat> {
        let objects = self.objects.read().await;
        let object = objects
            .get(oid)
            .ok_or_else(|| Error::NotFound(oid.to_string()))?;
        Ok(ObjectStat {
            size: object.data.len() as u64,
            modified: object.modified,
        })
    }

    async fn remove(&self, oid: &str) -> Result<()> {
        match self.objects.write().await.remove(oid) {
            Some(_) => Ok(()),
            None => Err(Error::NotFound(oid.to_string())),
        }
    }

    async fn get_xattr(&self, oid: &str, name: &str) -> Result<Bytes> {
        let objects = self.objects.read().await;
        let object = objects
            .get(oid)
            .ok_or_else(|| Error::NotFound(oid.to_string()))?;
        object
            .xattrs
            .get(name)
            .map(|v| Bytes::copy_from_slice(v))
            .ok_or_else(|| Error::AttributeNotFound {
                oid: oid.to_string(),
                name: name.to_string(),
            })
    }

    async fn set_xattr(&self, oid: &str, name: &str, value: &[u8]) -> Result<()> {
        let mut objects = self.objects.write().await;
        let object = objects.entry(oid.to_string()).or_default();
        object.xattrs.insert(name.to_string(), value.to_vec());
        Ok(())
    }

    async fn get_omap_value(&self, oid: &str, key: &str) -> Result<Option<Bytes>> {
        let objects = self.objects.read().await;
        Ok(objects
            .get(oid)
            .and_then(|o| o.omap.get(key))
            .map(|v| Bytes::copy_from_slice(v)))
    }

    async fn set_omap_value(&self, oid: &str, key: &str, value: &[u8]) -> Result<()> {
        let mut objects = self.objects.write().await;
        let object = objects.entry(oid.to_string()).or_default();
        object.omap.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn remove_omap_key(&self, oid: &str, key: &str) -> Result<()> {
        let mut objects = self.objects.write().await;
        if let Some(object) = objects.get_mut(oid) {
            object.omap.remove(key);
            if object.omap.is_empty() && object.data.is_empty() && object.xattrs.is_empty() {
                objects.remove(oid);
            }
        }
        Ok(())
    }
}
