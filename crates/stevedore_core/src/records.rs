//! # Record Store Ports
//!
//! Durable bookkeeping is split into three record kinds, each addressed by its natural key:
//!
//! * [`Blob`]: digest -> storage key, size, reference count
//! * [`Tag`]: (namespace, repository, tag) -> manifest body, schema version, manifest digest
//! * [`Repository`]: (namespace, repository) -> ordered tag list
//!
//! Components never persist records themselves; they are handed an implementation of
//! [`RecordStore`] at construction time. Implementations live in `stevedore_metadata`.
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::Result;
use crate::oci_digest::OciDigest;
use crate::reference::RepositoryName;

/// API version recorded on repositories created through this registry.
pub const API_VERSION: &str = "v2";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Blob {
    pub digest: OciDigest,
    /// Key of the committed bytes in the local staging store and, once pushed, the remote store.
    pub path: String,
    pub size: u64,
    pub ref_count: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tag {
    pub name: RepositoryName,
    pub tag: String,
    pub image_id: String,
    pub manifest: String,
    pub schema: u8,
    pub digest: OciDigest,
    pub memo: String,
    /// Used for delete-by-reference lookups; holds the manifest digest.
    pub reference: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Repository {
    pub name: RepositoryName,
    pub tags: Vec<String>,
    /// Schema 1 image ids pushed to this repository, oldest first.
    pub images: Vec<String>,
    pub agent: String,
    pub api_version: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

#[async_trait]
pub trait BlobRecords: Send + Sync {
    async fn get_blob(&self, digest: &OciDigest) -> Result<Option<Blob>>;

    /// Insert a new blob record. Returns `false` without modifying anything when a record for the
    /// digest already exists.
    async fn insert_blob(&self, blob: &Blob) -> Result<bool>;

    /// Set the reference count to `new` only if it currently equals `expected`. Returns `false` if
    /// the record is missing or its count differs.
    async fn swap_ref_count(&self, digest: &OciDigest, expected: u64, new: u64) -> Result<bool>;

    async fn delete_blob(&self, digest: &OciDigest) -> Result<()>;
}

#[async_trait]
pub trait TagRecords: Send + Sync {
    async fn get_tag(&self, name: &RepositoryName, tag: &str) -> Result<Option<Tag>>;

    /// All tags in the repository whose `reference` field equals `reference`.
    async fn get_tags_by_reference(
        &self,
        name: &RepositoryName,
        reference: &str,
    ) -> Result<Vec<Tag>>;

    async fn insert_tag(&self, tag: &Tag) -> Result<()>;

    async fn update_tag(&self, tag: &Tag) -> Result<()>;

    async fn delete_tag(&self, name: &RepositoryName, tag: &str) -> Result<()>;
}

#[async_trait]
pub trait RepositoryRecords: Send + Sync {
    async fn get_repository(&self, name: &RepositoryName) -> Result<Option<Repository>>;

    async fn insert_repository(&self, repository: &Repository) -> Result<()>;

    async fn update_repository(&self, repository: &Repository) -> Result<()>;

    async fn delete_repository(&self, name: &RepositoryName) -> Result<()>;

    /// Every repository name, sorted.
    async fn list_repositories(&self) -> Result<Vec<RepositoryName>>;
}

/// The full set of record ports a registry needs.
pub trait RecordStore: BlobRecords + TagRecords + RepositoryRecords + 'static {}

impl<T> RecordStore for T where T: BlobRecords + TagRecords + RepositoryRecords + 'static {}
