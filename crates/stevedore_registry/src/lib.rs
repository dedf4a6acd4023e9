//! # Stevedore Registry
//!
//! Blob lifecycle over a keyed record store and object storage:
//!
//! * [`BlobStore`] maps digests to committed bytes with a live reference count and collects blobs
//!   synchronously when the count reaches zero.
//! * [`UploadSessionStore`] accumulates resumable uploads and commits them into the blob store.
//! * [`ManifestStore`] keeps Tag and Repository records consistent with blob reference counts.
//!
//! [`Registry`] is the composition root; it hands out a [`RepositoryStore`] per repository name.
mod blobs;
pub use blobs::{blob_key, BlobStore};
mod config;
pub use config::StorageConfig;
mod errors;
pub use errors::{Error, Result};
mod locks;
mod manifests;
pub use manifests::{ManifestStore, PutManifest};
mod repositories;
pub use repositories::{Registry, RepositoryStore};
mod uploads;
pub use uploads::UploadSessionStore;
