use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use once_cell::sync::Lazy;
use regex::Regex;

mod config;
pub use config::{ChunkBackendConfig, ChunkedConfig, Config};
mod errors;
pub use errors::{Error, KeyError, Result};
pub mod chunked;
pub use chunked::{ChunkBackend, ChunkedDriver, MemoryChunkBackend};
mod filesystem;
pub use filesystem::{Filesystem, FilesystemConfig};
pub(crate) mod s3;
pub use s3::S3Config;
pub use s3::S3;

/// A wrapper around [`std::path::PathBuf`] that rejects unsavory key names.
///
/// The following rules applied during the [`TryFrom<PathBuf>`] implementation:
///
/// * paths must not start with `/`
/// * paths are delimited by `/`
/// * paths are normalized (`//` are replaced with `/` and never end in `/`)
/// * paths must not contain relative segments (ie `.` or `..`)
/// * only characters explicitly documented as safe [in the S3
///   docs](https://docs.aws.amazon.com/AmazonS3/latest/userguide/object-keys.html) are allowed in
///   path segments
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Key {
    key: PathBuf,
}

impl Key {
    pub fn as_path(&self) -> &Path {
        &self.key
    }

    /// Last segment of the key.
    pub fn file_name(&self) -> String {
        self.key
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

impl From<&Key> for String {
    fn from(k: &Key) -> String {
        format!("{}", k.key.display())
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.key.display())
    }
}

impl TryFrom<PathBuf> for Key {
    type Error = Error;

    fn try_from(pb: PathBuf) -> Result<Key> {
        let key = pb
            .components()
            .try_fold(PathBuf::new(), validate_component)?;
        if key.as_os_str().is_empty() {
            return Err(KeyError::Empty.into());
        }
        Ok(Key { key })
    }
}

impl TryFrom<&str> for Key {
    type Error = Error;

    fn try_from(s: &str) -> Result<Key> {
        Key::try_from(PathBuf::from(s))
    }
}

fn validate_component(mut pb: PathBuf, c: Component<'_>) -> std::result::Result<PathBuf, KeyError> {
    static RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-zA-Z0-9_.*'()!-]+$").unwrap());
    match c {
        Component::Prefix(_) => return Err(KeyError::PrefixNotAllowed),
        Component::RootDir => return Err(KeyError::RootDirNotAllowed),
        Component::CurDir => return Err(KeyError::CurDirNotAllowed),
        Component::ParentDir => return Err(KeyError::ParentDirNotAllowed),
        Component::Normal(s) => {
            if let Some(s) = s.to_str() {
                if !RE.is_match(s) {
                    return Err(KeyError::PathComponentsMustMatchRegex(
                        RE.as_str().to_string(),
                    ));
                }
            } else {
                return Err(KeyError::PathComponentsMustBeValidUnicode);
            }
        }
    }
    pb.push(c);
    Ok(pb)
}

/// Uniform save/get/delete capability over a storage backend.
///
/// Flat adapters ([`S3`], [`Filesystem`]) map keys directly onto backend objects while
/// [`ChunkedDriver`] spreads each object over fixed-size backend chunks.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    async fn get(&self, key: &Key) -> Result<Bytes>;

    async fn exists(&self, key: &Key) -> Result<bool>;

    async fn put(&self, key: &Key, body: Bytes) -> Result<()>;

    /// Deleting a key that does not exist is an error for which [`Error::is_not_found`] holds.
    async fn delete(&self, key: &Key) -> Result<()>;

    /// Upload the contents of a local file under `key`.
    async fn save(&self, key: &Key, local: &Path) -> Result<()> {
        let body = tokio::fs::read(local).await?;
        self.put(key, Bytes::from(body)).await
    }
}

#[cfg(test)]
mod tests {
    use rstest::*;

    use super::*;

    #[rstest]
    #[case::nested("blobs/sha256/abc", true)]
    #[case::normalizes_double_slash("blobs//sha256", true)]
    #[case::rooted("/blobs", false)]
    #[case::parent("blobs/../etc", false)]
    #[case::current("./blobs", false)]
    #[case::bad_char("blobs/a b", false)]
    #[case::empty("", false)]
    fn key_validation(#[case] input: &str, #[case] ok: bool) {
        assert_eq!(Key::try_from(input).is_ok(), ok, "{input}");
    }

    #[test]
    fn key_parts() {
        let key = Key::try_from("uploads/library/ubuntu/abc").unwrap();
        assert_eq!(key.file_name(), "abc");
        assert_eq!(key.to_string(), "uploads/library/ubuntu/abc");
    }

    // validate object safety
    #[allow(dead_code)]
    struct Whatever {
        objectstore: Box<dyn ObjectStore>,
    }
}
