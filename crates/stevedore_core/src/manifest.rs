//! # Manifest Schema Interpreter
//!
//! Image manifests arrive in one of two structurally different encodings:
//!
//! * schema 1 carries a history chain: parallel `fsLayers` and `history` arrays, newest entry
//!   first, where every `history[i].v1Compatibility` is itself a JSON document naming an image id
//!   and its parent.
//! * schema 2 carries a single `config` descriptor plus an ordered `layers` list.
//!
//! Both are decoded exactly once into [`ManifestSpec`] and from then on exposed through the same
//! normalized view: an ordered digest list (base first) and, for schema 1, the image id chain.
use std::collections::HashSet;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};

use crate::errors::{Error, Result};
use crate::oci_digest::OciDigest;

/// Image id recorded for schema 2 tags, which have no per-layer image ids.
pub const SCHEMA_V2_IMAGE_ID: &str = "schemaV2";

pub const SCHEMA_V1_CONTENT_TYPE: &str = "application/json; charset=utf-8";
pub const SCHEMA_V2_CONTENT_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Versioned {
    schema_version: Option<u64>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaV1 {
    pub name: Option<String>,
    pub tag: Option<String>,
    pub architecture: Option<String>,
    pub fs_layers: Vec<FsLayer>,
    pub history: Vec<History>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FsLayer {
    pub blob_sum: OciDigest,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct History {
    #[serde(deserialize_with = "embedded_json")]
    pub v1_compatibility: V1Image,
}

/// The parts of a schema 1 `v1Compatibility` document the registry tracks.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct V1Image {
    pub id: String,
    pub parent: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaV2 {
    pub media_type: Option<String>,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: Option<String>,
    pub size: Option<u64>,
    pub digest: OciDigest,
}

fn embedded_json<'de, D, T>(de: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let s = String::deserialize(de)?;
    serde_json::from_str(&s).map_err(serde::de::Error::custom)
}

/// A decoded image manifest, discriminated by `schemaVersion`.
#[derive(Clone, Debug)]
pub enum ManifestSpec {
    V1(SchemaV1),
    V2(SchemaV2),
}

fn invalid(e: serde_json::Error) -> Error {
    Error::ManifestInvalid(Some(e.to_string()))
}

impl TryFrom<&[u8]> for ManifestSpec {
    type Error = Error;

    fn try_from(bs: &[u8]) -> Result<Self> {
        let versioned: Versioned = serde_json::from_slice(bs).map_err(invalid)?;
        match versioned.schema_version {
            Some(1) => {
                let m: SchemaV1 = serde_json::from_slice(bs).map_err(invalid)?;
                if m.fs_layers.is_empty() {
                    return Err(Error::ManifestInvalid(Some(String::from(
                        "manifest references no blobs",
                    ))));
                }
                if m.fs_layers.len() != m.history.len() {
                    return Err(Error::ManifestInvalid(Some(format!(
                        "{} fsLayers but {} history entries",
                        m.fs_layers.len(),
                        m.history.len()
                    ))));
                }
                Ok(ManifestSpec::V1(m))
            }
            Some(2) => Ok(ManifestSpec::V2(
                serde_json::from_slice(bs).map_err(invalid)?,
            )),
            Some(v) => Err(Error::InvalidSchema(Some(format!(
                "unsupported schema version {v}"
            )))),
            None => Err(Error::ManifestInvalid(Some(String::from(
                "missing schemaVersion",
            )))),
        }
    }
}

impl ManifestSpec {
    pub fn schema_version(&self) -> u8 {
        match self {
            ManifestSpec::V1(_) => 1,
            ManifestSpec::V2(_) => 2,
        }
    }

    /// Every blob digest the manifest references, base layer first.
    ///
    /// For schema 2 the config digest comes first, followed by the layers in document order. For
    /// schema 1 there is one digest per history entry, oldest first. A digest referenced more than
    /// once appears more than once.
    pub fn digests(&self) -> Vec<OciDigest> {
        match self {
            ManifestSpec::V1(m) => m
                .fs_layers
                .iter()
                .rev()
                .map(|l| l.blob_sum.clone())
                .collect(),
            ManifestSpec::V2(m) => std::iter::once(&m.config)
                .chain(m.layers.iter())
                .map(|d| d.digest.clone())
                .collect(),
        }
    }

    /// [`Self::digests`] with repeats removed, keeping first occurrences.
    pub fn distinct_digests(&self) -> Vec<OciDigest> {
        let mut seen = HashSet::new();
        self.digests()
            .into_iter()
            .filter(|d| seen.insert(d.clone()))
            .collect()
    }

    /// Schema 1 image chain, oldest first. Empty for schema 2.
    pub fn images(&self) -> Vec<V1Image> {
        match self {
            ManifestSpec::V1(m) => m
                .history
                .iter()
                .rev()
                .map(|h| h.v1_compatibility.clone())
                .collect(),
            ManifestSpec::V2(_) => Vec::new(),
        }
    }

    /// The image id a tag pointing at this manifest is recorded under.
    pub fn image_id(&self) -> String {
        match self {
            ManifestSpec::V1(m) => m
                .history
                .first()
                .map(|h| h.v1_compatibility.id.clone())
                .unwrap_or_default(),
            ManifestSpec::V2(_) => String::from(SCHEMA_V2_IMAGE_ID),
        }
    }

    pub fn content_type(&self) -> String {
        match self {
            ManifestSpec::V1(_) => String::from(SCHEMA_V1_CONTENT_TYPE),
            ManifestSpec::V2(m) => m
                .media_type
                .clone()
                .unwrap_or_else(|| String::from(SCHEMA_V2_CONTENT_TYPE)),
        }
    }
}

/// Content type to serve a stored manifest of the given schema version with.
pub fn content_type_for_schema(schema: u8) -> &'static str {
    match schema {
        1 => SCHEMA_V1_CONTENT_TYPE,
        _ => SCHEMA_V2_CONTENT_TYPE,
    }
}

#[cfg(test)]
mod tests {
    use rstest::*;

    use super::*;

    fn digest_of(s: &str) -> OciDigest {
        OciDigest::from(s.as_bytes())
    }

    /// A schema 1 manifest over `layers`, given oldest first as schema 1 lists them newest first.
    fn schema_v1(layers: &[&OciDigest]) -> String {
        let n = layers.len();
        let fs_layers: Vec<_> = layers
            .iter()
            .rev()
            .map(|d| serde_json::json!({ "blobSum": d.to_string() }))
            .collect();
        let history: Vec<_> = (0..n)
            .rev()
            .map(|i| {
                let compat = if i == 0 {
                    serde_json::json!({ "id": format!("image{i}") })
                } else {
                    serde_json::json!({ "id": format!("image{i}"), "parent": format!("image{}", i - 1) })
                };
                serde_json::json!({ "v1Compatibility": compat.to_string() })
            })
            .collect();
        serde_json::json!({
            "schemaVersion": 1,
            "name": "library/test",
            "tag": "latest",
            "architecture": "amd64",
            "fsLayers": fs_layers,
            "history": history,
        })
        .to_string()
    }

    fn schema_v2(config: &OciDigest, layers: &[&OciDigest]) -> String {
        let layers: Vec<_> = layers
            .iter()
            .map(|d| {
                serde_json::json!({
                    "mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip",
                    "size": 4,
                    "digest": d.to_string(),
                })
            })
            .collect();
        serde_json::json!({
            "schemaVersion": 2,
            "mediaType": SCHEMA_V2_CONTENT_TYPE,
            "config": {
                "mediaType": "application/vnd.docker.container.image.v1+json",
                "size": 4,
                "digest": config.to_string(),
            },
            "layers": layers,
        })
        .to_string()
    }

    #[test]
    fn schema_v2_digests_config_first() {
        let (c, l1, l2) = (digest_of("config"), digest_of("l1"), digest_of("l2"));
        let m = ManifestSpec::try_from(schema_v2(&c, &[&l1, &l2]).as_bytes()).unwrap();
        assert_eq!(m.schema_version(), 2);
        assert_eq!(m.digests(), vec![c, l1, l2]);
        assert_eq!(m.image_id(), SCHEMA_V2_IMAGE_ID);
        assert!(m.images().is_empty());
        assert_eq!(m.content_type(), SCHEMA_V2_CONTENT_TYPE);
    }

    #[test]
    fn schema_v1_walks_history_oldest_first() {
        let (a, b, c) = (digest_of("a"), digest_of("b"), digest_of("c"));
        let m = ManifestSpec::try_from(schema_v1(&[&a, &b, &c]).as_bytes()).unwrap();
        assert_eq!(m.schema_version(), 1);
        assert_eq!(m.digests(), vec![a, b, c]);
        let ids: Vec<_> = m.images().into_iter().map(|i| i.id).collect();
        assert_eq!(ids, vec!["image0", "image1", "image2"]);
        assert_eq!(m.images()[1].parent.as_deref(), Some("image0"));
        assert_eq!(m.image_id(), "image2");
        assert_eq!(m.content_type(), SCHEMA_V1_CONTENT_TYPE);
    }

    #[test]
    fn schemas_normalize_to_the_same_digests() {
        let (a, b, c) = (digest_of("a"), digest_of("b"), digest_of("c"));
        let v1 = ManifestSpec::try_from(schema_v1(&[&a, &b, &c]).as_bytes()).unwrap();
        let v2 = ManifestSpec::try_from(schema_v2(&a, &[&b, &c]).as_bytes()).unwrap();
        assert_eq!(v1.digests(), v2.digests());
    }

    #[test]
    fn distinct_digests_drop_repeats() {
        let (a, b) = (digest_of("a"), digest_of("b"));
        let m = ManifestSpec::try_from(schema_v2(&a, &[&b, &a, &b]).as_bytes()).unwrap();
        assert_eq!(m.digests().len(), 4);
        assert_eq!(m.distinct_digests(), vec![a, b]);
    }

    #[rstest]
    #[case::schema_3(r#"{"schemaVersion": 3}"#, "INVALID_SCHEMA")]
    #[case::schema_0(r#"{"schemaVersion": 0, "layers": []}"#, "INVALID_SCHEMA")]
    #[case::not_json("meow", "MANIFEST_INVALID")]
    #[case::no_version(r#"{"layers": []}"#, "MANIFEST_INVALID")]
    #[case::v2_missing_config(r#"{"schemaVersion": 2, "layers": []}"#, "MANIFEST_INVALID")]
    #[case::v2_bad_digest(
        r#"{"schemaVersion": 2, "config": {"digest": "sha256:nope"}, "layers": []}"#,
        "MANIFEST_INVALID"
    )]
    #[case::v1_empty(r#"{"schemaVersion": 1, "fsLayers": [], "history": []}"#, "MANIFEST_INVALID")]
    #[case::v1_embedded_not_json(
        r#"{"schemaVersion": 1, "fsLayers": [{"blobSum": "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"}], "history": [{"v1Compatibility": "{"}]}"#,
        "MANIFEST_INVALID"
    )]
    #[case::v1_length_mismatch(
        r#"{"schemaVersion": 1, "fsLayers": [{"blobSum": "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"}], "history": []}"#,
        "MANIFEST_INVALID"
    )]
    fn rejects(#[case] body: &str, #[case] code: &str) {
        let err = ManifestSpec::try_from(body.as_bytes()).unwrap_err();
        let actual = serde_json::to_value(err.code()).unwrap();
        assert_eq!(actual, serde_json::Value::String(code.into()));
    }
}
