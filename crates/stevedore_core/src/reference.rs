use once_cell::sync::Lazy;
use regex::Regex;

use crate::errors::{Error, Result};
use crate::oci_digest::OciDigest;

static NAME_COMPONENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]+(?:[._-][a-z0-9]+)*$").unwrap());

static TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-zA-Z0-9_][a-zA-Z0-9._-]{0,127}$").unwrap());

/// A `<namespace>/<repository>` pair as it appears in registry API paths.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RepositoryName {
    namespace: String,
    repository: String,
}

impl RepositoryName {
    pub fn new(namespace: &str, repository: &str) -> Result<Self> {
        for component in [namespace, repository] {
            if !NAME_COMPONENT.is_match(component) {
                return Err(Error::NameInvalid(Some(format!(
                    "{namespace}/{repository}"
                ))));
            }
        }
        Ok(Self {
            namespace: namespace.to_string(),
            repository: repository.to_string(),
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }
}

impl std::fmt::Display for RepositoryName {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.repository)
    }
}

pub fn validate_tag(tag: &str) -> Result<()> {
    if TAG.is_match(tag) {
        Ok(())
    } else {
        Err(Error::TagInvalid(Some(tag.to_string())))
    }
}

/// The `<reference>` portion of `/v2/<namespace>/<repository>/manifests/<reference>`: either the
/// digest of a manifest or a tag matching `[a-zA-Z0-9_][a-zA-Z0-9._-]{0,127}`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ManifestRef {
    Digest(OciDigest),
    Tag(String),
}

impl std::str::FromStr for ManifestRef {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if let Ok(dgst) = OciDigest::try_from(s) {
            return Ok(Self::Digest(dgst));
        }
        validate_tag(s)?;
        Ok(Self::Tag(String::from(s)))
    }
}

impl std::fmt::Display for ManifestRef {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ManifestRef::Digest(d) => write!(f, "{d}"),
            ManifestRef::Tag(t) => write!(f, "{t}"),
        }
    }
}
