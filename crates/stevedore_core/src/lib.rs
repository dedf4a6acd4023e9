pub mod errors;
pub use errors::{Error, ErrorCode, Result};

mod oci_digest;
pub use oci_digest::{Digester, OciDigest};

pub mod manifest;
pub use manifest::ManifestSpec;

pub mod records;

mod reference;
pub use reference::{validate_tag, ManifestRef, RepositoryName};
