use serde::Serialize;
use thiserror;

pub type Result<T> = std::result::Result<T, Error>;

fn suffix(msg: &Option<String>) -> String {
    match msg {
        Some(m) => format!(": {m}"),
        None => String::new(),
    }
}

/// Registry error taxonomy.
///
/// Every variant other than [`Error::BackendError`] corresponds to an [`ErrorCode`] that is
/// reported to clients. The optional string is a human readable message replacing the code's
/// default message.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("digest invalid{}", suffix(.0))]
    DigestInvalid(Option<String>),

    #[error("manifest invalid{}", suffix(.0))]
    ManifestInvalid(Option<String>),
    #[error("manifest unknown{}", suffix(.0))]
    ManifestUnknown(Option<String>),
    #[error("manifest blob unknown{}", suffix(.0))]
    ManifestBlobUnknown(Option<String>),
    #[error("invalid schema{}", suffix(.0))]
    InvalidSchema(Option<String>),

    #[error("blob unknown{}", suffix(.0))]
    BlobUnknown(Option<String>),
    #[error("blob upload invalid{}", suffix(.0))]
    BlobUploadInvalid(Option<String>),
    #[error("blob upload unknown{}", suffix(.0))]
    BlobUploadUnknown(Option<String>),
    #[error("range invalid{}", suffix(.0))]
    RangeInvalid(Option<String>),

    #[error("name invalid{}", suffix(.0))]
    NameInvalid(Option<String>),
    #[error("name unknown{}", suffix(.0))]
    NameUnknown(Option<String>),
    #[error("tag invalid{}", suffix(.0))]
    TagInvalid(Option<String>),

    #[error("content inconsistency{}", suffix(.0))]
    ContentInconsistency(Option<String>),
    #[error("content referenced{}", suffix(.0))]
    ContentReferenced(Option<String>),

    #[error("backend error: {0}")]
    BackendError(Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::DigestInvalid(_) => ErrorCode::DigestInvalid,
            Error::ManifestInvalid(_) => ErrorCode::ManifestInvalid,
            Error::ManifestUnknown(_) => ErrorCode::ManifestUnknown,
            Error::ManifestBlobUnknown(_) => ErrorCode::ManifestBlobUnknown,
            Error::InvalidSchema(_) => ErrorCode::InvalidSchema,
            Error::BlobUnknown(_) => ErrorCode::BlobUnknown,
            Error::BlobUploadInvalid(_) => ErrorCode::BlobUploadInvalid,
            Error::BlobUploadUnknown(_) => ErrorCode::BlobUploadUnknown,
            Error::RangeInvalid(_) => ErrorCode::RangeInvalid,
            Error::NameInvalid(_) => ErrorCode::NameInvalid,
            Error::NameUnknown(_) => ErrorCode::NameUnknown,
            Error::TagInvalid(_) => ErrorCode::TagInvalid,
            Error::ContentInconsistency(_) => ErrorCode::ContentInconsistency,
            Error::ContentReferenced(_) => ErrorCode::ContentReferenced,
            Error::BackendError(_) => ErrorCode::Unknown,
        }
    }

    /// Message to report to clients, falling back to the code's default message.
    pub fn message(&self) -> String {
        match self {
            Error::DigestInvalid(m)
            | Error::ManifestInvalid(m)
            | Error::ManifestUnknown(m)
            | Error::ManifestBlobUnknown(m)
            | Error::InvalidSchema(m)
            | Error::BlobUnknown(m)
            | Error::BlobUploadInvalid(m)
            | Error::BlobUploadUnknown(m)
            | Error::RangeInvalid(m)
            | Error::NameInvalid(m)
            | Error::NameUnknown(m)
            | Error::TagInvalid(m)
            | Error::ContentInconsistency(m)
            | Error::ContentReferenced(m) => m
                .clone()
                .unwrap_or_else(|| self.code().default_message().to_string()),
            Error::BackendError(_) => self.code().default_message().to_string(),
        }
    }

    /// Wrap an arbitrary error as a backend fault.
    pub fn backend<E>(e: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::BackendError(Box::new(e))
    }
}

/// Error codes reported in the `code` field of registry error payloads.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Unknown,
    DigestInvalid,
    ManifestInvalid,
    ManifestUnknown,
    ManifestBlobUnknown,
    InvalidSchema,
    BlobUnknown,
    BlobUploadInvalid,
    BlobUploadUnknown,
    RangeInvalid,
    NameInvalid,
    NameUnknown,
    TagInvalid,
    ContentInconsistency,
    ContentReferenced,
}

impl ErrorCode {
    pub fn default_message(&self) -> &'static str {
        match self {
            ErrorCode::Unknown => "unknown error",
            ErrorCode::DigestInvalid => "provided digest did not match uploaded content",
            ErrorCode::ManifestInvalid => "manifest invalid",
            ErrorCode::ManifestUnknown => "manifest unknown",
            ErrorCode::ManifestBlobUnknown => "blob unknown to registry",
            ErrorCode::InvalidSchema => "manifest schema version not supported",
            ErrorCode::BlobUnknown => "blob unknown to registry",
            ErrorCode::BlobUploadInvalid => "blob upload invalid",
            ErrorCode::BlobUploadUnknown => "blob upload unknown to registry",
            ErrorCode::RangeInvalid => "requested range does not follow the uploaded content",
            ErrorCode::NameInvalid => "invalid repository name",
            ErrorCode::NameUnknown => "repository name not known to registry",
            ErrorCode::TagInvalid => "manifest tag did not match URI",
            ErrorCode::ContentInconsistency => "blob reference count is inconsistent",
            ErrorCode::ContentReferenced => "content referenced",
        }
    }
}
