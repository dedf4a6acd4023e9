//! ObjectStore errors

use thiserror;

pub type Result<T> = std::result::Result<T, Error>;

/// General purpose [`super::ObjectStore`] error handling.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("attribute {name} not found on {oid}")]
    AttributeNotFound { oid: String, name: String },

    #[error("offset {offset} is beyond the end of {oid} ({size} bytes)")]
    InvalidOffset { oid: String, offset: u64, size: u64 },

    #[error("size attribute of {0} is not an 8 byte little endian integer")]
    CorruptSize(String),

    #[error("short read from {oid} at offset {offset}")]
    ShortRead { oid: String, offset: u64 },

    #[error("chunk size must be greater than zero")]
    InvalidChunkSize,

    /// A write that stopped part way through. `written` bytes starting at the requested offset
    /// were persisted before `source` occurred; they are not rolled back.
    #[error("write interrupted after {written} bytes: {source}")]
    Interrupted { written: u64, source: Box<Error> },

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("http error")]
    HTTPError(#[from] http::Error),

    #[error("{0}")]
    ByteStreamError(#[from] aws_sdk_s3::primitives::ByteStreamError),

    #[error("aws sdk put object error")]
    AWSSDKPutObjectError(
        #[from] aws_sdk_s3::error::SdkError<aws_sdk_s3::operation::put_object::PutObjectError>,
    ),
    #[error("aws sdk get object error")]
    AWSSDKGetObjectError(
        #[from] aws_sdk_s3::error::SdkError<aws_sdk_s3::operation::get_object::GetObjectError>,
    ),
    #[error("aws sdk head object error")]
    AWSSDKHeadObjectError(
        #[from] aws_sdk_s3::error::SdkError<aws_sdk_s3::operation::head_object::HeadObjectError>,
    ),
    #[error("aws sdk delete object error")]
    AWSSDKDeleteObjectError(
        #[from]
        aws_sdk_s3::error::SdkError<aws_sdk_s3::operation::delete_object::DeleteObjectError>,
    ),
    #[error("aws sdk credentials error")]
    AWSSDKCredentialsError(#[from] aws_credential_types::provider::error::CredentialsError),

    #[error("key error: {0}")]
    KeyError(#[from] KeyError),
}

impl Error {
    /// Whether the error means the addressed object does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::IoError(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

/// Error type used when parsing [`super::Key`] from [`std::path::PathBuf`].
#[derive(thiserror::Error, Debug)]
pub enum KeyError {
    #[error("prefix not allowed")]
    PrefixNotAllowed,

    #[error("root dir not allowed")]
    RootDirNotAllowed,

    #[error("current dir (`.`) not allowed")]
    CurDirNotAllowed,

    #[error("parent dir (`..`) not allowed")]
    ParentDirNotAllowed,

    #[error("empty keys not allowed")]
    Empty,

    #[error("path components must be valid unicode")]
    PathComponentsMustBeValidUnicode,

    #[error("path components must match regex: {0}")]
    PathComponentsMustMatchRegex(String),
}
