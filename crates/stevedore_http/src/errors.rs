use axum::response::{IntoResponse, Response};
use http::StatusCode;
use serde::Serialize;
use serde_json::Value;
use thiserror;

use stevedore_core::{Error as CoreError, ErrorCode};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("http invalid header name")]
    HTTPInvalidHeaderName(#[from] http::header::InvalidHeaderName),
    #[error("http invalid header value")]
    HTTPInvalidHeaderValue(#[from] http::header::InvalidHeaderValue),

    #[error("missing path parameter: {0}")]
    MissingPathParameter(&'static str),

    /// A registry error together with the request context it happened in.
    #[error("{source}")]
    Stevedore {
        source: CoreError,
        detail: Option<Value>,
    },
}

impl From<CoreError> for Error {
    fn from(source: CoreError) -> Self {
        Error::Stevedore {
            source,
            detail: None,
        }
    }
}

impl From<stevedore_registry::Error> for Error {
    fn from(e: stevedore_registry::Error) -> Self {
        CoreError::from(e).into()
    }
}

/// Attach request context (repository, tag, digest, session) to a failed registry call.
pub(crate) trait Detail<T> {
    fn detail(self, detail: Value) -> Result<T>;
}

impl<T, E> Detail<T> for std::result::Result<T, E>
where
    E: Into<CoreError>,
{
    fn detail(self, detail: Value) -> Result<T> {
        self.map_err(|e| Error::Stevedore {
            source: e.into(),
            detail: Some(detail),
        })
    }
}

#[derive(Debug, Serialize)]
struct ErrorInfo {
    code: ErrorCode,
    message: String,
    detail: Option<Value>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    errors: Vec<ErrorInfo>,
}

pub(crate) fn status_code(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::DigestInvalid
        | ErrorCode::ManifestInvalid
        | ErrorCode::NameInvalid
        | ErrorCode::TagInvalid
        | ErrorCode::InvalidSchema
        | ErrorCode::BlobUploadInvalid => StatusCode::BAD_REQUEST,
        ErrorCode::BlobUnknown
        | ErrorCode::BlobUploadUnknown
        | ErrorCode::ManifestUnknown
        | ErrorCode::ManifestBlobUnknown
        | ErrorCode::NameUnknown => StatusCode::NOT_FOUND,
        ErrorCode::RangeInvalid => StatusCode::RANGE_NOT_SATISFIABLE,
        ErrorCode::ContentReferenced => StatusCode::CONFLICT,
        ErrorCode::ContentInconsistency | ErrorCode::Unknown => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[inline]
fn into_error_response(e: CoreError, detail: Option<Value>) -> Response {
    let code = e.code();
    let status = status_code(code);
    if status.is_server_error() {
        tracing::warn!("{e}");
    } else {
        tracing::debug!("{e}");
    }
    let response = ErrorResponse {
        errors: vec![ErrorInfo {
            code,
            message: e.message(),
            detail,
        }],
    };
    (status, axum::Json(response)).into_response()
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        match self {
            Error::Stevedore { source, detail } => into_error_response(source, detail),
            Error::MissingPathParameter(_) => {
                (StatusCode::BAD_REQUEST, format!("{}", self)).into_response()
            }
            Error::HTTPInvalidHeaderName(_) | Error::HTTPInvalidHeaderValue(_) => {
                tracing::warn!("{self}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    String::from("internal server error"),
                )
                    .into_response()
            }
        }
    }
}
