use std::collections::HashMap;

use ::http::StatusCode;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Extension, Path, Query};
use axum::http::header::{self, HeaderMap, HeaderValue};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use headers::Header;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use stevedore_core::{Error as CoreError, OciDigest};
use stevedore_registry::RepositoryStore;

use super::empty_string_as_none;
use super::errors::{Detail, Error, Result};
use super::headers::{ContentRange, Range};
use super::{DOCKER_CONTENT_DIGEST, DOCKER_UPLOAD_UUID};

pub fn router() -> Router {
    Router::new()
        .route(
            "/:digest",
            get(get_blob).delete(delete_blob).head(head_blob),
        )
        .route("/uploads/", post(uploads_post))
        .route(
            "/uploads/:session_uuid",
            get(uploads_get)
                .patch(uploads_patch)
                .put(uploads_put)
                .delete(uploads_delete),
        )
        .layer(DefaultBodyLimit::disable())
}

#[derive(Debug, Deserialize)]
struct DigestParam {
    #[serde(default, deserialize_with = "empty_string_as_none")]
    digest: Option<String>,
}

fn digest_param(path_params: &HashMap<String, String>) -> Result<OciDigest> {
    let digest = path_params
        .get("digest")
        .ok_or(Error::MissingPathParameter("digest"))?;
    OciDigest::try_from(digest.as_str()).detail(json!({ "digest": digest }))
}

fn session_param(path_params: &HashMap<String, String>) -> Result<Uuid> {
    let session = path_params
        .get("session_uuid")
        .ok_or(Error::MissingPathParameter("session_uuid"))?;
    Uuid::parse_str(session)
        .map_err(|e| CoreError::BlobUploadUnknown(Some(e.to_string())))
        .detail(json!({ "uuid": session }))
}

/// The `Content-Range` of an upload chunk. A header that is present but unreadable is
/// `RANGE_INVALID` rather than ignored.
fn content_range(headers: &HeaderMap) -> Result<Option<ContentRange>> {
    let mut values = headers.get_all(ContentRange::name()).iter().peekable();
    if values.peek().is_none() {
        return Ok(None);
    }
    let range = ContentRange::decode(&mut values).map_err(|_| {
        let raw = headers
            .get(ContentRange::name())
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        CoreError::RangeInvalid(Some(format!("malformed content-range {raw:?}")))
    })?;
    Ok(Some(range))
}

fn blob_headers(repository: &RepositoryStore, digest: &OciDigest) -> Result<HeaderMap> {
    let location = format!("/v2/{}/blobs/{}", repository.name(), digest);
    let mut headers = HeaderMap::new();
    headers.insert(header::LOCATION, HeaderValue::from_str(&location)?);
    headers.insert(
        DOCKER_CONTENT_DIGEST.clone(),
        HeaderValue::from_str(&digest.to_string())?,
    );
    Ok(headers)
}

fn session_headers(repository: &RepositoryStore, uuid: &Uuid, length: u64) -> Result<HeaderMap> {
    let location = format!("/v2/{}/blobs/uploads/{}", repository.name(), uuid);
    let mut headers = HeaderMap::new();
    headers.insert(header::LOCATION, HeaderValue::from_str(&location)?);
    headers.insert(
        DOCKER_UPLOAD_UUID.clone(),
        HeaderValue::from_str(&uuid.to_string())?,
    );
    let range: String = (&Range::accumulated(length)).into();
    headers.insert(Range::name(), HeaderValue::from_str(&range)?);
    Ok(headers)
}

async fn get_blob(
    Extension(repository): Extension<RepositoryStore>,
    Path(path_params): Path<HashMap<String, String>>,
) -> Result<Response> {
    let digest = digest_param(&path_params)?;
    let (blob, body) = repository
        .get_blob_store()
        .read(&digest)
        .await
        .detail(json!({ "name": repository.name().to_string(), "digest": digest.to_string() }))?;

    let mut headers = HeaderMap::new();
    headers.insert(
        DOCKER_CONTENT_DIGEST.clone(),
        HeaderValue::from_str(&digest.to_string())?,
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(blob.size));
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    Ok((StatusCode::OK, headers, body).into_response())
}

async fn head_blob(
    Extension(repository): Extension<RepositoryStore>,
    Path(path_params): Path<HashMap<String, String>>,
) -> Result<Response> {
    let digest = digest_param(&path_params)?;
    let blob = repository
        .get_blob_store()
        .get(&digest)
        .await?
        .ok_or_else(|| CoreError::BlobUnknown(None))
        .detail(json!({ "name": repository.name().to_string(), "digest": digest.to_string() }))?;

    let mut headers = HeaderMap::new();
    headers.insert(
        DOCKER_CONTENT_DIGEST.clone(),
        HeaderValue::from_str(&digest.to_string())?,
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(blob.size));
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    Ok((StatusCode::OK, headers).into_response())
}

async fn delete_blob(
    Extension(repository): Extension<RepositoryStore>,
    Path(path_params): Path<HashMap<String, String>>,
) -> Result<Response> {
    let digest = digest_param(&path_params)?;
    repository
        .get_blob_store()
        .delete(&digest)
        .await
        .detail(json!({ "digest": digest.to_string() }))?;

    Ok((StatusCode::ACCEPTED, "").into_response())
}

// /v2/<namespace>/<repository>/blobs/uploads/
//
// * with a `digest` query parameter the body is the entire blob
// * otherwise a session is opened for a POST-PATCH-PUT or POST-PUT sequence
async fn uploads_post(
    Extension(repository): Extension<RepositoryStore>,
    Query(params): Query<DigestParam>,
    body: Bytes,
) -> Result<Response> {
    let uploads = repository.get_upload_session_store();
    match params.digest {
        Some(digest) => {
            let digest = OciDigest::try_from(digest.as_str()).detail(json!({ "digest": digest }))?;
            uploads
                .upload(&digest, &body)
                .await
                .detail(json!({ "digest": digest.to_string() }))?;
            tracing::debug!("monolithic upload of {digest} to {}", repository.name());

            let headers = blob_headers(&repository, &digest)?;
            Ok((StatusCode::CREATED, headers, "").into_response())
        }
        None => {
            let uuid = uploads.open().await?;
            let headers = session_headers(&repository, &uuid, 0)?;
            Ok((StatusCode::ACCEPTED, headers, "").into_response())
        }
    }
}

async fn uploads_patch(
    Extension(repository): Extension<RepositoryStore>,
    Path(path_params): Path<HashMap<String, String>>,
    request_headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let uuid = session_param(&path_params)?;
    let range = content_range(&request_headers)?;
    let detail = json!({
        "uuid": uuid.to_string(),
        "range": range.as_ref().map(|r| format!("{}-{}", r.start, r.end)),
    });

    let length = repository
        .get_upload_session_store()
        .append(&uuid, range.map(|r| r.start..=r.end), &body)
        .await
        .detail(detail)?;

    let headers = session_headers(&repository, &uuid, length)?;
    Ok((StatusCode::ACCEPTED, headers, "").into_response())
}

// /v2/<namespace>/<repository>/blobs/uploads/<uuid>?digest=<digest>
//
// The body, if any, is the final chunk. `digest` refers to the entire blob.
async fn uploads_put(
    Extension(repository): Extension<RepositoryStore>,
    Path(path_params): Path<HashMap<String, String>>,
    Query(params): Query<DigestParam>,
    request_headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let uuid = session_param(&path_params)?;
    let range = content_range(&request_headers)?;
    let digest = params
        .digest
        .ok_or_else(|| CoreError::DigestInvalid(Some(String::from("missing digest parameter"))))?;
    let digest = OciDigest::try_from(digest.as_str()).detail(json!({ "digest": digest }))?;

    let uploads = repository.get_upload_session_store();
    let context = json!({ "uuid": uuid.to_string(), "digest": digest.to_string() });
    let tail: &[u8] = match range {
        Some(range) if !body.is_empty() => {
            uploads
                .append(&uuid, Some(range.start..=range.end), &body)
                .await
                .detail(context.clone())?;
            &[]
        }
        _ => &body,
    };
    uploads
        .commit(&uuid, &digest, tail)
        .await
        .detail(context)?;

    let mut headers = blob_headers(&repository, &digest)?;
    headers.insert(
        DOCKER_UPLOAD_UUID.clone(),
        HeaderValue::from_str(&uuid.to_string())?,
    );
    Ok((StatusCode::CREATED, headers, "").into_response())
}

async fn uploads_get(
    Extension(repository): Extension<RepositoryStore>,
    Path(path_params): Path<HashMap<String, String>>,
) -> Result<Response> {
    let uuid = session_param(&path_params)?;
    let length = repository
        .get_upload_session_store()
        .status(&uuid)
        .await
        .detail(json!({ "uuid": uuid.to_string() }))?;

    let headers = session_headers(&repository, &uuid, length)?;
    Ok((StatusCode::NO_CONTENT, headers, "").into_response())
}

async fn uploads_delete(
    Extension(repository): Extension<RepositoryStore>,
    Path(path_params): Path<HashMap<String, String>>,
) -> Result<Response> {
    let uuid = session_param(&path_params)?;
    repository
        .get_upload_session_store()
        .abort(&uuid)
        .await
        .detail(json!({ "uuid": uuid.to_string() }))?;

    Ok((StatusCode::NO_CONTENT, "").into_response())
}
