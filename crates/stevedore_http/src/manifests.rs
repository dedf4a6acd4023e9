use std::collections::HashMap;
use std::str::FromStr;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Extension, Path};
use axum::http::header::{self, HeaderMap, HeaderValue};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Router, TypedHeader};
use headers::UserAgent;
use http::StatusCode;
use serde_json::json;

use stevedore_core::manifest::content_type_for_schema;
use stevedore_core::records::Tag;
use stevedore_core::{ManifestRef, ManifestSpec, OciDigest};
use stevedore_registry::RepositoryStore;

use super::errors::{Detail, Error, Result};
use super::DOCKER_CONTENT_DIGEST;

pub fn router() -> Router {
    Router::new()
        .route(
            "/:reference",
            get(get_manifest)
                .delete(delete_manifest)
                .put(put_manifest)
                .head(head_manifest),
        )
        .layer(DefaultBodyLimit::max(6 * 1024 * 1024))
}

fn reference_param(path_params: &HashMap<String, String>) -> Result<(String, ManifestRef)> {
    let reference = path_params
        .get("reference")
        .ok_or(Error::MissingPathParameter("reference"))?;
    let manifest_ref =
        ManifestRef::from_str(reference).detail(json!({ "reference": reference }))?;
    Ok((reference.clone(), manifest_ref))
}

async fn lookup(
    repository: &RepositoryStore,
    path_params: &HashMap<String, String>,
) -> Result<(Tag, HeaderMap)> {
    let (reference, manifest_ref) = reference_param(path_params)?;
    let tag = repository
        .get_manifest_store()
        .get(&manifest_ref)
        .await
        .detail(json!({ "name": repository.name().to_string(), "reference": reference }))?;

    // stored verbatim, so the digest is recomputed over the exact bytes served
    let digest = OciDigest::from(tag.manifest.as_bytes());
    let content_type = ManifestSpec::try_from(tag.manifest.as_bytes())
        .map(|spec| spec.content_type())
        .unwrap_or_else(|_| String::from(content_type_for_schema(tag.schema)));

    let mut headers = HeaderMap::new();
    headers.insert(
        DOCKER_CONTENT_DIGEST.clone(),
        HeaderValue::from_str(&digest.to_string())?,
    );
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_str(&content_type)?);
    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from(tag.manifest.len()),
    );
    Ok((tag, headers))
}

async fn head_manifest(
    Extension(repository): Extension<RepositoryStore>,
    Path(path_params): Path<HashMap<String, String>>,
) -> Result<Response> {
    let (_, headers) = lookup(&repository, &path_params).await?;
    Ok((StatusCode::OK, headers).into_response())
}

async fn get_manifest(
    Extension(repository): Extension<RepositoryStore>,
    Path(path_params): Path<HashMap<String, String>>,
) -> Result<Response> {
    let (tag, headers) = lookup(&repository, &path_params).await?;
    Ok((StatusCode::OK, headers, tag.manifest).into_response())
}

/// Schema 1 manifests are answered with `202 Accepted`, schema 2 with `201 Created`.
async fn put_manifest(
    Extension(repository): Extension<RepositoryStore>,
    user_agent: Option<TypedHeader<UserAgent>>,
    Path(path_params): Path<HashMap<String, String>>,
    bytes: Bytes,
) -> Result<Response> {
    let tag = path_params
        .get("reference")
        .ok_or(Error::MissingPathParameter("reference"))?;
    let agent = user_agent
        .map(|TypedHeader(ua)| ua.as_str().to_string())
        .unwrap_or_default();

    let put = repository
        .get_manifest_store()
        .put(tag, bytes, &agent)
        .await
        .detail(json!({ "name": repository.name().to_string(), "tag": tag }))?;

    let location = format!("/v2/{}/manifests/{}", repository.name(), put.digest);
    let mut headers = HeaderMap::new();
    headers.insert(header::LOCATION, HeaderValue::from_str(&location)?);
    headers.insert(
        DOCKER_CONTENT_DIGEST.clone(),
        HeaderValue::from_str(&put.digest.to_string())?,
    );

    let status = match put.schema {
        1 => StatusCode::ACCEPTED,
        _ => StatusCode::CREATED,
    };
    Ok((status, headers, "").into_response())
}

async fn delete_manifest(
    Extension(repository): Extension<RepositoryStore>,
    Path(path_params): Path<HashMap<String, String>>,
) -> Result<Response> {
    let (reference, manifest_ref) = reference_param(&path_params)?;
    repository
        .get_manifest_store()
        .delete(&manifest_ref)
        .await
        .detail(json!({ "name": repository.name().to_string(), "reference": reference }))?;

    Ok((StatusCode::OK, "{}").into_response())
}
