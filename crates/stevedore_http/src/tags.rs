use axum::extract::Extension;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use http::StatusCode;
use serde::Serialize;
use serde_json::json;

use stevedore_registry::RepositoryStore;

use super::errors::{Detail, Result};
use super::Stevedore;

pub fn router() -> Router {
    Router::new().route("/list", get(get_tags))
}

#[derive(Debug, Serialize)]
struct TagList {
    name: String,
    tags: Vec<String>,
}

async fn get_tags(Extension(repository): Extension<RepositoryStore>) -> Result<Response> {
    let name = repository.name().to_string();
    let tags = repository
        .get_manifest_store()
        .tags()
        .await
        .detail(json!({ "name": name }))?;

    Ok((StatusCode::OK, Json(TagList { name, tags })).into_response())
}

#[derive(Debug, Serialize)]
struct Catalog {
    repositories: Vec<String>,
}

pub(crate) async fn catalog(Extension(stevedore): Extension<Stevedore>) -> Result<Response> {
    let repositories = stevedore
        .registry()
        .catalog()
        .await?
        .iter()
        .map(ToString::to_string)
        .collect();

    Ok((StatusCode::OK, Json(Catalog { repositories })).into_response())
}
