//! # Stevedore HTTP
//!
//! `stevedore_http` serves a [`stevedore_registry::Registry`] over a Docker Registry V2 style API:
//!
//! | method           | path                                              |
//! |------------------|---------------------------------------------------|
//! | `GET`            | `/v2/`                                            |
//! | `GET`            | `/v2/_catalog`                                    |
//! | `GET`            | `/v2/<namespace>/<repository>/tags/list`          |
//! | `GET HEAD DELETE`| `/v2/<namespace>/<repository>/blobs/<digest>`     |
//! | `POST`           | `/v2/<namespace>/<repository>/blobs/uploads/`     |
//! | `GET PATCH PUT DELETE` | `/v2/<namespace>/<repository>/blobs/uploads/<uuid>` |
//! | `GET HEAD PUT DELETE`  | `/v2/<namespace>/<repository>/manifests/<reference>` |
//!
//! Failures are reported as `{"errors": [{"code", "message", "detail"}]}`.
//!
//! ## Example `main.rs`
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use stevedore_http::Stevedore;
//! use stevedore_metadata::MemoryRecords;
//! use stevedore_registry::{Registry, StorageConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let storage: StorageConfig = serde_yaml::from_str("root: /tmp/stevedore")?;
//!     let registry = Registry::new(Arc::new(MemoryRecords::new()), &storage).await?;
//!     let router = Stevedore::new(registry).router()?;
//!
//!     axum::Server::bind(&"0.0.0.0:13030".parse()?)
//!         .serve(router.into_make_service())
//!         .await?;
//!     Ok(())
//! }
//! ```
use std::collections::HashMap;
use std::str::FromStr;

use axum::extract::{Path, State};
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::{Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Extension, Router};
use http::Response as HttpResponse;
use http_body::Body;
use serde::{de, Deserialize, Deserializer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::{self, TraceLayer};

mod errors;
pub(crate) use errors::{Detail, Error, Result};

mod blobs;
mod headers;
mod manifests;
mod tags;

use stevedore_core::RepositoryName;
use stevedore_registry::Registry;

pub(crate) static DOCKER_CONTENT_DIGEST: HeaderName =
    HeaderName::from_static("docker-content-digest");
pub(crate) static DOCKER_UPLOAD_UUID: HeaderName = HeaderName::from_static("docker-upload-uuid");

/// Adds an [`axum::Extension`] holding the [`stevedore_registry::RepositoryStore`] named by the
/// `namespace` and `repository` path parameters, for use in repository-scoped handlers.
pub async fn add_repository_extension<B>(
    State(stevedore): State<Stevedore>,
    Path(path_params): Path<HashMap<String, String>>,
    mut req: Request<B>,
    next: Next<B>,
) -> Result<Response> {
    let namespace = path_params
        .get("namespace")
        .ok_or(Error::MissingPathParameter("namespace"))?;
    let repository = path_params
        .get("repository")
        .ok_or(Error::MissingPathParameter("repository"))?;

    let name = RepositoryName::new(namespace, repository).detail(serde_json::json!({
        "namespace": namespace,
        "repository": repository,
    }))?;
    req.extensions_mut()
        .insert(stevedore.registry.repository(name));

    Ok(next.run(req).await)
}

/// Serde deserialization decorator to map empty Strings to None,
fn empty_string_as_none<'de, D, T>(de: D) -> std::result::Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let opt = Option::<String>::deserialize(de)?;
    match opt.as_deref() {
        None | Some("") => Ok(None),
        Some(s) => FromStr::from_str(s).map_err(de::Error::custom).map(Some),
    }
}

fn maybe_get_content_length(response: &HttpResponse<impl Body>) -> Option<HeaderValue> {
    response
        .body()
        .size_hint()
        .exact()
        .map(HeaderValue::from)
}

async fn version() -> Result<Response> {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str("application/json")?,
    );
    Ok((StatusCode::OK, headers, "{}").into_response())
}

/// Provides an [`axum::Router`] serving a [`Registry`].
#[derive(Clone)]
pub struct Stevedore {
    registry: Registry,
}

impl Stevedore {
    pub fn new(registry: Registry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Return an [`axum::Router`] implementing the registry API.
    pub fn router(&self) -> Result<axum::Router> {
        let repository = Router::new()
            .nest("/blobs", blobs::router())
            .nest("/manifests", manifests::router())
            .nest("/tags", tags::router())
            .route_layer(middleware::from_fn_with_state(
                self.clone(),
                add_repository_extension,
            ));

        let app = Router::new()
            .route("/v2/", get(version))
            .route("/v2/_catalog", get(tags::catalog))
            .nest("/v2/:namespace/:repository", repository)
            .layer(Extension(self.clone()))
            .layer(
                TraceLayer::new_for_http()
                    .make_span_with(trace::DefaultMakeSpan::new().include_headers(true))
                    .on_response(trace::DefaultOnResponse::new())
                    .on_request(trace::DefaultOnRequest::new()),
            )
            .layer(SetResponseHeaderLayer::if_not_present(
                HeaderName::from_str("docker-distribution-api-version")?,
                HeaderValue::from_str("registry/2.0")?,
            ))
            .layer(SetResponseHeaderLayer::if_not_present(
                HeaderName::from_str("content-type")?,
                HeaderValue::from_str("application/json")?,
            ))
            .layer(SetResponseHeaderLayer::if_not_present(
                header::CONTENT_LENGTH,
                maybe_get_content_length,
            ));

        Ok(app)
    }
}
