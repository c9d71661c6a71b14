//! # ociserver
//!
//! An OCI Distribution v2 HTTP front end over any
//! [`ociregistry::Registry`] implementation.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = ocimem::MemRegistry::new();
//! let router = ociserver::ServerBuilder::new().registry(registry).build();
//!
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:5000").await?;
//! axum::serve(listener, router).await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use serde_json::json;

use ociregistry::{Error, Registry};

mod handlers;
mod parse;

use self::parse::{parse_path, query_params, query_value, Route};

/// Hook for rendering errors to HTTP responses.
pub type WriteErrorHook = Arc<dyn Fn(&Error) -> Response + Send + Sync>;

/// Default cap on the page size of list endpoints.
const DEFAULT_MAX_PAGE_SIZE: usize = 1000;

/// Builder for the registry server.
pub struct ServerBuilder {
    registry: Option<Arc<dyn Registry>>,
    write_error: Option<WriteErrorHook>,
    disable_referrers_api: bool,
    max_page_size: usize,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBuilder {
    pub fn new() -> Self {
        ServerBuilder {
            registry: None,
            write_error: None,
            disable_referrers_api: false,
            max_page_size: DEFAULT_MAX_PAGE_SIZE,
        }
    }

    /// Set the registry implementation backing the server.
    pub fn registry(mut self, registry: impl Registry) -> Self {
        self.registry = Some(Arc::new(registry));
        self
    }

    /// Set an already-shared registry implementation.
    pub fn shared_registry(mut self, registry: Arc<dyn Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Replace the default error renderer. The hook typically adds headers
    /// and delegates to [`error_response`] for the body.
    pub fn write_error(mut self, hook: impl Fn(&Error) -> Response + Send + Sync + 'static) -> Self {
        self.write_error = Some(Arc::new(hook));
        self
    }

    /// Serve `404` from the referrers endpoint so clients fall back to the
    /// referrers-tag scheme.
    pub fn disable_referrers_api(mut self) -> Self {
        self.disable_referrers_api = true;
        self
    }

    /// Cap the page size honored by list endpoints.
    pub fn max_page_size(mut self, n: usize) -> Self {
        self.max_page_size = n.max(1);
        self
    }

    /// Build the server.
    ///
    /// Returns a `Router` that can be served with any tower-compatible
    /// server.
    pub fn build(self) -> Router {
        let state = ServerState {
            registry: self.registry.expect("a registry implementation must be configured"),
            opts: Arc::new(Opts {
                write_error: self.write_error,
                disable_referrers_api: self.disable_referrers_api,
                max_page_size: self.max_page_size,
            }),
        };
        Router::new()
            .route("/v2/", get(version_check))
            .fallback(dispatch)
            .with_state(state)
    }
}

#[derive(Clone)]
pub(crate) struct ServerState {
    pub(crate) registry: Arc<dyn Registry>,
    pub(crate) opts: Arc<Opts>,
}

pub(crate) struct Opts {
    write_error: Option<WriteErrorHook>,
    pub(crate) disable_referrers_api: bool,
    pub(crate) max_page_size: usize,
}

/// API version check endpoint: 200 OK with an empty JSON body.
async fn version_check() -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::OK, Json(json!({})))
}

async fn dispatch(State(state): State<ServerState>, req: Request) -> Response {
    match handle(&state, req).await {
        Ok(response) => response,
        Err(err) => {
            tracing::debug!(error = %err, "request failed");
            match &state.opts.write_error {
                Some(hook) => hook(&err),
                None => error_response(&err),
            }
        }
    }
}

/// Render an error as its JSON wire form, served with the status its
/// error code implies. Custom [`ServerBuilder::write_error`] hooks can
/// delegate here after adding their own headers.
pub fn error_response(err: &Error) -> Response {
    let (wire, status) = err.to_wire();
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        Json(wire),
    )
        .into_response()
}

pub(crate) fn page_not_found() -> Response {
    (StatusCode::NOT_FOUND, "page not found").into_response()
}

fn method_not_allowed() -> Response {
    (StatusCode::METHOD_NOT_ALLOWED, "method not allowed").into_response()
}

async fn handle(state: &ServerState, req: Request) -> Result<Response, Error> {
    let Some(route) = parse_path(req.uri().path()) else {
        return Ok(page_not_found());
    };
    let params = query_params(req.uri().query());
    let method = req.method().clone();

    match (method.as_str(), route) {
        ("GET" | "HEAD", Route::Base) => Ok((StatusCode::OK, Json(json!({}))).into_response()),
        ("GET", Route::Catalog) => handlers::list_repositories(state, &params).await,
        (method @ ("GET" | "HEAD"), Route::Blob { repo, digest }) => {
            handlers::get_blob(state, &repo, &digest, req.headers(), method == "HEAD").await
        }
        ("DELETE", Route::Blob { repo, digest }) => {
            handlers::delete_blob(state, &repo, &digest).await
        }
        ("POST", Route::UploadStart { repo }) => {
            handlers::start_upload(state, &repo, &params, req).await
        }
        ("GET", Route::Upload { repo, id }) => handlers::upload_status(state, &repo, &id).await,
        ("PATCH", Route::Upload { repo, id }) => {
            handlers::patch_upload(state, &repo, &id, req).await
        }
        ("PUT", Route::Upload { repo, id }) => {
            handlers::put_upload(state, &repo, &id, &params, req).await
        }
        ("DELETE", Route::Upload { repo, id }) => handlers::cancel_upload(state, &repo, &id).await,
        (method @ ("GET" | "HEAD"), Route::Manifest { repo, reference }) => {
            handlers::get_manifest(state, &repo, &reference, req.headers(), method == "HEAD").await
        }
        ("PUT", Route::Manifest { repo, reference }) => {
            handlers::put_manifest(state, &repo, &reference, req).await
        }
        ("DELETE", Route::Manifest { repo, reference }) => {
            handlers::delete_manifest(state, &repo, &reference).await
        }
        ("GET", Route::TagsList { repo }) => handlers::list_tags(state, &repo, &params).await,
        ("GET", Route::Referrers { repo, digest }) => {
            let artifact_type = query_value(&params, "artifactType").map(str::to_string);
            handlers::list_referrers(state, &repo, &digest, artifact_type, &params).await
        }
        _ => Ok(method_not_allowed()),
    }
}

pub(crate) async fn read_body(req: Request) -> Result<bytes::Bytes, Error> {
    axum::body::to_bytes(req.into_body(), usize::MAX)
        .await
        .map_err(|err| Error::other(err).context("cannot read request body"))
}

pub(crate) fn stream_body(reader: ociregistry::BlobReader) -> Body {
    Body::from_stream(reader.into_stream())
}
