//! # ociclient
//!
//! An HTTP client for OCI distribution registries, implementing the
//! [`ociregistry::Registry`] capability trait.
//!
//! Each operation issues spec-conformant requests against the registry,
//! attaching the authorization [`Scope`] it requires to the request
//! extensions so an [`ociauth::AuthLayer`] in the transport stack can
//! negotiate tokens. Transports are pluggable tower services; the default
//! speaks TCP (and TLS unless the client is built insecure) through
//! `hyperdriver`.
//!
//! ```no_run
//! use ociregistry::Registry as _;
//!
//! # async fn example() -> ociregistry::Result<()> {
//! let client = ociclient::Client::builder()
//!     .auth(ociauth::Config::load().expect("docker config loads"))
//!     .build("registry.example.com")?;
//! let desc = client.resolve_tag("library/hello", "latest").await?;
//! println!("{}", desc.digest);
//! # Ok(())
//! # }
//! ```

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt as _, TryStreamExt as _};
use http::{header, Method, StatusCode, Uri};
use http_body_util::BodyExt as _;
use hyperdriver::Body;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde::Deserialize;
use tower::util::BoxCloneService;
use tower::ServiceExt as _;

use ociauth::{AuthLayer, RequiredScope, Scope};
use ociregistry::{
    error_listing, mediatype, refname, BlobReader, BlobWriter, BoxError, Descriptor, Digest,
    Error, ErrorCode, Listing, ReferrersRequest, Registry, Result, TagsRequest, WireErrors,
};

mod referrers;
mod writer;

use self::writer::ClientWriter;

/// The transport a [`Client`] sends requests through.
pub type Transport = BoxCloneService<http::Request<Body>, http::Response<Body>, BoxError>;

/// Attempts made for a request before giving up on transport errors.
const RETRY_ATTEMPTS: usize = 3;

/// How much of an error response body is read when decoding wire errors.
const ERROR_BODY_LIMIT: usize = 8 * 1024;

/// Default page size requested from list endpoints.
const DEFAULT_LIST_PAGE_SIZE: usize = 1000;

/// A registry client. Cheap to clone.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

struct Inner {
    base: String,
    // BoxCloneService is Send but not Sync; the lock is held only long
    // enough to clone a per-request handle.
    transport: Mutex<Transport>,
    list_page_size: usize,
    debug_id: String,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("base", &self.inner.base)
            .field("debug_id", &self.inner.debug_id)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Client`].
pub struct ClientBuilder {
    insecure: bool,
    transport: Option<Transport>,
    auth: Option<ociauth::Config>,
    list_page_size: usize,
    debug_id: Option<String>,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        ClientBuilder {
            insecure: false,
            transport: None,
            auth: None,
            list_page_size: DEFAULT_LIST_PAGE_SIZE,
            debug_id: None,
        }
    }
}

impl ClientBuilder {
    /// Use plain HTTP instead of HTTPS.
    pub fn insecure(mut self) -> Self {
        self.insecure = true;
        self
    }

    /// Replace the HTTP transport. Useful for tests and for stacking
    /// custom middleware.
    pub fn transport(mut self, transport: Transport) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Wrap the transport with an [`ociauth::AuthLayer`] resolving
    /// credentials from the given configuration.
    pub fn auth(mut self, config: ociauth::Config) -> Self {
        self.auth = Some(config);
        self
    }

    /// Page size requested from list endpoints.
    pub fn list_page_size(mut self, n: usize) -> Self {
        self.list_page_size = n.max(1);
        self
    }

    /// Identifier used in log output for this client.
    pub fn debug_id(mut self, id: impl Into<String>) -> Self {
        self.debug_id = Some(id.into());
        self
    }

    /// Build a client for the registry at `host` (a hostname, optionally
    /// with a port).
    pub fn build(self, host: &str) -> Result<Client> {
        let scheme = if self.insecure { "http" } else { "https" };
        let base = format!("{scheme}://{host}");
        let _: Uri = base
            .parse()
            .map_err(|err| Error::other(err).context(format!("invalid registry host {host:?}")))?;

        let mut transport = self.transport.unwrap_or_else(default_transport);
        if let Some(config) = self.auth {
            transport = BoxCloneService::new(tower::Layer::layer(&AuthLayer::new(config), transport));
        }
        Ok(Client {
            inner: Arc::new(Inner {
                base,
                transport: Mutex::new(transport),
                list_page_size: self.list_page_size,
                debug_id: self.debug_id.unwrap_or_else(|| "ociclient".to_string()),
            }),
        })
    }
}

fn default_transport() -> Transport {
    let service = hyperdriver::Client::build_tcp_http()
        .with_default_tls()
        .build_service();
    BoxCloneService::new(service.map_err(BoxError::from))
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    /// A client for `host` with the default transport and no credentials.
    pub fn new(host: &str) -> Result<Client> {
        Client::builder().build(host)
    }

    pub(crate) fn request(&self, method: Method, path_and_query: &str) -> RequestBuilder {
        let uri = format!("{}{}", self.inner.base, path_and_query);
        RequestBuilder {
            builder: http::Request::builder().method(method).uri(uri),
            body: None,
            scope: None,
        }
    }

    pub(crate) fn request_uri(&self, method: Method, uri: &Uri) -> RequestBuilder {
        let uri = if uri.scheme().is_some() {
            uri.to_string()
        } else {
            format!(
                "{}{}",
                self.inner.base,
                uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/")
            )
        };
        RequestBuilder {
            builder: http::Request::builder().method(method).uri(uri),
            body: None,
            scope: None,
        }
    }

    fn transport(&self) -> Transport {
        self.inner.transport.lock().expect("transport lock").clone()
    }

    /// Send a request, retrying a bounded number of times on transport
    /// errors as long as the body can be replayed.
    pub(crate) async fn roundtrip(
        &self,
        req: http::Request<Body>,
    ) -> Result<http::Response<Body>> {
        let mut req = req;
        for attempt in 1..RETRY_ATTEMPTS {
            let Some(retry) = clone_request(&req) else {
                break;
            };
            match self.transport().oneshot(req).await {
                Ok(response) => return Ok(response),
                Err(err) => {
                    tracing::debug!(
                        client = %self.inner.debug_id,
                        error = %err,
                        attempt,
                        "transport error, retrying request"
                    );
                    req = retry;
                }
            }
        }
        self.transport().oneshot(req).await.map_err(transport_error)
    }

    /// Send a request and decode any non-2xx response into a structured
    /// error.
    pub(crate) async fn roundtrip_ok(
        &self,
        req: http::Request<Body>,
    ) -> Result<http::Response<Body>> {
        let response = self.roundtrip(req).await?;
        if response.status().is_success() {
            return Ok(response);
        }
        Err(error_from_response(response).await)
    }

    /// Resolve a response's `Location` header against this client's base.
    pub(crate) fn location_uri(&self, response: &http::Response<Body>) -> Result<Uri> {
        let value = response
            .headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| Error::message("response carries no Location header"))?;
        value
            .parse()
            .map_err(|err| Error::other(err).context("invalid Location header"))
    }

    fn check_repo(&self, repo: &str) -> Result<()> {
        if !refname::is_valid_repo_name(repo) {
            return Err(Error::name_invalid().context("invalid OCI request"));
        }
        Ok(())
    }

    fn check_digest(&self, digest: &Digest) -> Result<()> {
        if !Digest::is_valid(digest.as_str()) {
            return Err(Error::new(ErrorCode::DIGEST_INVALID, "badly formed digest")
                .context("invalid OCI request"));
        }
        Ok(())
    }

    fn check_tag(&self, tag: &str) -> Result<()> {
        if !refname::is_valid_tag(tag) {
            // Tags are rejected the way a registry's router would reject
            // the request path they would produce.
            return Err(Error::message("page not found")
                .with_http_status(StatusCode::NOT_FOUND)
                .context("invalid OCI request"));
        }
        Ok(())
    }

    async fn head_descriptor(
        &self,
        path: &str,
        scope: Scope,
        digest: Option<&Digest>,
    ) -> Result<Descriptor> {
        let req = self
            .request(Method::HEAD, path)
            .scope(scope)
            .header(header::ACCEPT, "*/*")
            .build()?;
        let response = self.roundtrip_ok(req).await?;
        descriptor_from_response(&response, digest)
    }

    pub(crate) async fn get_tag_inner(&self, repo: &str, tag: &str) -> Result<BlobReader> {
        let req = self
            .request(Method::GET, &format!("/v2/{repo}/manifests/{tag}"))
            .scope(Scope::pull(repo))
            .header(header::ACCEPT, "*/*")
            .build()?;
        let response = self.roundtrip_ok(req).await?;
        manifest_reader(response, None).await
    }

    // Fetch one page of a list endpoint, returning the raw body and the
    // path of the next page, if any.
    async fn list_page(&self, path: &str, scope: Scope) -> Result<(Bytes, Option<String>)> {
        let req = self.request(Method::GET, path).scope(scope).build()?;
        let response = self.roundtrip_ok(req).await?;
        let next = next_link(&response);
        let body = collect_body(response).await?;
        Ok((body, next))
    }

    pub(crate) async fn referrers_list(
        &self,
        repo: &str,
        digest: &Digest,
        artifact_type: Option<&str>,
    ) -> Result<Vec<Descriptor>> {
        let mut path = format!("/v2/{repo}/referrers/{digest}");
        if let Some(artifact_type) = artifact_type {
            path = format!("{path}?artifactType={}", encode_query_value(artifact_type));
        }

        let mut manifests = Vec::new();
        let mut filtered_by_server = false;
        let mut next = Some(path);
        let mut first_page = true;
        while let Some(path) = next {
            let req = self
                .request(Method::GET, &path)
                .scope(Scope::pull(repo))
                .header(header::ACCEPT, mediatype::IMAGE_INDEX)
                .build()?;
            let response = self.roundtrip(req).await?;
            if first_page
                && response.status() == StatusCode::NOT_FOUND
                && !response.headers().contains_key("oci-filters-applied")
            {
                // The registry predates the referrers API.
                return self.referrers_from_tag(repo, digest, artifact_type).await;
            }
            if !response.status().is_success() {
                return Err(error_from_response(response).await);
            }
            first_page = false;
            filtered_by_server = filtered_by_server
                || response
                    .headers()
                    .get("oci-filters-applied")
                    .and_then(|v| v.to_str().ok())
                    .is_some_and(|v| v.split(',').any(|f| f.trim() == "artifactType"));
            next = next_link(&response);
            let body = collect_body(response).await?;
            let index: ociregistry::Index = serde_json::from_slice(&body)
                .map_err(|err| Error::other(err).context("invalid referrers response"))?;
            manifests.extend(index.manifests);
        }
        if let Some(filter) = artifact_type {
            if !filtered_by_server {
                manifests.retain(|desc| desc.artifact_type.as_deref() == Some(filter));
            }
        }
        Ok(manifests)
    }
}

#[async_trait]
impl Registry for Client {
    async fn get_blob(&self, repo: &str, digest: &Digest) -> Result<BlobReader> {
        self.check_repo(repo)?;
        self.check_digest(digest)?;
        let req = self
            .request(Method::GET, &format!("/v2/{repo}/blobs/{digest}"))
            .scope(Scope::pull(repo))
            .build()?;
        let response = self.roundtrip_ok(req).await?;
        let desc = descriptor_from_response(&response, Some(digest))?;
        Ok(BlobReader::from_stream(desc, body_stream(response)))
    }

    async fn get_blob_range(
        &self,
        repo: &str,
        digest: &Digest,
        start: u64,
        end: Option<u64>,
    ) -> Result<BlobReader> {
        self.check_repo(repo)?;
        self.check_digest(digest)?;
        if start == 0 && end.is_none() {
            return self.get_blob(repo, digest).await;
        }
        if end.is_some_and(|end| end <= start) {
            let desc = self.resolve_blob(repo, digest).await?;
            return Ok(BlobReader::from_bytes(desc, Bytes::new()));
        }
        let range = match end {
            Some(end) => format!("bytes={start}-{}", end - 1),
            None => format!("bytes={start}-"),
        };
        let req = self
            .request(Method::GET, &format!("/v2/{repo}/blobs/{digest}"))
            .scope(Scope::pull(repo))
            .header(header::RANGE, range)
            .build()?;
        let response = self.roundtrip_ok(req).await?;

        if response.status() == StatusCode::PARTIAL_CONTENT {
            let total = content_range_total(&response);
            let mut desc = descriptor_from_response(&response, Some(digest))?;
            if let Some(total) = total {
                // The descriptor reports the whole blob, not the range.
                desc.size = total;
            }
            return Ok(BlobReader::from_stream(desc, body_stream(response)));
        }

        // The registry ignored the range request; slice the full response.
        let desc = descriptor_from_response(&response, Some(digest))?;
        let take = end.map(|e| e.saturating_sub(start));
        Ok(BlobReader::from_stream(
            desc,
            slice_stream(body_stream(response), start, take),
        ))
    }

    async fn get_manifest(&self, repo: &str, digest: &Digest) -> Result<BlobReader> {
        self.check_repo(repo)?;
        self.check_digest(digest)?;
        let req = self
            .request(Method::GET, &format!("/v2/{repo}/manifests/{digest}"))
            .scope(Scope::pull(repo))
            .header(header::ACCEPT, "*/*")
            .build()?;
        let response = self.roundtrip_ok(req).await?;
        manifest_reader(response, Some(digest)).await
    }

    async fn get_tag(&self, repo: &str, tag: &str) -> Result<BlobReader> {
        self.check_repo(repo)?;
        self.check_tag(tag)?;
        self.get_tag_inner(repo, tag).await
    }

    async fn resolve_blob(&self, repo: &str, digest: &Digest) -> Result<Descriptor> {
        self.check_repo(repo)?;
        self.check_digest(digest)?;
        self.head_descriptor(
            &format!("/v2/{repo}/blobs/{digest}"),
            Scope::pull(repo),
            Some(digest),
        )
        .await
    }

    async fn resolve_manifest(&self, repo: &str, digest: &Digest) -> Result<Descriptor> {
        self.check_repo(repo)?;
        self.check_digest(digest)?;
        self.head_descriptor(
            &format!("/v2/{repo}/manifests/{digest}"),
            Scope::pull(repo),
            Some(digest),
        )
        .await
    }

    async fn resolve_tag(&self, repo: &str, tag: &str) -> Result<Descriptor> {
        self.check_repo(repo)?;
        self.check_tag(tag)?;
        self.head_descriptor(&format!("/v2/{repo}/manifests/{tag}"), Scope::pull(repo), None)
            .await
    }

    async fn push_blob(&self, repo: &str, desc: &Descriptor, content: Bytes) -> Result<Descriptor> {
        self.check_repo(repo)?;
        self.check_digest(&desc.digest)?;
        let req = self
            .request(Method::POST, &format!("/v2/{repo}/blobs/uploads/"))
            .scope(Scope::push(repo))
            .build()?;
        let response = self.roundtrip_ok(req).await?;
        if response.status() != StatusCode::ACCEPTED {
            return Err(Error::message(format!(
                "unexpected status {} starting blob upload",
                response.status()
            )));
        }
        let location = self.location_uri(&response)?;
        let separator = if location.query().is_some() { '&' } else { '?' };
        let commit: Uri = format!(
            "{location}{separator}digest={}",
            encode_query_value(desc.digest.as_str())
        )
        .parse()
        .map_err(|err| Error::other(err).context("cannot build upload URL"))?;
        let req = self
            .request_uri(Method::PUT, &commit)
            .scope(Scope::push(repo))
            .header(header::CONTENT_TYPE, desc.media_type.as_str())
            .body(content)
            .build()?;
        let response = self.roundtrip_ok(req).await?;
        if response.status() != StatusCode::CREATED {
            return Err(Error::message(format!(
                "unexpected status {} committing blob upload",
                response.status()
            )));
        }
        Ok(desc.clone())
    }

    async fn push_blob_chunked(&self, repo: &str, chunk_size: usize) -> Result<Box<dyn BlobWriter>> {
        self.check_repo(repo)?;
        Ok(Box::new(
            ClientWriter::start(self.clone(), repo, chunk_size).await?,
        ))
    }

    async fn push_blob_chunked_resume(
        &self,
        repo: &str,
        id: &str,
        offset: i64,
        chunk_size: usize,
    ) -> Result<Box<dyn BlobWriter>> {
        self.check_repo(repo)?;
        Ok(Box::new(
            ClientWriter::resume(self.clone(), repo, id, offset, chunk_size).await?,
        ))
    }

    async fn mount_blob(&self, from_repo: &str, to_repo: &str, digest: &Digest) -> Result<Descriptor> {
        self.check_repo(from_repo)?;
        self.check_repo(to_repo)?;
        self.check_digest(digest)?;
        let path = format!(
            "/v2/{to_repo}/blobs/uploads/?mount={}&from={}",
            encode_query_value(digest.as_str()),
            encode_query_value(from_repo)
        );
        let scope = Scope::pull(from_repo).union(&Scope::push(to_repo));
        let req = self.request(Method::POST, &path).scope(scope).build()?;
        let response = self.roundtrip_ok(req).await?;
        match response.status() {
            StatusCode::CREATED => self.resolve_blob(to_repo, digest).await,
            // The registry fell back to opening an upload session, meaning
            // the source blob was not available to mount.
            StatusCode::ACCEPTED => {
                if let Ok(location) = self.location_uri(&response) {
                    let cancel = self
                        .request_uri(Method::DELETE, &location)
                        .scope(Scope::push(to_repo))
                        .build()?;
                    let _ = self.roundtrip(cancel).await;
                }
                Err(Error::blob_unknown().context("cannot mount blob"))
            }
            status => Err(Error::message(format!(
                "unexpected status {status} mounting blob"
            ))),
        }
    }

    async fn push_manifest(
        &self,
        repo: &str,
        tag: Option<&str>,
        digest: Option<&Digest>,
        contents: Bytes,
        media_type: &str,
    ) -> Result<Descriptor> {
        self.check_repo(repo)?;
        if let Some(tag) = tag {
            self.check_tag(tag)?;
        }
        if let Some(digest) = digest {
            self.check_digest(digest)?;
        }
        let reference = match (tag, digest) {
            (Some(tag), _) => tag.to_string(),
            (None, Some(digest)) => digest.to_string(),
            (None, None) => Digest::from_bytes(&contents).to_string(),
        };
        let size = contents.len() as u64;
        let fallback = digest.cloned().unwrap_or_else(|| Digest::from_bytes(&contents));
        let req = self
            .request(Method::PUT, &format!("/v2/{repo}/manifests/{reference}"))
            .scope(Scope::push(repo))
            .header(header::CONTENT_TYPE, media_type)
            .body(contents)
            .build()?;
        let response = self.roundtrip_ok(req).await?;
        if response.status() != StatusCode::CREATED {
            return Err(Error::message(format!(
                "unexpected status {} pushing manifest",
                response.status()
            )));
        }
        let digest = match digest_header(&response)? {
            Some(digest) => digest,
            None => fallback,
        };
        Ok(Descriptor {
            media_type: media_type.to_string(),
            digest,
            size,
            annotations: None,
            artifact_type: None,
        })
    }

    async fn delete_blob(&self, repo: &str, digest: &Digest) -> Result<()> {
        self.check_repo(repo)?;
        self.check_digest(digest)?;
        let req = self
            .request(Method::DELETE, &format!("/v2/{repo}/blobs/{digest}"))
            .scope(Scope::push(repo))
            .build()?;
        self.roundtrip_ok(req).await?;
        Ok(())
    }

    async fn delete_manifest(&self, repo: &str, digest: &Digest) -> Result<()> {
        self.check_repo(repo)?;
        self.check_digest(digest)?;
        let req = self
            .request(Method::DELETE, &format!("/v2/{repo}/manifests/{digest}"))
            .scope(Scope::push(repo))
            .build()?;
        self.roundtrip_ok(req).await?;
        Ok(())
    }

    async fn delete_tag(&self, repo: &str, tag: &str) -> Result<()> {
        self.check_repo(repo)?;
        self.check_tag(tag)?;
        let req = self
            .request(Method::DELETE, &format!("/v2/{repo}/manifests/{tag}"))
            .scope(Scope::push(repo))
            .build()?;
        self.roundtrip_ok(req).await?;
        Ok(())
    }

    fn repositories(&self, start_after: Option<String>) -> Listing<String> {
        let n = self.inner.list_page_size;
        let mut first = format!("/v2/_catalog?n={n}");
        if let Some(last) = &start_after {
            first = format!("{first}&last={}", encode_query_value(last));
        }
        paged_names(self.clone(), first, Scope::catalog(), |body| {
            #[derive(Deserialize)]
            struct CatalogPage {
                #[serde(default)]
                repositories: Vec<String>,
            }
            let page: CatalogPage = serde_json::from_slice(body)
                .map_err(|err| Error::other(err).context("invalid catalog response"))?;
            Ok(page.repositories)
        })
    }

    fn tags(&self, repo: &str, params: &TagsRequest) -> Listing<String> {
        if let Err(err) = self.check_repo(repo) {
            return error_listing(err);
        }
        let n = self.inner.list_page_size;
        let mut first = format!("/v2/{repo}/tags/list?n={n}");
        if let Some(last) = &params.last {
            first = format!("{first}&last={}", encode_query_value(last));
        }
        paged_names(self.clone(), first, Scope::pull(repo), |body| {
            #[derive(Deserialize)]
            struct TagsPage {
                #[serde(default)]
                tags: Vec<String>,
            }
            let page: TagsPage = serde_json::from_slice(body)
                .map_err(|err| Error::other(err).context("invalid tags response"))?;
            Ok(page.tags)
        })
    }

    fn referrers(&self, repo: &str, digest: &Digest, params: &ReferrersRequest) -> Listing<Descriptor> {
        if let Err(err) = self.check_repo(repo).and_then(|_| self.check_digest(digest)) {
            return error_listing(err);
        }
        let client = self.clone();
        let repo = repo.to_string();
        let digest = digest.clone();
        let artifact_type = params.artifact_type.clone();
        futures::stream::once(async move {
            client
                .referrers_list(&repo, &digest, artifact_type.as_deref())
                .await
        })
        .map_ok(|manifests| futures::stream::iter(manifests.into_iter().map(Ok)))
        .try_flatten()
        .boxed()
    }
}

pub(crate) struct RequestBuilder {
    builder: http::request::Builder,
    body: Option<Body>,
    scope: Option<Scope>,
}

impl RequestBuilder {
    pub(crate) fn scope(mut self, scope: Scope) -> Self {
        self.scope = Some(scope);
        self
    }

    pub(crate) fn header(
        mut self,
        key: http::header::HeaderName,
        value: impl TryInto<http::HeaderValue, Error = http::header::InvalidHeaderValue>,
    ) -> Self {
        if let Ok(value) = value.try_into() {
            self.builder = self.builder.header(key, value);
        }
        self
    }

    pub(crate) fn body(mut self, body: impl Into<Body>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub(crate) fn build(self) -> Result<http::Request<Body>> {
        let mut req = self
            .builder
            .body(self.body.unwrap_or_else(Body::empty))
            .map_err(|err| Error::other(err).context("cannot build request"))?;
        if let Some(scope) = self.scope {
            req.extensions_mut().insert(RequiredScope(scope));
        }
        Ok(req)
    }
}

fn clone_request(req: &http::Request<Body>) -> Option<http::Request<Body>> {
    let body = req.body().try_clone()?;
    let mut next = http::Request::builder()
        .method(req.method().clone())
        .uri(req.uri().clone())
        .version(req.version())
        .body(body)
        .ok()?;
    *next.extensions_mut() = req.extensions().clone();
    *next.headers_mut() = req.headers().clone();
    Some(next)
}

fn transport_error(err: BoxError) -> Error {
    match err.downcast::<Error>() {
        Ok(err) => *err,
        Err(err) => Error::Other(err).context("cannot make HTTP request"),
    }
}

async fn error_from_response(response: http::Response<Body>) -> Error {
    let status = response.status();
    let headers = response.headers().clone();
    let body = match http_body_util::Limited::new(response.into_body(), ERROR_BODY_LIMIT)
        .collect()
        .await
    {
        Ok(collected) => collected.to_bytes(),
        Err(_) => Bytes::new(),
    };
    if let Ok(wire) = serde_json::from_slice::<WireErrors>(&body) {
        if !wire.errors.is_empty() {
            return Error::from(wire).with_http_response(status, headers, Some(body));
        }
    }
    let text = String::from_utf8_lossy(&body).trim().to_string();
    let err = if text.is_empty() {
        Error::message("registry returned an error response")
    } else {
        Error::message(text)
    };
    err.with_http_response(status, headers, Some(body))
}

fn digest_header(response: &http::Response<Body>) -> Result<Option<Digest>> {
    response
        .headers()
        .get("docker-content-digest")
        .and_then(|v| v.to_str().ok())
        .map(|value| {
            Digest::parse(value).map_err(|err| err.context("invalid digest in response header"))
        })
        .transpose()
}

fn descriptor_from_response(
    response: &http::Response<Body>,
    digest: Option<&Digest>,
) -> Result<Descriptor> {
    let media_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or(mediatype::OCTET_STREAM)
        .to_string();
    let digest = match digest_header(response)? {
        Some(digest) => digest,
        None => digest
            .cloned()
            .ok_or_else(|| Error::message("no digest in response"))?,
    };
    let size = response
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .ok_or_else(|| Error::message("no content length in response"))?;
    Ok(Descriptor {
        media_type,
        digest,
        size,
        annotations: None,
        artifact_type: None,
    })
}

// A manifest response as a BlobReader. When the registry omits the digest
// or length headers the body is collected and the descriptor derived from
// it, so the caller always sees a complete descriptor.
async fn manifest_reader(
    response: http::Response<Body>,
    digest: Option<&Digest>,
) -> Result<BlobReader> {
    let media_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or(mediatype::OCTET_STREAM)
        .to_string();
    let header_digest = digest_header(&response)?.or_else(|| digest.cloned());
    let size = response
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    if let (Some(digest), Some(size)) = (header_digest.clone(), size) {
        let desc = Descriptor {
            media_type,
            digest,
            size,
            annotations: None,
            artifact_type: None,
        };
        return Ok(BlobReader::from_stream(desc, body_stream(response)));
    }
    let data = collect_body(response).await?;
    let desc = Descriptor {
        media_type,
        digest: header_digest.unwrap_or_else(|| Digest::from_bytes(&data)),
        size: data.len() as u64,
        annotations: None,
        artifact_type: None,
    };
    Ok(BlobReader::from_bytes(desc, data))
}

fn body_stream(
    response: http::Response<Body>,
) -> impl Stream<Item = Result<Bytes, BoxError>> + Send + 'static {
    response
        .into_body()
        .into_data_stream()
        .map(|chunk| chunk.map_err(Into::into))
}

async fn collect_body(response: http::Response<Body>) -> Result<Bytes> {
    response
        .into_body()
        .collect()
        .await
        .map(|collected| collected.to_bytes())
        .map_err(|err| Error::Other(err.into()).context("cannot read response body"))
}

// Skip `skip` bytes, then pass through at most `take` bytes.
fn slice_stream(
    stream: impl Stream<Item = Result<Bytes, BoxError>> + Send + 'static,
    skip: u64,
    take: Option<u64>,
) -> impl Stream<Item = Result<Bytes, BoxError>> + Send + 'static {
    stream
        .scan((skip, take), |(skip, take), item| {
            let out = match item {
                Err(err) => Some(Some(Err(err))),
                Ok(chunk) => {
                    let mut chunk = chunk;
                    if *skip >= chunk.len() as u64 {
                        *skip -= chunk.len() as u64;
                        Some(None)
                    } else {
                        if *skip > 0 {
                            chunk = chunk.slice(*skip as usize..);
                            *skip = 0;
                        }
                        match take {
                            Some(0) => None,
                            Some(remaining) => {
                                let cap = (*remaining).min(chunk.len() as u64);
                                chunk = chunk.slice(..cap as usize);
                                *remaining -= cap;
                                Some(Some(Ok(chunk)))
                            }
                            None => Some(Some(Ok(chunk))),
                        }
                    }
                }
            };
            futures::future::ready(out)
        })
        .filter_map(futures::future::ready)
}

fn content_range_total(response: &http::Response<Body>) -> Option<u64> {
    let value = response.headers().get(header::CONTENT_RANGE)?.to_str().ok()?;
    let (_, total) = value.rsplit_once('/')?;
    total.trim().parse().ok()
}

// `Link: </v2/...>; rel="next"`
fn next_link(response: &http::Response<Body>) -> Option<String> {
    let value = response.headers().get(header::LINK)?.to_str().ok()?;
    let (url, params) = value.split_once(';')?;
    if !params.contains("rel=\"next\"") && !params.contains("rel=next") {
        return None;
    }
    let url = url.trim().strip_prefix('<')?.strip_suffix('>')?;
    let uri: Uri = url.parse().ok()?;
    Some(
        uri.path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| url.to_string()),
    )
}

fn paged_names(
    client: Client,
    first: String,
    scope: Scope,
    parse: fn(&[u8]) -> Result<Vec<String>>,
) -> Listing<String> {
    futures::stream::try_unfold(
        (client, scope, Some(first)),
        move |(client, scope, next)| async move {
            let Some(path) = next else {
                return Ok::<_, ociregistry::Error>(None);
            };
            let (body, next) = client.list_page(&path, scope.clone()).await?;
            let items = parse(&body)?;
            Ok(Some((items, (client, scope, next))))
        },
    )
    .map_ok(|items| futures::stream::iter(items.into_iter().map(Ok)))
    .try_flatten()
    .boxed()
}

pub(crate) fn encode_query_value(value: &str) -> String {
    utf8_percent_encode(value, NON_ALPHANUMERIC).to_string()
}
