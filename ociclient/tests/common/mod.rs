//! Shared plumbing: an in-process transport that drives requests straight
//! into an axum router, so client tests run without a listener.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use axum::Router;
use http_body_util::BodyExt as _;
use tower::util::BoxCloneService;
use tower::{BoxError, Service, ServiceExt as _};

use ociauth::RequiredScope;
use ociclient::{Client, Transport};

pub const TEST_HOST: &str = "registry.example";

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// A client transport that dispatches into a router in process.
#[derive(Clone)]
pub struct RouterTransport {
    router: Router,
}

impl RouterTransport {
    pub fn new(router: Router) -> Self {
        RouterTransport { router }
    }
}

impl Service<http::Request<hyperdriver::Body>> for RouterTransport {
    type Response = http::Response<hyperdriver::Body>;
    type Error = BoxError;
    type Future = BoxFuture<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<hyperdriver::Body>) -> Self::Future {
        let router = self.router.clone();
        Box::pin(async move {
            let (parts, body) = req.into_parts();
            let bytes = body.collect().await.map_err(BoxError::from)?.to_bytes();
            let req = http::Request::from_parts(parts, axum::body::Body::from(bytes));

            let response = router.oneshot(req).await?;

            let (parts, body) = response.into_parts();
            let bytes = axum::body::to_bytes(body, usize::MAX)
                .await
                .map_err(BoxError::from)?;
            Ok(http::Response::from_parts(
                parts,
                hyperdriver::Body::from(bytes),
            ))
        })
    }
}

/// A transport wrapper recording the canonical form of every
/// [`RequiredScope`] attached to outgoing requests.
#[derive(Clone)]
pub struct ScopeRecorder<S> {
    inner: S,
    scopes: Arc<Mutex<Vec<String>>>,
}

impl<S> ScopeRecorder<S> {
    pub fn new(inner: S) -> (Self, Arc<Mutex<Vec<String>>>) {
        let scopes = Arc::new(Mutex::new(Vec::new()));
        (
            ScopeRecorder {
                inner,
                scopes: scopes.clone(),
            },
            scopes,
        )
    }
}

impl<S, B> Service<http::Request<B>> for ScopeRecorder<S>
where
    S: Service<http::Request<B>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        if let Some(scope) = req.extensions().get::<RequiredScope>() {
            self.scopes
                .lock()
                .expect("scope log lock")
                .push(scope.0.to_string());
        }
        self.inner.call(req)
    }
}

/// A client wired straight to the given router.
pub fn client_for(router: Router) -> Client {
    Client::builder()
        .insecure()
        .transport(BoxCloneService::new(RouterTransport::new(router)))
        .build(TEST_HOST)
        .expect("client builds")
}

/// A client over an in-memory registry server.
pub fn memory_client() -> Client {
    client_for(
        ociserver::ServerBuilder::new()
            .registry(ocimem::MemRegistry::new())
            .build(),
    )
}

/// A transport into `router` that records required scopes.
pub fn recording_transport(router: Router) -> (Transport, Arc<Mutex<Vec<String>>>) {
    let (service, scopes) = ScopeRecorder::new(RouterTransport::new(router));
    (BoxCloneService::new(service), scopes)
}
