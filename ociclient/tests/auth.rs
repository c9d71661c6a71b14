//! Bearer-token negotiation end to end: a gate in front of the registry
//! challenges unauthenticated requests, the auth layer resolves
//! credentials, fetches a token from the realm and replays.

mod common;

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::Router;
use bytes::Bytes;
use http::{header, StatusCode};
use tower::util::BoxCloneService;
use tower::{BoxError, Service, ServiceExt as _};

use common::{RouterTransport, TEST_HOST};
use ociauth::{basic_auth, Config, ConfigEntry, HelperError, HelperRunner};
use ociregistry::{mediatype, Descriptor, Registry as _};

const TOKEN: &str = "a-test-bearer-token";

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

struct NoRunner;

impl HelperRunner for NoRunner {
    fn get(&self, _helper: &str, _server_url: &str) -> Result<ConfigEntry, HelperError> {
        panic!("no helpers in this test")
    }
}

/// Requires a bearer token for registry routes and serves `/token` as the
/// authorization realm, accepting the configured basic credentials.
#[derive(Clone)]
struct AuthGate {
    inner: RouterTransport,
    token_requests: Arc<AtomicUsize>,
}

impl Service<http::Request<hyperdriver::Body>> for AuthGate {
    type Response = http::Response<hyperdriver::Body>;
    type Error = BoxError;
    type Future = BoxFuture<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<hyperdriver::Body>) -> Self::Future {
        let inner = self.inner.clone();
        let token_requests = self.token_requests.clone();
        Box::pin(async move {
            if req.uri().path() == "/token" {
                token_requests.fetch_add(1, Ordering::SeqCst);
                let expected = basic_auth("someuser", "somesecret");
                let authorized = req
                    .headers()
                    .get(header::AUTHORIZATION)
                    .is_some_and(|got| got == expected);
                let response = if authorized {
                    http::Response::builder()
                        .status(StatusCode::OK)
                        .header(header::CONTENT_TYPE, "application/json")
                        .body(hyperdriver::Body::from(Bytes::from(
                            serde_json::to_vec(&serde_json::json!({ "token": TOKEN })).unwrap(),
                        )))
                } else {
                    http::Response::builder()
                        .status(StatusCode::FORBIDDEN)
                        .body(hyperdriver::Body::empty())
                };
                return Ok(response.unwrap());
            }

            let bearer = req
                .headers()
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "));
            if bearer != Some(TOKEN) {
                let challenge = format!(
                    "Bearer realm=\"http://{TEST_HOST}/token\",service=\"{TEST_HOST}\",scope=\"repository:foo/bar:pull\""
                );
                return Ok(http::Response::builder()
                    .status(StatusCode::UNAUTHORIZED)
                    .header(header::WWW_AUTHENTICATE, challenge)
                    .body(hyperdriver::Body::empty())
                    .unwrap());
            }
            inner.clone().oneshot(req).await
        })
    }
}

fn gated_client(token_requests: Arc<AtomicUsize>) -> ociclient::Client {
    let router: Router = ociserver::ServerBuilder::new()
        .registry(ocimem::MemRegistry::new())
        .build();
    let gate = AuthGate {
        inner: RouterTransport::new(router),
        token_requests,
    };
    let config = Config::parse(
        "test.json",
        &format!(
            r#"{{"auths": {{{host:?}: {{"username": "someuser", "password": "somesecret"}}}}}}"#,
            host = TEST_HOST
        ),
        Arc::new(NoRunner),
    )
    .unwrap();
    ociclient::Client::builder()
        .insecure()
        .transport(BoxCloneService::new(gate))
        .auth(config)
        .build(TEST_HOST)
        .unwrap()
}

#[tokio::test]
async fn bearer_challenge_is_answered_and_cached() {
    let token_requests = Arc::new(AtomicUsize::new(0));
    let client = gated_client(token_requests.clone());

    let data = b"authenticated content";
    let desc = Descriptor::from_bytes(mediatype::OCTET_STREAM, data);
    client
        .push_blob("foo/bar", &desc, Bytes::copy_from_slice(data))
        .await
        .unwrap();

    let reader = client.get_blob("foo/bar", &desc.digest).await.unwrap();
    assert_eq!(reader.bytes().await.unwrap(), &data[..]);

    // One challenge was enough; later requests reuse the cached token.
    assert_eq!(token_requests.load(Ordering::SeqCst), 1);
}
