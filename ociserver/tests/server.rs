//! Protocol-level tests driving the server router in process.

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use bytes::Bytes;
use tower::ServiceExt;

use ociregistry::{mediatype, Digest, Error, ErrorCode, Registry, WireErrors};
use ocimem::MemRegistry;
use ociserver::ServerBuilder;

fn test_server() -> Router {
    ServerBuilder::new().registry(MemRegistry::new()).build()
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, http::HeaderMap, Bytes) {
    let response = app.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, headers, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn upload_blob(app: &Router, repo: &str, data: &[u8]) -> Digest {
    let digest = Digest::from_bytes(data);

    let (status, headers, _) = send(
        app,
        Request::builder()
            .method("POST")
            .uri(format!("/v2/{repo}/blobs/uploads/"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let location = headers[header::LOCATION].to_str().unwrap().to_string();
    assert!(headers.contains_key("oci-chunk-min-length"));

    let (status, headers, _) = send(
        app,
        Request::builder()
            .method("PUT")
            .uri(format!("{location}?digest={digest}"))
            .body(Body::from(data.to_vec()))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(
        headers["docker-content-digest"].to_str().unwrap(),
        digest.as_str()
    );
    digest
}

async fn upload_manifest(app: &Router, repo: &str, reference: &str, manifest: &[u8]) -> Digest {
    let (status, headers, _) = send(
        app,
        Request::builder()
            .method("PUT")
            .uri(format!("/v2/{repo}/manifests/{reference}"))
            .header(header::CONTENT_TYPE, mediatype::IMAGE_MANIFEST)
            .body(Body::from(manifest.to_vec()))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    Digest::parse(headers["docker-content-digest"].to_str().unwrap()).unwrap()
}

fn manifest_with_config(config: &Digest, config_size: usize) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "schemaVersion": 2,
        "mediaType": mediatype::IMAGE_MANIFEST,
        "config": {
            "mediaType": mediatype::IMAGE_CONFIG,
            "digest": config.as_str(),
            "size": config_size,
        },
        "layers": [],
    }))
    .unwrap()
}

#[tokio::test]
async fn version_check() {
    let app = test_server();
    let (status, _, body) = send(&app, get("/v2/")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, &b"{}"[..]);
}

#[tokio::test]
async fn blob_upload_and_download() {
    let app = test_server();
    let data = b"Hello, OCI registry!";
    let digest = upload_blob(&app, "test/repo", data).await;

    let (status, headers, body) = send(&app, get(&format!("/v2/test/repo/blobs/{digest}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, &data[..]);
    assert_eq!(
        headers[header::CONTENT_LENGTH].to_str().unwrap(),
        data.len().to_string()
    );

    let (status, headers, _) = send(
        &app,
        Request::builder()
            .method("HEAD")
            .uri(format!("/v2/test/repo/blobs/{digest}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        headers["docker-content-digest"].to_str().unwrap(),
        digest.as_str()
    );
}

#[tokio::test]
async fn blob_range_request() {
    let app = test_server();
    let digest = upload_blob(&app, "test/repo", b"0123456789").await;

    let (status, headers, body) = send(
        &app,
        Request::builder()
            .uri(format!("/v2/test/repo/blobs/{digest}"))
            .header(header::RANGE, "bytes=2-5")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::PARTIAL_CONTENT);
    assert_eq!(body, &b"2345"[..]);
    assert_eq!(
        headers[header::CONTENT_RANGE].to_str().unwrap(),
        "bytes 2-5/10"
    );

    let (status, _, body) = send(
        &app,
        Request::builder()
            .uri(format!("/v2/test/repo/blobs/{digest}"))
            .header(header::RANGE, "bytes=7-")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::PARTIAL_CONTENT);
    assert_eq!(body, &b"789"[..]);
}

#[tokio::test]
async fn chunked_upload_flow() {
    let app = test_server();

    let (status, headers, _) = send(
        &app,
        Request::builder()
            .method("POST")
            .uri("/v2/test/repo/blobs/uploads/")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let location = headers[header::LOCATION].to_str().unwrap().to_string();

    let (status, headers, _) = send(
        &app,
        Request::builder()
            .method("PATCH")
            .uri(&location)
            .header(header::CONTENT_RANGE, "0-2")
            .body(Body::from(&b"foo"[..]))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(headers[header::RANGE].to_str().unwrap(), "0-2");

    // A chunk at the wrong offset is rejected as unsatisfiable.
    let (status, _, _) = send(
        &app,
        Request::builder()
            .method("PATCH")
            .uri(&location)
            .header(header::CONTENT_RANGE, "9-11")
            .body(Body::from(&b"bar"[..]))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::RANGE_NOT_SATISFIABLE);

    let (status, _, _) = send(
        &app,
        Request::builder()
            .method("PATCH")
            .uri(&location)
            .header(header::CONTENT_RANGE, "3-5")
            .body(Body::from(&b"bar"[..]))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let digest = Digest::from_bytes(b"foobar");
    let (status, _, _) = send(
        &app,
        Request::builder()
            .method("PUT")
            .uri(format!("{location}?digest={digest}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, _, body) = send(&app, get(&format!("/v2/test/repo/blobs/{digest}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, &b"foobar"[..]);
}

#[tokio::test]
async fn cancel_upload() {
    let app = test_server();
    let (_, headers, _) = send(
        &app,
        Request::builder()
            .method("POST")
            .uri("/v2/test/repo/blobs/uploads/")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    let location = headers[header::LOCATION].to_str().unwrap().to_string();
    let (status, _, _) = send(
        &app,
        Request::builder()
            .method("DELETE")
            .uri(&location)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn cross_repository_mount() {
    let app = test_server();
    let digest = upload_blob(&app, "source/repo", b"shared bytes").await;

    let (status, headers, _) = send(
        &app,
        Request::builder()
            .method("POST")
            .uri(format!(
                "/v2/dest/repo/blobs/uploads/?mount={digest}&from=source/repo"
            ))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(
        headers[header::LOCATION].to_str().unwrap(),
        format!("/v2/dest/repo/blobs/{digest}")
    );

    // An unknown source blob degrades to a normal upload session.
    let missing = Digest::from_bytes(b"never pushed");
    let (status, headers, _) = send(
        &app,
        Request::builder()
            .method("POST")
            .uri(format!(
                "/v2/dest/repo/blobs/uploads/?mount={missing}&from=source/repo"
            ))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert!(headers.contains_key(header::LOCATION));
}

#[tokio::test]
async fn manifest_round_trip_by_tag_and_digest() {
    let app = test_server();
    let config = upload_blob(&app, "test/repo", b"{}").await;
    let manifest = manifest_with_config(&config, 2);
    let digest = upload_manifest(&app, "test/repo", "latest", &manifest).await;
    assert_eq!(digest, Digest::from_bytes(&manifest));

    // The stored wire bytes come back byte-for-byte.
    let (status, headers, body) = send(&app, get("/v2/test/repo/manifests/latest")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, &manifest[..]);
    assert_eq!(
        headers[header::CONTENT_TYPE].to_str().unwrap(),
        mediatype::IMAGE_MANIFEST
    );

    let (status, _, body) = send(&app, get(&format!("/v2/test/repo/manifests/{digest}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, &manifest[..]);

    let (status, headers, _) = send(
        &app,
        Request::builder()
            .method("HEAD")
            .uri("/v2/test/repo/manifests/latest")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        headers["docker-content-digest"].to_str().unwrap(),
        digest.as_str()
    );
}

#[tokio::test]
async fn manifest_content_negotiation() {
    let app = test_server();
    let config = upload_blob(&app, "test/repo", b"{}").await;
    let manifest = manifest_with_config(&config, 2);
    upload_manifest(&app, "test/repo", "latest", &manifest).await;

    let (status, _, _) = send(
        &app,
        Request::builder()
            .uri("/v2/test/repo/manifests/latest")
            .header(header::ACCEPT, mediatype::IMAGE_INDEX)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_ACCEPTABLE);

    let (status, _, _) = send(
        &app,
        Request::builder()
            .uri("/v2/test/repo/manifests/latest")
            .header(
                header::ACCEPT,
                format!("{}, {}", mediatype::IMAGE_INDEX, mediatype::IMAGE_MANIFEST),
            )
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn delete_operations() {
    let app = test_server();
    let config = upload_blob(&app, "test/repo", b"{}").await;
    let manifest = manifest_with_config(&config, 2);
    let digest = upload_manifest(&app, "test/repo", "latest", &manifest).await;

    let (status, _, _) = send(
        &app,
        Request::builder()
            .method("DELETE")
            .uri("/v2/test/repo/manifests/latest")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (status, _, _) = send(
        &app,
        Request::builder()
            .method("DELETE")
            .uri(format!("/v2/test/repo/manifests/{digest}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (status, _, _) = send(
        &app,
        Request::builder()
            .method("DELETE")
            .uri(format!("/v2/test/repo/blobs/{config}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (status, _, _) = send(&app, get(&format!("/v2/test/repo/blobs/{config}"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn tag_listing_pagination() {
    let app = test_server();
    let config = upload_blob(&app, "test/repo", b"{}").await;
    let manifest = manifest_with_config(&config, 2);
    for tag in ["v1.0", "v1.1", "v2.0"] {
        upload_manifest(&app, "test/repo", tag, &manifest).await;
    }

    let (status, _, body) = send(&app, get("/v2/test/repo/tags/list")).await;
    assert_eq!(status, StatusCode::OK);
    let listing: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(listing["name"], "test/repo");
    assert_eq!(
        listing["tags"].as_array().unwrap().len(),
        3,
        "unexpected tags: {listing}"
    );

    let (status, headers, body) = send(&app, get("/v2/test/repo/tags/list?n=2")).await;
    assert_eq!(status, StatusCode::OK);
    let listing: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(listing["tags"], serde_json::json!(["v1.0", "v1.1"]));
    let link = headers[header::LINK].to_str().unwrap();
    assert!(link.contains("/v2/test/repo/tags/list?n=2&last="), "{link}");
    assert!(link.ends_with("; rel=\"next\""), "{link}");

    let (_, headers, body) = send(&app, get("/v2/test/repo/tags/list?n=2&last=v1.1")).await;
    let listing: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(listing["tags"], serde_json::json!(["v2.0"]));
    assert!(!headers.contains_key(header::LINK));
}

#[tokio::test]
async fn repository_catalog() {
    let app = test_server();
    upload_blob(&app, "a/one", b"1").await;
    upload_blob(&app, "b/two", b"2").await;

    let (status, _, body) = send(&app, get("/v2/_catalog")).await;
    assert_eq!(status, StatusCode::OK);
    let listing: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(listing["repositories"], serde_json::json!(["a/one", "b/two"]));

    let (_, _, body) = send(&app, get("/v2/_catalog?last=a%2Fone")).await;
    let listing: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(listing["repositories"], serde_json::json!(["b/two"]));
}

#[tokio::test]
async fn referrers_api() {
    let app = test_server();
    let config = upload_blob(&app, "test/repo", b"{}").await;
    let subject_manifest = manifest_with_config(&config, 2);
    let subject = upload_manifest(&app, "test/repo", "subject", &subject_manifest).await;

    let referrer = serde_json::to_vec(&serde_json::json!({
        "schemaVersion": 2,
        "mediaType": mediatype::IMAGE_MANIFEST,
        "artifactType": "application/example",
        "config": {
            "mediaType": mediatype::IMAGE_CONFIG,
            "digest": config.as_str(),
            "size": 2,
        },
        "layers": [],
        "subject": {
            "mediaType": mediatype::IMAGE_MANIFEST,
            "digest": subject.as_str(),
            "size": subject_manifest.len(),
        },
    }))
    .unwrap();
    let referrer_digest = Digest::from_bytes(&referrer);
    upload_manifest(&app, "test/repo", referrer_digest.as_str(), &referrer).await;

    let (status, headers, body) =
        send(&app, get(&format!("/v2/test/repo/referrers/{subject}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        headers[header::CONTENT_TYPE].to_str().unwrap(),
        mediatype::IMAGE_INDEX
    );
    let index: serde_json::Value = serde_json::from_slice(&body).unwrap();
    let manifests = index["manifests"].as_array().unwrap();
    assert_eq!(manifests.len(), 1);
    assert_eq!(manifests[0]["digest"], referrer_digest.as_str());
    assert_eq!(manifests[0]["artifactType"], "application/example");

    // Filtered by artifact type, with the filter advertised in a header.
    let (status, headers, body) = send(
        &app,
        get(&format!(
            "/v2/test/repo/referrers/{subject}?artifactType=application%2Fother"
        )),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["oci-filters-applied"].to_str().unwrap(), "artifactType");
    let index: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(index["manifests"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn referrers_api_can_be_disabled() {
    let app = ServerBuilder::new()
        .registry(MemRegistry::new())
        .disable_referrers_api()
        .build();
    let digest = Digest::from_bytes(b"anything");
    let (status, _, _) = send(&app, get(&format!("/v2/test/repo/referrers/{digest}"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn errors_render_in_wire_form() {
    let app = test_server();
    let digest = Digest::from_bytes(b"absent");
    let (status, _, body) = send(&app, get(&format!("/v2/test/repo/blobs/{digest}"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let wire: WireErrors = serde_json::from_slice(&body).unwrap();
    // The repository itself is unknown at this point.
    assert_eq!(wire.errors[0].code, ErrorCode::NAME_UNKNOWN);

    let (status, _, body) = send(&app, get("/v2/test/repo/blobs/not-a-digest")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let wire: WireErrors = serde_json::from_slice(&body).unwrap();
    assert_eq!(wire.errors[0].code, ErrorCode::DIGEST_INVALID);
}

#[tokio::test]
async fn unmatched_paths_are_plain_not_found() {
    let app = test_server();
    let (status, _, body) = send(&app, get("/v2/unterminated")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, &b"page not found"[..]);
}

// A partial implementation: only get_tag, returning an HTTP-wrapped coded
// error. Everything else reports UNSUPPORTED through the trait defaults.
struct TagOnly;

#[async_trait::async_trait]
impl Registry for TagOnly {
    async fn get_tag(&self, _repo: &str, _tag: &str) -> ociregistry::Result<ociregistry::BlobReader> {
        Err(Error::name_unknown().with_http_status(StatusCode::UNAUTHORIZED))
    }
}

#[tokio::test]
async fn known_error_code_overrides_wrapped_http_status() {
    let app = ServerBuilder::new().registry(TagOnly).build();
    let (status, _, body) = send(&app, get("/v2/foo/manifests/sometag")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let wire: WireErrors = serde_json::from_slice(&body).unwrap();
    assert_eq!(wire.errors[0].code, ErrorCode::NAME_UNKNOWN);
    assert_eq!(
        wire.errors[0].message,
        "401 Unauthorized: name unknown: repository name not known to registry"
    );
}

#[tokio::test]
async fn unsupported_operations_surface_as_errors() {
    let app = ServerBuilder::new().registry(TagOnly).build();
    let digest = Digest::from_bytes(b"x");
    let (status, _, body) = send(&app, get(&format!("/v2/foo/blobs/{digest}"))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let wire: WireErrors = serde_json::from_slice(&body).unwrap();
    assert_eq!(wire.errors[0].code, ErrorCode::UNSUPPORTED);
}

#[tokio::test]
async fn custom_error_writer_adds_headers() {
    let app = ServerBuilder::new()
        .registry(TagOnly)
        .write_error(|err| {
            let mut response = ociserver::error_response(err);
            response
                .headers_mut()
                .insert("some-header", "a value".parse().unwrap());
            response
        })
        .build();
    let (status, headers, _) = send(&app, get("/v2/foo/manifests/sometag")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(headers["some-header"].to_str().unwrap(), "a value");
}
