//! Every operation must attach the authorization scope the protocol
//! expects; a recording transport captures what the client asked for.

mod common;

use std::future::Future;

use bytes::Bytes;

use common::{recording_transport, TEST_HOST};
use ociclient::Client;
use ociregistry::{collect, mediatype, Descriptor, Digest, ReferrersRequest, Registry, TagsRequest};

async fn assert_scope<F, Fut>(want: &str, f: F)
where
    F: FnOnce(Client) -> Fut,
    Fut: Future<Output = ()>,
{
    let router = ociserver::ServerBuilder::new()
        .registry(ocimem::MemRegistry::new())
        .build();
    let (transport, scopes) = recording_transport(router);
    let client = Client::builder()
        .insecure()
        .transport(transport)
        .build(TEST_HOST)
        .unwrap();

    f(client).await;

    let mut recorded = scopes.lock().unwrap().clone();
    recorded.sort();
    recorded.dedup();
    assert_eq!(recorded, vec![want.to_string()]);
}

fn digest() -> Digest {
    Digest::from_bytes(b"some test content")
}

#[tokio::test]
async fn read_operations_need_pull() {
    assert_scope("repository:foo/bar:pull", |r| async move {
        let _ = r.get_blob("foo/bar", &digest()).await;
    })
    .await;
    assert_scope("repository:foo/bar:pull", |r| async move {
        let _ = r.get_blob_range("foo/bar", &digest(), 100, Some(200)).await;
    })
    .await;
    assert_scope("repository:foo/bar:pull", |r| async move {
        let _ = r.get_manifest("foo/bar", &digest()).await;
    })
    .await;
    assert_scope("repository:foo/bar:pull", |r| async move {
        let _ = r.get_tag("foo/bar", "sometag").await;
    })
    .await;
    assert_scope("repository:foo/bar:pull", |r| async move {
        let _ = r.resolve_blob("foo/bar", &digest()).await;
    })
    .await;
    assert_scope("repository:foo/bar:pull", |r| async move {
        let _ = r.resolve_manifest("foo/bar", &digest()).await;
    })
    .await;
    assert_scope("repository:foo/bar:pull", |r| async move {
        let _ = r.resolve_tag("foo/bar", "sometag").await;
    })
    .await;
}

#[tokio::test]
async fn write_operations_need_push() {
    assert_scope("repository:foo/bar:push", |r| async move {
        let desc = Descriptor::from_bytes(mediatype::OCTET_STREAM, b"foo");
        let _ = r.push_blob("foo/bar", &desc, Bytes::from_static(b"foo")).await;
    })
    .await;
    assert_scope("repository:foo/bar:push", |r| async move {
        let mut w = r.push_blob_chunked("foo/bar", 0).await.unwrap();
        w.write(Bytes::from_static(b"foo")).await.unwrap();
        w.close().await.unwrap();
        let id = w.id().to_string();
        drop(w);

        let mut w = r
            .push_blob_chunked_resume("foo/bar", &id, 3, 0)
            .await
            .unwrap();
        w.write(Bytes::from_static(b"bar")).await.unwrap();
        w.commit(Digest::from_bytes(b"foobar")).await.unwrap();
    })
    .await;
    assert_scope("repository:foo/bar:push", |r| async move {
        let _ = r
            .push_manifest(
                "foo/bar",
                Some("sometag"),
                None,
                Bytes::from_static(b"something"),
                "application/json",
            )
            .await;
    })
    .await;
    assert_scope("repository:foo/bar:push", |r| async move {
        let _ = r.delete_blob("foo/bar", &digest()).await;
    })
    .await;
    assert_scope("repository:foo/bar:push", |r| async move {
        let _ = r.delete_manifest("foo/bar", &digest()).await;
    })
    .await;
    assert_scope("repository:foo/bar:push", |r| async move {
        let _ = r.delete_tag("foo/bar", "sometag").await;
    })
    .await;
}

#[tokio::test]
async fn mount_needs_both_repositories() {
    assert_scope(
        "repository:x/y:pull repository:z/w:push",
        |r| async move {
            let _ = r.mount_blob("x/y", "z/w", &digest()).await;
        },
    )
    .await;
}

#[tokio::test]
async fn listings() {
    assert_scope("registry:catalog:*", |r| async move {
        let _ = collect(r.repositories(None)).await;
    })
    .await;
    assert_scope("repository:foo/bar:pull", |r| async move {
        let _ = collect(r.tags("foo/bar", &TagsRequest::default())).await;
    })
    .await;
    assert_scope("repository:foo/bar:pull", |r| async move {
        let _ = collect(r.referrers("foo/bar", &digest(), &ReferrersRequest::default())).await;
    })
    .await;
}
