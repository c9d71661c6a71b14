//! # ocifilter
//!
//! Wrappers that adjust the behavior of another
//! [`ociregistry::Registry`] implementation. Filters compose: each wraps
//! an inner registry and overrides only the operations it cares about,
//! delegating the rest.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use ociregistry::{
    BlobReader, BlobWriter, Descriptor, Digest, Error, Listing, ReferrersRequest, Registry, Result,
    TagsRequest,
};

/// Wrap `inner` so content can be added but never changed or removed:
/// deletes are denied and tags cannot be repointed at different content.
/// Re-pushing identical content stays allowed.
pub fn immutable(inner: impl Registry) -> Immutable {
    Immutable {
        inner: Arc::new(inner),
    }
}

/// See [`immutable`].
#[derive(Clone)]
pub struct Immutable {
    inner: Arc<dyn Registry>,
}

#[async_trait]
impl Registry for Immutable {
    async fn get_blob(&self, repo: &str, digest: &Digest) -> Result<BlobReader> {
        self.inner.get_blob(repo, digest).await
    }

    async fn get_blob_range(
        &self,
        repo: &str,
        digest: &Digest,
        start: u64,
        end: Option<u64>,
    ) -> Result<BlobReader> {
        self.inner.get_blob_range(repo, digest, start, end).await
    }

    async fn get_manifest(&self, repo: &str, digest: &Digest) -> Result<BlobReader> {
        self.inner.get_manifest(repo, digest).await
    }

    async fn get_tag(&self, repo: &str, tag: &str) -> Result<BlobReader> {
        self.inner.get_tag(repo, tag).await
    }

    async fn resolve_blob(&self, repo: &str, digest: &Digest) -> Result<Descriptor> {
        self.inner.resolve_blob(repo, digest).await
    }

    async fn resolve_manifest(&self, repo: &str, digest: &Digest) -> Result<Descriptor> {
        self.inner.resolve_manifest(repo, digest).await
    }

    async fn resolve_tag(&self, repo: &str, tag: &str) -> Result<Descriptor> {
        self.inner.resolve_tag(repo, tag).await
    }

    async fn push_blob(&self, repo: &str, desc: &Descriptor, content: Bytes) -> Result<Descriptor> {
        self.inner.push_blob(repo, desc, content).await
    }

    async fn push_blob_chunked(&self, repo: &str, chunk_size: usize) -> Result<Box<dyn BlobWriter>> {
        self.inner.push_blob_chunked(repo, chunk_size).await
    }

    async fn push_blob_chunked_resume(
        &self,
        repo: &str,
        id: &str,
        offset: i64,
        chunk_size: usize,
    ) -> Result<Box<dyn BlobWriter>> {
        self.inner
            .push_blob_chunked_resume(repo, id, offset, chunk_size)
            .await
    }

    async fn mount_blob(&self, from_repo: &str, to_repo: &str, digest: &Digest) -> Result<Descriptor> {
        self.inner.mount_blob(from_repo, to_repo, digest).await
    }

    async fn push_manifest(
        &self,
        repo: &str,
        tag: Option<&str>,
        digest: Option<&Digest>,
        contents: Bytes,
        media_type: &str,
    ) -> Result<Descriptor> {
        let Some(tag) = tag else {
            // Untagged pushes are content-addressed and so inherently
            // immutable.
            return self
                .inner
                .push_manifest(repo, None, digest, contents, media_type)
                .await;
        };
        let dig = match digest {
            Some(dig) => dig.clone(),
            None => Digest::from_bytes(&contents),
        };
        if let Ok(desc) = self.inner.resolve_tag(repo, tag).await {
            if desc.digest != dig {
                return Err(Error::denied().context("this store is immutable"));
            }
        }
        let desc = self
            .inner
            .push_manifest(repo, Some(tag), digest, contents, media_type)
            .await?;
        // Someone might have pushed the same tag concurrently; if the tag
        // no longer names our content, the push lost the race.
        let tag_desc = self
            .inner
            .resolve_tag(repo, tag)
            .await
            .map_err(|err| err.context(format!("cannot resolve tag {tag:?} that was just pushed")))?;
        if tag_desc.digest != dig {
            return Err(Error::denied().context("this store is immutable"));
        }
        Ok(desc)
    }

    async fn delete_blob(&self, _repo: &str, _digest: &Digest) -> Result<()> {
        Err(Error::denied())
    }

    async fn delete_manifest(&self, _repo: &str, _digest: &Digest) -> Result<()> {
        Err(Error::denied())
    }

    async fn delete_tag(&self, _repo: &str, _tag: &str) -> Result<()> {
        Err(Error::denied())
    }

    fn repositories(&self, start_after: Option<String>) -> Listing<String> {
        self.inner.repositories(start_after)
    }

    fn tags(&self, repo: &str, params: &TagsRequest) -> Listing<String> {
        self.inner.tags(repo, params)
    }

    fn referrers(&self, repo: &str, digest: &Digest, params: &ReferrersRequest) -> Listing<Descriptor> {
        self.inner.referrers(repo, digest, params)
    }
}
