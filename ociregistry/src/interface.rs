//! The registry capability surface.
//!
//! [`Registry`] abstracts any registry implementation: the in-memory engine,
//! the HTTP client, and wrappers that filter another implementation. Every
//! method has a default body returning `UNSUPPORTED`, so partial
//! implementations override only what they provide and compose by
//! delegation. Cancellation follows the usual async contract: dropping a
//! returned future abandons the operation.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt as _;

use crate::digest::Digest;
use crate::error::{BoxError, Error, Result};
use crate::types::Descriptor;

/// A lazy sequence of listing results. The terminal error, if any, is the
/// final item of the stream.
pub type Listing<T> = BoxStream<'static, Result<T>>;

/// A listing that yields the given error exactly once.
pub fn error_listing<T: Send + 'static>(err: Error) -> Listing<T> {
    futures::stream::once(async move { Err(err) }).boxed()
}

/// A listing over an already-materialized sequence of items.
pub fn listing_from<T: Send + 'static>(items: Vec<T>) -> Listing<T> {
    futures::stream::iter(items.into_iter().map(Ok)).boxed()
}

/// Collect a listing, stopping at the first error.
pub async fn collect<T>(mut listing: Listing<T>) -> Result<Vec<T>> {
    let mut items = Vec::new();
    while let Some(item) = listing.next().await {
        items.push(item?);
    }
    Ok(items)
}

/// Parameters for [`Registry::tags`].
#[derive(Debug, Clone, Default)]
pub struct TagsRequest {
    /// Resume listing after this tag.
    pub last: Option<String>,
}

/// Parameters for [`Registry::referrers`].
#[derive(Debug, Clone, Default)]
pub struct ReferrersRequest {
    /// Only yield referrers with this artifact type.
    pub artifact_type: Option<String>,
}

/// The registry capability surface.
#[async_trait]
pub trait Registry: Send + Sync + 'static {
    /// Open the blob with the given digest for reading.
    async fn get_blob(&self, repo: &str, digest: &Digest) -> Result<BlobReader> {
        let _ = (repo, digest);
        Err(unsupported("get_blob"))
    }

    /// Open a byte range of a blob: inclusive `start`, exclusive `end`,
    /// `None` meaning to the end of the blob. The reader's descriptor still
    /// reports the size of the whole blob.
    async fn get_blob_range(
        &self,
        repo: &str,
        digest: &Digest,
        start: u64,
        end: Option<u64>,
    ) -> Result<BlobReader> {
        let _ = (repo, digest, start, end);
        Err(unsupported("get_blob_range"))
    }

    /// Open the manifest with the given digest for reading.
    async fn get_manifest(&self, repo: &str, digest: &Digest) -> Result<BlobReader> {
        let _ = (repo, digest);
        Err(unsupported("get_manifest"))
    }

    /// Open the manifest named by a tag for reading.
    async fn get_tag(&self, repo: &str, tag: &str) -> Result<BlobReader> {
        let _ = (repo, tag);
        Err(unsupported("get_tag"))
    }

    /// Describe a blob without fetching it.
    async fn resolve_blob(&self, repo: &str, digest: &Digest) -> Result<Descriptor> {
        let _ = (repo, digest);
        Err(unsupported("resolve_blob"))
    }

    /// Describe a manifest without fetching it.
    async fn resolve_manifest(&self, repo: &str, digest: &Digest) -> Result<Descriptor> {
        let _ = (repo, digest);
        Err(unsupported("resolve_manifest"))
    }

    /// Describe the manifest a tag points at without fetching it.
    async fn resolve_tag(&self, repo: &str, tag: &str) -> Result<Descriptor> {
        let _ = (repo, tag);
        Err(unsupported("resolve_tag"))
    }

    /// Push a blob in one request. The content must match `desc`.
    async fn push_blob(&self, repo: &str, desc: &Descriptor, content: Bytes) -> Result<Descriptor> {
        let _ = (repo, desc, content);
        Err(unsupported("push_blob"))
    }

    /// Start a chunked blob upload. `chunk_size` is a hint; implementations
    /// may impose a larger minimum, reported by [`BlobWriter::chunk_size`].
    async fn push_blob_chunked(&self, repo: &str, chunk_size: usize) -> Result<Box<dyn BlobWriter>> {
        let _ = (repo, chunk_size);
        Err(unsupported("push_blob_chunked"))
    }

    /// Resume a chunked blob upload. `offset` is the caller's idea of how
    /// many bytes have been written so far; pass -1 to continue from
    /// whatever the current offset is.
    async fn push_blob_chunked_resume(
        &self,
        repo: &str,
        id: &str,
        offset: i64,
        chunk_size: usize,
    ) -> Result<Box<dyn BlobWriter>> {
        let _ = (repo, id, offset, chunk_size);
        Err(unsupported("push_blob_chunked_resume"))
    }

    /// Make a blob stored in `from_repo` available in `to_repo` without
    /// re-uploading it.
    async fn mount_blob(&self, from_repo: &str, to_repo: &str, digest: &Digest) -> Result<Descriptor> {
        let _ = (from_repo, to_repo, digest);
        Err(unsupported("mount_blob"))
    }

    /// Push a manifest, optionally tagging it, optionally verifying it
    /// against a caller-provided digest (which may use a non-canonical
    /// algorithm).
    async fn push_manifest(
        &self,
        repo: &str,
        tag: Option<&str>,
        digest: Option<&Digest>,
        contents: Bytes,
        media_type: &str,
    ) -> Result<Descriptor> {
        let _ = (repo, tag, digest, contents, media_type);
        Err(unsupported("push_manifest"))
    }

    /// Delete a blob. Dangling references are permitted.
    async fn delete_blob(&self, repo: &str, digest: &Digest) -> Result<()> {
        let _ = (repo, digest);
        Err(unsupported("delete_blob"))
    }

    /// Delete a manifest. Dangling references are permitted.
    async fn delete_manifest(&self, repo: &str, digest: &Digest) -> Result<()> {
        let _ = (repo, digest);
        Err(unsupported("delete_manifest"))
    }

    /// Delete a tag, leaving the manifest it pointed at in place.
    async fn delete_tag(&self, repo: &str, tag: &str) -> Result<()> {
        let _ = (repo, tag);
        Err(unsupported("delete_tag"))
    }

    /// All repository names, in lexical order, starting after `start_after`
    /// if given.
    fn repositories(&self, start_after: Option<String>) -> Listing<String> {
        let _ = start_after;
        error_listing(unsupported("repositories"))
    }

    /// All tags in a repository, in lexical order.
    fn tags(&self, repo: &str, params: &TagsRequest) -> Listing<String> {
        let _ = (repo, params);
        error_listing(unsupported("tags"))
    }

    /// Descriptors of all manifests whose `subject` names the given digest.
    fn referrers(&self, repo: &str, digest: &Digest, params: &ReferrersRequest) -> Listing<Descriptor> {
        let _ = (repo, digest, params);
        error_listing(unsupported("referrers"))
    }
}

fn unsupported(method: &str) -> Error {
    Error::unsupported().context(method)
}

/// A streaming blob read paired with the blob's descriptor.
///
/// The descriptor always reflects the full blob, even when the reader was
/// opened on a range.
pub struct BlobReader {
    descriptor: Descriptor,
    stream: BoxStream<'static, Result<Bytes, BoxError>>,
}

impl std::fmt::Debug for BlobReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobReader")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

impl BlobReader {
    /// A reader over fully materialized content.
    pub fn from_bytes(descriptor: Descriptor, data: Bytes) -> Self {
        BlobReader {
            descriptor,
            stream: futures::stream::once(async move { Ok(data) }).boxed(),
        }
    }

    /// A reader over a stream of chunks.
    pub fn from_stream(
        descriptor: Descriptor,
        stream: impl futures::Stream<Item = Result<Bytes, BoxError>> + Send + 'static,
    ) -> Self {
        BlobReader {
            descriptor,
            stream: stream.boxed(),
        }
    }

    /// The descriptor of the blob being read.
    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    /// The underlying chunk stream.
    pub fn into_stream(self) -> BoxStream<'static, Result<Bytes, BoxError>> {
        self.stream
    }

    /// Collect the remaining content into one buffer.
    pub async fn bytes(mut self) -> Result<Bytes> {
        let mut buf = bytes::BytesMut::new();
        while let Some(chunk) = self.stream.next().await {
            let chunk = chunk.map_err(|err| Error::Other(err).context("cannot read content"))?;
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }
}

/// An in-progress chunked blob upload.
#[async_trait]
pub trait BlobWriter: Send {
    /// The upload session ID, usable with
    /// [`Registry::push_blob_chunked_resume`].
    fn id(&self) -> &str;

    /// How many bytes have been written to the session so far.
    fn size(&self) -> u64;

    /// The chunk size the registry would like writers to use.
    fn chunk_size(&self) -> usize;

    /// Append content to the upload.
    async fn write(&mut self, chunk: Bytes) -> Result<()>;

    /// Flush buffered content, leaving the session open for resumption.
    async fn close(&mut self) -> Result<()>;

    /// Complete the upload. Fails with `DIGEST_INVALID` if the uploaded
    /// content does not match `digest`.
    async fn commit(self: Box<Self>, digest: Digest) -> Result<Descriptor>;

    /// Abandon the upload and discard the session.
    async fn cancel(self: Box<Self>) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Stub;
    impl Registry for Stub {}

    #[tokio::test]
    async fn default_methods_are_unsupported() {
        let reg = Stub;
        let err = reg
            .get_blob("foo", &Digest::from_bytes(b""))
            .await
            .unwrap_err();
        assert!(err.is_code(&crate::ErrorCode::UNSUPPORTED));
        assert_eq!(
            err.to_string(),
            "get_blob: unsupported: the operation is unsupported"
        );
    }

    #[tokio::test]
    async fn unsupported_listing_yields_one_error() {
        let reg = Stub;
        let mut listing = reg.repositories(None);
        let mut items = 0;
        while let Some(item) = listing.next().await {
            assert!(item.unwrap_err().is_code(&crate::ErrorCode::UNSUPPORTED));
            items += 1;
        }
        assert_eq!(items, 1);
    }

    #[tokio::test]
    async fn blob_reader_collects_stream() {
        let desc = Descriptor::from_bytes("application/octet-stream", b"foobar");
        let chunks: Vec<Result<Bytes, BoxError>> =
            vec![Ok(Bytes::from_static(b"foo")), Ok(Bytes::from_static(b"bar"))];
        let reader = BlobReader::from_stream(desc.clone(), futures::stream::iter(chunks));
        assert_eq!(reader.descriptor(), &desc);
        assert_eq!(reader.bytes().await.unwrap(), Bytes::from_static(b"foobar"));
    }
}
