//! The client side of chunked blob uploads.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use http::{header, Method, StatusCode, Uri};

use ociauth::Scope;
use ociregistry::{mediatype, BlobWriter, Descriptor, Digest, Error, ErrorCode, Result};

use crate::{encode_query_value, Client};

/// Fallback chunk size when neither the caller nor the registry suggests
/// one.
const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// A chunked upload in progress against a remote registry.
///
/// Writes are buffered until they reach the chunk size, then dispatched as
/// a `PATCH` with a `Content-Range`; the server hands back the next upload
/// URL in each response's `Location` header. The upload ID is the current
/// upload URL, so a writer can be reconstructed from it later.
pub(crate) struct ClientWriter {
    client: Client,
    repo: String,
    location: Uri,
    id: String,
    chunk_size: usize,
    /// Bytes the registry has acknowledged.
    flushed: u64,
    buffer: BytesMut,
}

impl ClientWriter {
    /// Start a fresh upload session.
    pub(crate) async fn start(client: Client, repo: &str, chunk_size: usize) -> Result<Self> {
        let req = client
            .request(Method::POST, &format!("/v2/{repo}/blobs/uploads/"))
            .scope(Scope::push(repo))
            .build()?;
        let response = client.roundtrip_ok(req).await?;
        if response.status() != StatusCode::ACCEPTED {
            return Err(Error::message(format!(
                "unexpected status {} starting blob upload",
                response.status()
            )));
        }
        let location = client.location_uri(&response)?;
        let min_chunk = response
            .headers()
            .get("oci-chunk-min-length")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(0);
        Ok(Self::attach(client, repo, location, chunk_size.max(min_chunk), 0))
    }

    /// Reattach to an existing session. With a negative offset the current
    /// upload progress is fetched from the registry.
    pub(crate) async fn resume(
        client: Client,
        repo: &str,
        id: &str,
        offset: i64,
        chunk_size: usize,
    ) -> Result<Self> {
        let location: Uri = id
            .parse()
            .map_err(|_| Error::new(ErrorCode::BLOB_UPLOAD_INVALID, "malformed upload ID"))?;
        let flushed = if offset >= 0 {
            offset as u64
        } else {
            let req = client
                .request_uri(Method::GET, &location)
                .scope(Scope::push(repo))
                .build()?;
            let response = client.roundtrip_ok(req).await?;
            upload_progress(&response)?
        };
        Ok(Self::attach(client, repo, location, chunk_size, flushed))
    }

    fn attach(client: Client, repo: &str, location: Uri, chunk_size: usize, flushed: u64) -> Self {
        let chunk_size = if chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            chunk_size
        };
        let id = location.to_string();
        ClientWriter {
            client,
            repo: repo.to_string(),
            location,
            id,
            chunk_size,
            flushed,
            buffer: BytesMut::new(),
        }
    }

    async fn flush_buffer(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let chunk = self.buffer.split().freeze();
        let start = self.flushed;
        let end = start + chunk.len() as u64 - 1;
        let req = self
            .client
            .request_uri(Method::PATCH, &self.location)
            .scope(Scope::push(&self.repo))
            .header(header::CONTENT_RANGE, format!("{start}-{end}"))
            .header(header::CONTENT_TYPE, mediatype::OCTET_STREAM)
            .body(chunk.clone())
            .build()?;
        let response = self.client.roundtrip_ok(req).await?;
        if response.status() != StatusCode::ACCEPTED {
            return Err(Error::message(format!(
                "unexpected status {} writing blob chunk",
                response.status()
            )));
        }
        self.flushed = end + 1;
        self.update_location(&response)?;
        Ok(())
    }

    fn update_location(&mut self, response: &http::Response<hyperdriver::Body>) -> Result<()> {
        if response.headers().contains_key(header::LOCATION) {
            self.location = self.client.location_uri(response)?;
            self.id = self.location.to_string();
        }
        Ok(())
    }
}

#[async_trait]
impl BlobWriter for ClientWriter {
    fn id(&self) -> &str {
        &self.id
    }

    fn size(&self) -> u64 {
        self.flushed + self.buffer.len() as u64
    }

    fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    async fn write(&mut self, chunk: Bytes) -> Result<()> {
        self.buffer.extend_from_slice(&chunk);
        while self.buffer.len() >= self.chunk_size {
            self.flush_buffer().await?;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.flush_buffer().await
    }

    async fn commit(mut self: Box<Self>, digest: Digest) -> Result<Descriptor> {
        // Any buffered remainder rides along with the final PUT.
        let remainder = self.buffer.split().freeze();
        let size = self.flushed + remainder.len() as u64;
        let separator = if self.location.query().is_some() { '&' } else { '?' };
        let uri: Uri = format!(
            "{}{}digest={}",
            self.location,
            separator,
            encode_query_value(digest.as_str())
        )
        .parse()
        .map_err(|err| Error::other(err).context("cannot build commit URL"))?;
        let req = self
            .client
            .request_uri(Method::PUT, &uri)
            .scope(Scope::push(&self.repo))
            .header(header::CONTENT_TYPE, mediatype::OCTET_STREAM)
            .body(remainder)
            .build()?;
        let response = self.client.roundtrip_ok(req).await?;
        if response.status() != StatusCode::CREATED {
            return Err(Error::message(format!(
                "unexpected status {} committing blob upload",
                response.status()
            )));
        }
        Ok(Descriptor {
            media_type: mediatype::OCTET_STREAM.to_string(),
            digest,
            size,
            annotations: None,
            artifact_type: None,
        })
    }

    async fn cancel(self: Box<Self>) -> Result<()> {
        let req = self
            .client
            .request_uri(Method::DELETE, &self.location)
            .scope(Scope::push(&self.repo))
            .build()?;
        self.client.roundtrip_ok(req).await?;
        Ok(())
    }
}

// Current progress from a GET on the upload URL: `Range: 0-<last>`.
fn upload_progress(response: &http::Response<hyperdriver::Body>) -> Result<u64> {
    let range = response
        .headers()
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| Error::message("upload status response carries no Range header"))?;
    let (start, end) = range
        .split_once('-')
        .ok_or_else(|| Error::message("malformed Range header in upload status"))?;
    let _: u64 = start
        .trim()
        .parse()
        .map_err(|_| Error::message("malformed Range header in upload status"))?;
    let end: u64 = end
        .trim()
        .parse()
        .map_err(|_| Error::message("malformed Range header in upload status"))?;
    // "0-0" denotes an empty upload.
    Ok(if end == 0 { 0 } else { end + 1 })
}
