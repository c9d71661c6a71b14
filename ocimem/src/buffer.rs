//! Chunked upload sessions.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;

use ociregistry::{mediatype, BlobWriter, Descriptor, Digest, Error, ErrorCode, Result};

use crate::{Blob, MemRegistry};

/// Default chunk size hint reported to writers that did not ask for one.
pub(crate) const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// The server-side state of one upload session.
#[derive(Debug)]
pub(crate) struct Buffer {
    pub(crate) id: String,
    pub(crate) data: Vec<u8>,
    /// An upload session accepts one writer at a time.
    pub(crate) attached: bool,
}

impl Buffer {
    pub(crate) fn new(id: String) -> Self {
        Buffer {
            id,
            data: Vec::new(),
            attached: false,
        }
    }
}

/// [`BlobWriter`] over a [`MemRegistry`] upload session.
pub struct MemWriter {
    registry: MemRegistry,
    repo: String,
    id: String,
    chunk_size: usize,
    buffer: Arc<Mutex<Buffer>>,
    detached: bool,
}

impl MemWriter {
    pub(crate) fn new(
        registry: MemRegistry,
        repo: String,
        chunk_size: usize,
        buffer: Arc<Mutex<Buffer>>,
    ) -> Self {
        let id = buffer.lock().expect("upload buffer lock").id.clone();
        MemWriter {
            registry,
            repo,
            id,
            chunk_size: if chunk_size == 0 {
                DEFAULT_CHUNK_SIZE
            } else {
                chunk_size
            },
            buffer,
            detached: false,
        }
    }

    fn detach(&mut self) {
        if !self.detached {
            self.detached = true;
            self.buffer.lock().expect("upload buffer lock").attached = false;
        }
    }

    fn remove_session(&self) {
        let mut state = self.registry.lock();
        if let Some(repo) = state.repos.get_mut(&self.repo) {
            repo.uploads.remove(&self.id);
        }
    }
}

impl Drop for MemWriter {
    fn drop(&mut self) {
        // An abandoned writer leaves the session open for resumption.
        self.detach();
    }
}

#[async_trait]
impl BlobWriter for MemWriter {
    fn id(&self) -> &str {
        &self.id
    }

    fn size(&self) -> u64 {
        self.buffer.lock().expect("upload buffer lock").data.len() as u64
    }

    fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    async fn write(&mut self, chunk: Bytes) -> Result<()> {
        let mut buffer = self.buffer.lock().expect("upload buffer lock");
        buffer.data.extend_from_slice(&chunk);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.detach();
        Ok(())
    }

    async fn commit(mut self: Box<Self>, digest: Digest) -> Result<Descriptor> {
        if !Digest::is_valid(digest.as_str()) {
            return Err(Error::new(ErrorCode::DIGEST_INVALID, "badly formed digest"));
        }
        let data = {
            let mut buffer = self.buffer.lock().expect("upload buffer lock");
            std::mem::take(&mut buffer.data)
        };
        if !digest.matches(&data) {
            // Put the content back so the session stays resumable.
            self.buffer.lock().expect("upload buffer lock").data = data;
            return Err(Error::new(
                ErrorCode::DIGEST_INVALID,
                "uploaded content does not match expected digest",
            ));
        }
        let desc = Descriptor {
            media_type: mediatype::OCTET_STREAM.to_string(),
            digest: digest.clone(),
            size: data.len() as u64,
            annotations: None,
            artifact_type: None,
        };
        {
            let mut state = self.registry.lock();
            let repo = state.make_repo(&self.repo)?;
            repo.blobs.insert(
                digest,
                Arc::new(Blob {
                    media_type: desc.media_type.clone(),
                    data: Bytes::from(data),
                }),
            );
            repo.uploads.remove(&self.id);
        }
        tracing::trace!(repo = %self.repo, id = %self.id, size = desc.size, "committed chunked upload");
        self.detach();
        Ok(desc)
    }

    async fn cancel(mut self: Box<Self>) -> Result<()> {
        self.remove_session();
        self.detach();
        Ok(())
    }
}
