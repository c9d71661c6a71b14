//! # ocimem
//!
//! An in-memory [`ociregistry::Registry`] implementation enforcing the full
//! OCI content model: blob/manifest/tag namespaces, digest verification,
//! chunked uploads with resume, referrers discovery, cross-repository
//! mounting and an optional immutable-tag policy.
//!
//! All state lives behind one mutex per registry; operations are short and
//! memory-bound, so the coarse lock is never held across I/O.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;

use ociregistry::{Descriptor, Digest, Error, ErrorCode, Result};

mod buffer;
mod manifest;
mod registry;

pub(crate) use self::buffer::Buffer;

/// Behavior switches for a [`MemRegistry`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Config {
    /// Refuse to repoint an existing tag at different content.
    pub immutable_tags: bool,

    /// Skip the check that every blob and manifest referenced by a pushed
    /// manifest already exists in the repository.
    pub lax_child_references: bool,
}

/// An in-memory registry.
///
/// Cloning is cheap and clones share the same state.
#[derive(Debug, Clone)]
pub struct MemRegistry {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    cfg: Config,
    state: Mutex<State>,
    next_upload: AtomicU64,
}

#[derive(Debug, Default)]
pub(crate) struct State {
    pub(crate) repos: BTreeMap<String, Repo>,
}

#[derive(Debug, Default)]
pub(crate) struct Repo {
    pub(crate) blobs: HashMap<Digest, Arc<Blob>>,
    pub(crate) manifests: HashMap<Digest, Arc<Blob>>,
    pub(crate) tags: BTreeMap<String, Descriptor>,
    pub(crate) uploads: HashMap<String, Arc<Mutex<Buffer>>>,
}

/// Stored content: blobs and manifests share this shape, in separate
/// namespaces.
#[derive(Debug)]
pub(crate) struct Blob {
    pub(crate) media_type: String,
    pub(crate) data: Bytes,
}

impl Blob {
    pub(crate) fn descriptor(&self, digest: &Digest) -> Descriptor {
        Descriptor {
            media_type: self.media_type.clone(),
            digest: digest.clone(),
            size: self.data.len() as u64,
            annotations: None,
            artifact_type: None,
        }
    }
}

impl Default for MemRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MemRegistry {
    /// A new empty registry with default configuration.
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    /// A new empty registry with the given configuration.
    pub fn with_config(cfg: Config) -> Self {
        MemRegistry {
            inner: Arc::new(Inner {
                cfg,
                state: Mutex::new(State::default()),
                next_upload: AtomicU64::new(1),
            }),
        }
    }

    pub(crate) fn cfg(&self) -> &Config {
        &self.inner.cfg
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().expect("registry state lock")
    }

    pub(crate) fn new_upload_id(&self) -> String {
        let n = self.inner.next_upload.fetch_add(1, Ordering::Relaxed);
        format!("upload-{n}")
    }
}

impl State {
    /// Look up an existing repository.
    pub(crate) fn repo(&self, name: &str) -> Result<&Repo> {
        check_repo_name(name)?;
        self.repos
            .get(name)
            .ok_or_else(Error::name_unknown)
    }

    /// Look up a repository, creating it if the name is valid.
    pub(crate) fn make_repo(&mut self, name: &str) -> Result<&mut Repo> {
        check_repo_name(name)?;
        Ok(self.repos.entry(name.to_string()).or_default())
    }
}

pub(crate) fn check_repo_name(name: &str) -> Result<()> {
    if !ociregistry::refname::is_valid_repo_name(name) {
        return Err(Error::name_invalid());
    }
    Ok(())
}

/// Validate a descriptor, optionally against the content it describes.
///
/// Content verification only applies to canonical digest algorithms;
/// non-canonical digests are accepted verbatim.
pub(crate) fn check_descriptor(desc: &Descriptor, data: Option<&[u8]>) -> Result<()> {
    if desc.media_type.is_empty() {
        return Err(Error::new(
            ErrorCode::MANIFEST_INVALID,
            "no media type in descriptor",
        ));
    }
    if !Digest::is_valid(desc.digest.as_str()) {
        return Err(Error::new(ErrorCode::DIGEST_INVALID, "badly formed digest"));
    }
    if let Some(data) = data {
        if desc.size != data.len() as u64 {
            return Err(Error::new(
                ErrorCode::SIZE_INVALID,
                format!(
                    "descriptor size {} does not match content length {}",
                    desc.size,
                    data.len()
                ),
            ));
        }
        if !desc.digest.matches(data) {
            return Err(Error::new(
                ErrorCode::DIGEST_INVALID,
                "digest does not match content",
            ));
        }
    }
    Ok(())
}
