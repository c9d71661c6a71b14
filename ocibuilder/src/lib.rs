//! # ocibuilder
//!
//! A convenience layer for assembling an image manifest (or an index) and
//! pushing it, along with its content, to any
//! [`ociregistry::Registry`] implementation.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt as _};

use ociregistry::{mediatype, Descriptor, Digester, Error, Registry, Result};

/// Chunk size used when streaming layers through a chunked upload.
const LAYER_CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// The manifest being assembled. Handles both plain image manifests and
/// indexes; adding a manifest entry turns it into an index.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestOrIndex {
    pub schema_version: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub manifests: Vec<Descriptor>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Descriptor>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub layers: Vec<Descriptor>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<Descriptor>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// Assembles and pushes one image or artifact.
pub struct ImageBuilder {
    repository: String,
    registry: Arc<dyn Registry>,
    manifest: ManifestOrIndex,
}

impl ImageBuilder {
    pub fn new(registry: Arc<dyn Registry>, repository: impl Into<String>) -> Self {
        ImageBuilder {
            repository: repository.into(),
            registry,
            manifest: ManifestOrIndex {
                schema_version: 2,
                media_type: Some(mediatype::IMAGE_MANIFEST.to_string()),
                ..Default::default()
            },
        }
    }

    /// The manifest as currently assembled.
    pub fn manifest(&self) -> &ManifestOrIndex {
        &self.manifest
    }

    pub fn set_artifact_type(&mut self, artifact_type: impl Into<String>) {
        self.manifest.artifact_type = Some(artifact_type.into());
    }

    /// Link the manifest to a subject, making it a referrer of that
    /// manifest.
    pub fn set_subject(&mut self, subject: Descriptor) {
        self.manifest.subject = Some(subject);
    }

    pub fn set_config(&mut self, config: Descriptor) -> Result<()> {
        if !self.manifest.manifests.is_empty() {
            return Err(Error::message("cannot set config on an index manifest"));
        }
        self.manifest.config = Some(config);
        Ok(())
    }

    /// Record an already-pushed blob as a layer.
    pub fn add_layer(&mut self, layer: Descriptor) -> Result<()> {
        if !self.manifest.manifests.is_empty() {
            return Err(Error::message("cannot add layers to an index manifest"));
        }
        self.manifest.layers.push(layer);
        Ok(())
    }

    /// Record an already-pushed manifest, turning this build into an
    /// index.
    pub fn add_manifest(&mut self, manifest: Descriptor) -> Result<()> {
        if !self.manifest.layers.is_empty() || self.manifest.config.is_some() {
            return Err(Error::message("cannot add a manifest to an image manifest"));
        }
        self.manifest.media_type = Some(mediatype::IMAGE_INDEX.to_string());
        self.manifest.manifests.push(manifest);
        Ok(())
    }

    pub fn add_annotation(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.manifest.annotations.insert(key.into(), value.into());
    }

    /// Stream a layer into the repository through a chunked upload,
    /// computing its canonical digest on the way, and record it in the
    /// manifest.
    pub async fn push_layer(
        &mut self,
        media_type: &str,
        mut content: impl AsyncRead + Unpin + Send,
        annotations: BTreeMap<String, String>,
    ) -> Result<Descriptor> {
        let mut writer = self
            .registry
            .push_blob_chunked(&self.repository, LAYER_CHUNK_SIZE)
            .await
            .map_err(|err| err.context("cannot start chunked upload"))?;

        let mut digester = Digester::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = content
                .read(&mut buf)
                .await
                .map_err(|err| Error::from(err).context("reading layer content"))?;
            if n == 0 {
                break;
            }
            digester.update(&buf[..n]);
            writer
                .write(Bytes::copy_from_slice(&buf[..n]))
                .await
                .map_err(|err| err.context("writing chunk"))?;
        }
        let digest = digester.finalize();
        let mut desc = writer
            .commit(digest)
            .await
            .map_err(|err| err.context("committing layer"))?;
        tracing::debug!(repo = %self.repository, digest = %desc.digest, size = desc.size, "pushed layer");
        desc.media_type = media_type.to_string();
        if !annotations.is_empty() {
            desc.annotations = Some(annotations);
        }
        self.add_layer(desc.clone())?;
        Ok(desc)
    }

    /// Serialize the manifest and push it, optionally tagging it.
    pub async fn push(&self, tag: Option<&str>) -> Result<Descriptor> {
        let media_type = self
            .manifest
            .media_type
            .clone()
            .unwrap_or_else(|| mediatype::IMAGE_MANIFEST.to_string());
        let data = serde_json::to_vec(&self.manifest)
            .map_err(|err| Error::other(err).context("marshaling manifest"))?;
        self.registry
            .push_manifest(&self.repository, tag, None, Bytes::from(data), &media_type)
            .await
    }
}
