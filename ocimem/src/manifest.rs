//! Manifest reference extraction.

use ociregistry::{mediatype, Descriptor, Error, ErrorCode, Index, Manifest, Result};
use serde::Deserialize;

/// The role a descriptor plays inside a manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RefKind {
    /// Must resolve to a blob in the same repository.
    Blob,
    /// Must resolve to a manifest in the same repository.
    Manifest,
    /// The `subject` link; allowed to dangle.
    Subject,
}

#[derive(Debug)]
pub(crate) struct ManifestRef {
    pub(crate) kind: RefKind,
    /// Which field the reference came from, for error messages.
    pub(crate) name: String,
    pub(crate) desc: Descriptor,
}

/// Extract the descriptors a manifest references, tagged by kind.
///
/// Manifests with an unrecognized media type are arbitrary artifacts: they
/// reference nothing we can enforce.
pub(crate) fn manifest_references(media_type: &str, data: &[u8]) -> Result<Vec<ManifestRef>> {
    let mut refs = Vec::new();
    match media_type {
        mediatype::IMAGE_MANIFEST | mediatype::DOCKER_MANIFEST => {
            let manifest: Manifest = decode(data)?;
            if let Some(config) = manifest.config {
                refs.push(ManifestRef {
                    kind: RefKind::Blob,
                    name: "config".to_string(),
                    desc: config,
                });
            }
            for (i, layer) in manifest.layers.into_iter().enumerate() {
                refs.push(ManifestRef {
                    kind: RefKind::Blob,
                    name: format!("layers[{i}]"),
                    desc: layer,
                });
            }
            if let Some(subject) = manifest.subject {
                refs.push(ManifestRef {
                    kind: RefKind::Subject,
                    name: "subject".to_string(),
                    desc: subject,
                });
            }
        }
        mediatype::IMAGE_INDEX | mediatype::DOCKER_MANIFEST_LIST => {
            let index: Index = decode(data)?;
            for (i, manifest) in index.manifests.into_iter().enumerate() {
                refs.push(ManifestRef {
                    kind: RefKind::Manifest,
                    name: format!("manifests[{i}]"),
                    desc: manifest,
                });
            }
            if let Some(subject) = index.subject {
                refs.push(ManifestRef {
                    kind: RefKind::Subject,
                    name: "subject".to_string(),
                    desc: subject,
                });
            }
        }
        _ => {}
    }
    Ok(refs)
}

fn decode<'a, T: Deserialize<'a>>(data: &'a [u8]) -> Result<T> {
    serde_json::from_slice(data)
        .map_err(|err| Error::new(ErrorCode::MANIFEST_INVALID, err.to_string()))
}

// The fields referrers discovery needs, parsed leniently so manifests of
// any media type participate in the graph.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SubjectProbe {
    #[serde(default)]
    pub(crate) subject: Option<Descriptor>,
    #[serde(default)]
    pub(crate) artifact_type: Option<String>,
    #[serde(default)]
    pub(crate) config: Option<ConfigProbe>,
    #[serde(default)]
    pub(crate) annotations: Option<std::collections::BTreeMap<String, String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ConfigProbe {
    #[serde(default)]
    pub(crate) media_type: Option<String>,
}

impl SubjectProbe {
    pub(crate) fn parse(data: &[u8]) -> SubjectProbe {
        serde_json::from_slice(data).unwrap_or_default()
    }

    /// The artifact type a referrer descriptor reports: the manifest's own
    /// `artifactType`, falling back to the config media type.
    pub(crate) fn effective_artifact_type(&self) -> Option<String> {
        self.artifact_type
            .clone()
            .or_else(|| self.config.as_ref().and_then(|c| c.media_type.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ociregistry::Digest;

    fn desc(data: &[u8]) -> Descriptor {
        Descriptor {
            media_type: "application/octet-stream".to_string(),
            digest: Digest::from_bytes(data),
            size: data.len() as u64,
            annotations: None,
            artifact_type: None,
        }
    }

    #[test]
    fn image_manifest_references() {
        let manifest = Manifest {
            schema_version: 2,
            media_type: Some(mediatype::IMAGE_MANIFEST.to_string()),
            config: Some(desc(b"config")),
            layers: vec![desc(b"l0"), desc(b"l1")],
            subject: Some(desc(b"subject")),
            ..Default::default()
        };
        let data = serde_json::to_vec(&manifest).unwrap();
        let refs = manifest_references(mediatype::IMAGE_MANIFEST, &data).unwrap();
        let kinds: Vec<_> = refs.iter().map(|r| r.kind).collect();
        assert_eq!(
            kinds,
            vec![RefKind::Blob, RefKind::Blob, RefKind::Blob, RefKind::Subject]
        );
        assert_eq!(refs[0].name, "config");
        assert_eq!(refs[3].name, "subject");
    }

    #[test]
    fn index_references_are_manifests() {
        let index = Index {
            schema_version: 2,
            media_type: Some(mediatype::IMAGE_INDEX.to_string()),
            manifests: vec![desc(b"m0")],
            ..Default::default()
        };
        let data = serde_json::to_vec(&index).unwrap();
        let refs = manifest_references(mediatype::IMAGE_INDEX, &data).unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].kind, RefKind::Manifest);
    }

    #[test]
    fn unknown_media_type_has_no_enforced_references() {
        let refs = manifest_references("application/x-custom", b"{\"whatever\": true}").unwrap();
        assert!(refs.is_empty());
    }

    #[test]
    fn malformed_manifest_is_invalid() {
        let err = manifest_references(mediatype::IMAGE_MANIFEST, b"not json").unwrap_err();
        assert!(err.is_code(&ErrorCode::MANIFEST_INVALID));
    }
}
