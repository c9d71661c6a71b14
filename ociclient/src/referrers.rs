//! Referrers discovery, including the fallback tag scheme.

use ociregistry::{Digest, ErrorCode, Index, Result};

use crate::Client;

// Components of the fallback tag, truncated per the distribution spec.
const MAX_ALGORITHM_CHARS: usize = 32;
const MAX_ENCODED_CHARS: usize = 64;

/// The tag conventionally holding an index of a digest's referrers, for
/// registries without the referrers API: `<algorithm>-<encoded>` with each
/// component truncated and characters outside the tag alphabet replaced by
/// hyphens.
pub(crate) fn referrers_tag(digest: &Digest) -> String {
    format!(
        "{}-{}",
        clean_component(digest.algorithm(), MAX_ALGORITHM_CHARS),
        clean_component(digest.encoded(), MAX_ENCODED_CHARS),
    )
}

fn clean_component(component: &str, max: usize) -> String {
    component
        .chars()
        .take(max)
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

impl Client {
    /// List referrers through the fallback tag: the tag names an index
    /// whose `manifests` field enumerates the referrers. A missing tag
    /// means no referrers. Any artifact-type filter is applied here, on the
    /// client side.
    pub(crate) async fn referrers_from_tag(
        &self,
        repo: &str,
        digest: &Digest,
        artifact_type: Option<&str>,
    ) -> Result<Vec<ociregistry::Descriptor>> {
        let tag = referrers_tag(digest);
        tracing::debug!(%repo, %tag, "falling back to referrers tag");
        let reader = match self.get_tag_inner(repo, &tag).await {
            Ok(reader) => reader,
            Err(err)
                if err.is_code(&ErrorCode::MANIFEST_UNKNOWN)
                    || err.is_code(&ErrorCode::NAME_UNKNOWN)
                    || err.response_status() == Some(http::StatusCode::NOT_FOUND) =>
            {
                return Ok(Vec::new());
            }
            Err(err) => return Err(err),
        };
        let data = reader.bytes().await?;
        let index: Index = serde_json::from_slice(&data)
            .map_err(|err| ociregistry::Error::other(err).context("invalid referrers index"))?;
        let mut manifests = index.manifests;
        if let Some(filter) = artifact_type {
            manifests.retain(|desc| desc.artifact_type.as_deref() == Some(filter));
        }
        Ok(manifests)
    }
}
