//! Handlers for the distribution protocol operations.

use axum::extract::Request;
use axum::http::{header, HeaderMap, HeaderName, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::StreamExt as _;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde_json::json;

use ociregistry::{
    mediatype, Descriptor, Digest, Error, ErrorCode, Listing, ReferrersRequest, Result,
    TagsRequest,
};

use crate::parse::query_value;
use crate::{page_not_found, read_body, stream_body, ServerState};

const DOCKER_CONTENT_DIGEST: HeaderName = HeaderName::from_static("docker-content-digest");
const OCI_CHUNK_MIN_LENGTH: HeaderName = HeaderName::from_static("oci-chunk-min-length");
const OCI_FILTERS_APPLIED: HeaderName = HeaderName::from_static("oci-filters-applied");

pub(crate) async fn get_blob(
    state: &ServerState,
    repo: &str,
    digest: &str,
    headers: &HeaderMap,
    head: bool,
) -> Result<Response> {
    let digest = Digest::parse(digest)?;

    if head {
        let desc = state.registry.resolve_blob(repo, &digest).await?;
        return Ok((
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, desc.media_type.clone()),
                (header::CONTENT_LENGTH, desc.size.to_string()),
                (DOCKER_CONTENT_DIGEST, desc.digest.to_string()),
            ],
        )
            .into_response());
    }

    if let Some((start, end)) = parse_range(headers) {
        let reader = state
            .registry
            .get_blob_range(repo, &digest, start, end)
            .await?;
        let desc = reader.descriptor().clone();
        let total = desc.size;
        let end = end.map_or(total, |e| e.min(total)).max(start);
        return Ok((
            StatusCode::PARTIAL_CONTENT,
            [
                (header::CONTENT_TYPE, desc.media_type.clone()),
                (header::CONTENT_LENGTH, (end - start).to_string()),
                (
                    header::CONTENT_RANGE,
                    format!("bytes {}-{}/{}", start, end.saturating_sub(1), total),
                ),
                (DOCKER_CONTENT_DIGEST, desc.digest.to_string()),
            ],
            stream_body(reader),
        )
            .into_response());
    }

    let reader = state.registry.get_blob(repo, &digest).await?;
    let desc = reader.descriptor().clone();
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, desc.media_type.clone()),
            (header::CONTENT_LENGTH, desc.size.to_string()),
            (DOCKER_CONTENT_DIGEST, desc.digest.to_string()),
        ],
        stream_body(reader),
    )
        .into_response())
}

pub(crate) async fn delete_blob(state: &ServerState, repo: &str, digest: &str) -> Result<Response> {
    let digest = Digest::parse(digest)?;
    state.registry.delete_blob(repo, &digest).await?;
    Ok(StatusCode::ACCEPTED.into_response())
}

pub(crate) async fn start_upload(
    state: &ServerState,
    repo: &str,
    params: &[(String, String)],
    req: Request,
) -> Result<Response> {
    if let (Some(mount), Some(from)) = (query_value(params, "mount"), query_value(params, "from")) {
        let digest = Digest::parse(mount)?;
        match state.registry.mount_blob(from, repo, &digest).await {
            Ok(desc) => {
                return Ok((
                    StatusCode::CREATED,
                    [
                        (header::LOCATION, blob_location(repo, &desc.digest)),
                        (DOCKER_CONTENT_DIGEST, desc.digest.to_string()),
                    ],
                )
                    .into_response());
            }
            // An absent source blob degrades to a regular upload session,
            // as the distribution spec requires.
            Err(err)
                if err.is_code(&ErrorCode::BLOB_UNKNOWN)
                    || err.is_code(&ErrorCode::NAME_UNKNOWN) =>
            {
                tracing::debug!(%from, error = %err, "cross-repository mount failed");
            }
            Err(err) => return Err(err),
        }
    }

    if let Some(digest) = query_value(params, "digest") {
        // Single-POST monolithic upload.
        let digest = Digest::parse(digest)?;
        let content = read_body(req).await?;
        let desc = Descriptor {
            media_type: mediatype::OCTET_STREAM.to_string(),
            digest,
            size: content.len() as u64,
            annotations: None,
            artifact_type: None,
        };
        let desc = state.registry.push_blob(repo, &desc, content).await?;
        return Ok((
            StatusCode::CREATED,
            [
                (header::LOCATION, blob_location(repo, &desc.digest)),
                (DOCKER_CONTENT_DIGEST, desc.digest.to_string()),
            ],
        )
            .into_response());
    }

    let writer = state.registry.push_blob_chunked(repo, 0).await?;
    Ok((
        StatusCode::ACCEPTED,
        [
            (header::LOCATION, upload_location(repo, writer.id())),
            (header::RANGE, "0-0".to_string()),
            (OCI_CHUNK_MIN_LENGTH, writer.chunk_size().to_string()),
        ],
    )
        .into_response())
}

pub(crate) async fn upload_status(state: &ServerState, repo: &str, id: &str) -> Result<Response> {
    let mut writer = state
        .registry
        .push_blob_chunked_resume(repo, id, -1, 0)
        .await?;
    let size = writer.size();
    writer.close().await?;
    Ok((
        StatusCode::NO_CONTENT,
        [
            (header::LOCATION, upload_location(repo, id)),
            (header::RANGE, format!("0-{}", size.saturating_sub(1))),
        ],
    )
        .into_response())
}

pub(crate) async fn patch_upload(
    state: &ServerState,
    repo: &str,
    id: &str,
    req: Request,
) -> Result<Response> {
    let range = content_range(req.headers())?;
    let offset = range.map_or(-1, |(start, _)| start as i64);
    let mut writer = state
        .registry
        .push_blob_chunked_resume(repo, id, offset, 0)
        .await?;
    let content = read_body(req).await?;
    if let Some((start, end)) = range {
        if end.saturating_sub(start) + 1 != content.len() as u64 {
            return Err(Error::new(
                ErrorCode::RANGE_INVALID,
                format!(
                    "Content-Range {}-{} does not match body length {}",
                    start,
                    end,
                    content.len()
                ),
            ));
        }
    }
    writer.write(content).await?;
    let size = writer.size();
    writer.close().await?;
    Ok((
        StatusCode::ACCEPTED,
        [
            (header::LOCATION, upload_location(repo, id)),
            (header::RANGE, format!("0-{}", size.saturating_sub(1))),
        ],
    )
        .into_response())
}

pub(crate) async fn put_upload(
    state: &ServerState,
    repo: &str,
    id: &str,
    params: &[(String, String)],
    req: Request,
) -> Result<Response> {
    let digest = query_value(params, "digest")
        .ok_or_else(|| Error::new(ErrorCode::DIGEST_INVALID, "no digest specified"))?;
    let digest = Digest::parse(digest)?;
    let mut writer = state
        .registry
        .push_blob_chunked_resume(repo, id, -1, 0)
        .await?;
    let content = read_body(req).await?;
    if !content.is_empty() {
        writer.write(content).await?;
    }
    let desc = writer.commit(digest).await?;
    Ok((
        StatusCode::CREATED,
        [
            (header::LOCATION, blob_location(repo, &desc.digest)),
            (DOCKER_CONTENT_DIGEST, desc.digest.to_string()),
        ],
    )
        .into_response())
}

pub(crate) async fn cancel_upload(state: &ServerState, repo: &str, id: &str) -> Result<Response> {
    let writer = state
        .registry
        .push_blob_chunked_resume(repo, id, -1, 0)
        .await?;
    writer.cancel().await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

pub(crate) async fn get_manifest(
    state: &ServerState,
    repo: &str,
    reference: &str,
    headers: &HeaderMap,
    head: bool,
) -> Result<Response> {
    let reader = match manifest_reference(reference)? {
        Some(digest) if head => {
            let desc = state.registry.resolve_manifest(repo, &digest).await?;
            return manifest_head_response(headers, desc);
        }
        Some(digest) => state.registry.get_manifest(repo, &digest).await?,
        None if !ociregistry::refname::is_valid_tag(reference) => {
            return Ok(page_not_found());
        }
        None if head => {
            let desc = state.registry.resolve_tag(repo, reference).await?;
            return manifest_head_response(headers, desc);
        }
        None => state.registry.get_tag(repo, reference).await?,
    };
    let desc = reader.descriptor().clone();
    if !acceptable(headers, &desc.media_type) {
        return Err(not_acceptable(&desc.media_type));
    }
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, desc.media_type.clone()),
            (header::CONTENT_LENGTH, desc.size.to_string()),
            (DOCKER_CONTENT_DIGEST, desc.digest.to_string()),
        ],
        stream_body(reader),
    )
        .into_response())
}

fn manifest_head_response(headers: &HeaderMap, desc: Descriptor) -> Result<Response> {
    if !acceptable(headers, &desc.media_type) {
        return Err(not_acceptable(&desc.media_type));
    }
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, desc.media_type.clone()),
            (header::CONTENT_LENGTH, desc.size.to_string()),
            (DOCKER_CONTENT_DIGEST, desc.digest.to_string()),
        ],
    )
        .into_response())
}

fn not_acceptable(media_type: &str) -> Error {
    Error::message(format!("media type {media_type} not accepted"))
        .with_http_status(StatusCode::NOT_ACCEPTABLE)
}

pub(crate) async fn put_manifest(
    state: &ServerState,
    repo: &str,
    reference: &str,
    req: Request,
) -> Result<Response> {
    let media_type = req
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| Error::new(ErrorCode::MANIFEST_INVALID, "no media type provided"))?;

    let (tag, digest) = match manifest_reference(reference)? {
        Some(digest) => (None, Some(digest)),
        None if ociregistry::refname::is_valid_tag(reference) => (Some(reference), None),
        None => return Ok(page_not_found()),
    };
    let contents = read_body(req).await?;
    let desc = state
        .registry
        .push_manifest(repo, tag, digest.as_ref(), contents, &media_type)
        .await?;
    Ok((
        StatusCode::CREATED,
        [
            (
                header::LOCATION,
                format!("/v2/{repo}/manifests/{}", desc.digest),
            ),
            (DOCKER_CONTENT_DIGEST, desc.digest.to_string()),
        ],
    )
        .into_response())
}

pub(crate) async fn delete_manifest(
    state: &ServerState,
    repo: &str,
    reference: &str,
) -> Result<Response> {
    match manifest_reference(reference)? {
        Some(digest) => state.registry.delete_manifest(repo, &digest).await?,
        None if ociregistry::refname::is_valid_tag(reference) => {
            state.registry.delete_tag(repo, reference).await?
        }
        None => return Ok(page_not_found()),
    }
    Ok(StatusCode::ACCEPTED.into_response())
}

pub(crate) async fn list_repositories(
    state: &ServerState,
    params: &[(String, String)],
) -> Result<Response> {
    let n = page_size(state, params);
    let last = query_value(params, "last").map(str::to_string);
    let listing = state.registry.repositories(last);
    let (repos, more) = paginate(listing, n).await?;
    let link = more
        .then(|| repos.last())
        .flatten()
        .map(|last| link_header(&format!("/v2/_catalog?n={n}&last={}", encode(last))));
    Ok(with_link(
        (StatusCode::OK, Json(json!({ "repositories": repos }))).into_response(),
        link,
    ))
}

pub(crate) async fn list_tags(
    state: &ServerState,
    repo: &str,
    params: &[(String, String)],
) -> Result<Response> {
    let n = page_size(state, params);
    let last = query_value(params, "last").map(str::to_string);
    let listing = state.registry.tags(repo, &TagsRequest { last });
    let (tags, more) = paginate(listing, n).await?;
    let link = more
        .then(|| tags.last())
        .flatten()
        .map(|last| link_header(&format!("/v2/{repo}/tags/list?n={n}&last={}", encode(last))));
    Ok(with_link(
        (StatusCode::OK, Json(json!({ "name": repo, "tags": tags }))).into_response(),
        link,
    ))
}

pub(crate) async fn list_referrers(
    state: &ServerState,
    repo: &str,
    digest: &str,
    artifact_type: Option<String>,
    params: &[(String, String)],
) -> Result<Response> {
    if state.opts.disable_referrers_api {
        return Ok(page_not_found());
    }
    let digest = Digest::parse(digest)?;
    let n = page_size(state, params);
    let filtered = artifact_type.is_some();
    let listing = state.registry.referrers(
        repo,
        &digest,
        &ReferrersRequest { artifact_type },
    );
    let (manifests, _more) = paginate(listing, n).await?;
    let body = json!({
        "schemaVersion": 2,
        "mediaType": mediatype::IMAGE_INDEX,
        "manifests": manifests,
    });
    let mut response = (
        StatusCode::OK,
        [(header::CONTENT_TYPE, mediatype::IMAGE_INDEX)],
        Json(body),
    )
        .into_response();
    if filtered {
        response.headers_mut().insert(
            OCI_FILTERS_APPLIED,
            http::HeaderValue::from_static("artifactType"),
        );
    }
    Ok(response)
}

// A reference is a digest when it contains a colon; anything else is
// treated as a tag by the caller.
fn manifest_reference(reference: &str) -> Result<Option<Digest>> {
    if reference.contains(':') {
        return Digest::parse(reference).map(Some);
    }
    Ok(None)
}

fn page_size(state: &ServerState, params: &[(String, String)]) -> usize {
    query_value(params, "n")
        .and_then(|n| n.parse::<usize>().ok())
        .map_or(state.opts.max_page_size, |n| {
            n.clamp(1, state.opts.max_page_size)
        })
}

async fn paginate<T>(mut listing: Listing<T>, n: usize) -> Result<(Vec<T>, bool)> {
    let mut items = Vec::new();
    while items.len() < n {
        match listing.next().await {
            Some(Ok(item)) => items.push(item),
            Some(Err(err)) => return Err(err),
            None => return Ok((items, false)),
        }
    }
    // Probe for one more item to decide whether a next page exists.
    match listing.next().await {
        Some(Ok(_)) => Ok((items, true)),
        Some(Err(err)) => Err(err),
        None => Ok((items, false)),
    }
}

fn link_header(next_url: &str) -> String {
    format!("<{next_url}>; rel=\"next\"")
}

fn with_link(mut response: Response, link: Option<String>) -> Response {
    if let Some(link) = link {
        if let Ok(value) = http::HeaderValue::from_str(&link) {
            response.headers_mut().insert(header::LINK, value);
        }
    }
    response
}

fn encode(value: &str) -> String {
    utf8_percent_encode(value, NON_ALPHANUMERIC).to_string()
}

fn blob_location(repo: &str, digest: &Digest) -> String {
    format!("/v2/{repo}/blobs/{digest}")
}

fn upload_location(repo: &str, id: &str) -> String {
    format!("/v2/{repo}/blobs/uploads/{id}")
}

// `Range: bytes=a-b` with an inclusive HTTP end; returns the engine's
// half-open form. Malformed or unsupported forms are ignored and the whole
// blob is served.
fn parse_range(headers: &HeaderMap) -> Option<(u64, Option<u64>)> {
    let value = headers.get(header::RANGE)?.to_str().ok()?;
    let spec = value.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start: u64 = start.trim().parse().ok()?;
    let end = end.trim();
    if end.is_empty() {
        return Some((start, None));
    }
    let end: u64 = end.parse().ok()?;
    Some((start, Some(end + 1)))
}

// `Content-Range: <start>-<end>` as sent on PATCH requests.
fn content_range(headers: &HeaderMap) -> Result<Option<(u64, u64)>> {
    let Some(value) = headers.get(header::CONTENT_RANGE) else {
        return Ok(None);
    };
    let malformed = || Error::new(ErrorCode::RANGE_INVALID, "malformed Content-Range header");
    let value = value.to_str().map_err(|_| malformed())?;
    let value = value.strip_prefix("bytes ").unwrap_or(value);
    let (start, end) = value.split_once('-').ok_or_else(malformed)?;
    let start: u64 = start.trim().parse().map_err(|_| malformed())?;
    let end: u64 = end.trim().parse().map_err(|_| malformed())?;
    if end < start {
        return Err(malformed());
    }
    Ok(Some((start, end)))
}

// Whether the stored media type satisfies the request's `Accept` headers.
// No `Accept` header means anything goes.
fn acceptable(headers: &HeaderMap, media_type: &str) -> bool {
    let mut saw_any = false;
    for value in headers.get_all(header::ACCEPT) {
        let Ok(value) = value.to_str() else { continue };
        for entry in value.split(',') {
            let entry = entry.split(';').next().unwrap_or("").trim();
            if entry.is_empty() {
                continue;
            }
            saw_any = true;
            if entry == "*/*" || entry == media_type {
                return true;
            }
            if let Some(prefix) = entry.strip_suffix("/*") {
                if media_type.split('/').next() == Some(prefix) {
                    return true;
                }
            }
        }
    }
    !saw_any
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_header_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(parse_range(&headers), None);

        headers.insert(header::RANGE, "bytes=2-5".parse().unwrap());
        assert_eq!(parse_range(&headers), Some((2, Some(6))));

        headers.insert(header::RANGE, "bytes=4-".parse().unwrap());
        assert_eq!(parse_range(&headers), Some((4, None)));

        headers.insert(header::RANGE, "chars=4-5".parse().unwrap());
        assert_eq!(parse_range(&headers), None);
    }

    #[test]
    fn content_range_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(content_range(&headers).unwrap(), None);

        headers.insert(header::CONTENT_RANGE, "3-5".parse().unwrap());
        assert_eq!(content_range(&headers).unwrap(), Some((3, 5)));

        headers.insert(header::CONTENT_RANGE, "5-3".parse().unwrap());
        assert!(content_range(&headers).is_err());
    }

    #[test]
    fn accept_header_matching() {
        let mut headers = HeaderMap::new();
        assert!(acceptable(&headers, mediatype::IMAGE_MANIFEST));

        headers.insert(
            header::ACCEPT,
            "application/vnd.oci.image.index.v1+json, application/vnd.oci.image.manifest.v1+json;q=0.5"
                .parse()
                .unwrap(),
        );
        assert!(acceptable(&headers, mediatype::IMAGE_MANIFEST));
        assert!(acceptable(&headers, mediatype::IMAGE_INDEX));
        assert!(!acceptable(&headers, "application/x-custom"));

        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT, "*/*".parse().unwrap());
        assert!(acceptable(&headers, "application/x-custom"));
    }
}
