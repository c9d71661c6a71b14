//! Request path parsing.
//!
//! Repository names span an arbitrary number of path segments, so the
//! `/v2/` tree cannot be expressed as router path parameters; requests are
//! matched against the distribution protocol's route shapes with greedy
//! name capture instead.

use std::borrow::Cow;
use std::sync::LazyLock;

use percent_encoding::percent_decode_str;
use regex::Regex;

/// A parsed request path under `/v2/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Route {
    Base,
    Catalog,
    Blob { repo: String, digest: String },
    UploadStart { repo: String },
    Upload { repo: String, id: String },
    Manifest { repo: String, reference: String },
    TagsList { repo: String },
    Referrers { repo: String, digest: String },
}

static BLOB_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/v2/(.+)/blobs/([^/]+)$").expect("route regex"));
static UPLOAD_START_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/v2/(.+)/blobs/uploads/$").expect("route regex"));
static UPLOAD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/v2/(.+)/blobs/uploads/([^/]+)$").expect("route regex"));
static MANIFEST_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/v2/(.+)/manifests/([^/]+)$").expect("route regex"));
static TAGS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/v2/(.+)/tags/list$").expect("route regex"));
static REFERRERS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/v2/(.+)/referrers/([^/]+)$").expect("route regex"));

pub(crate) fn parse_path(path: &str) -> Option<Route> {
    if path == "/v2" || path == "/v2/" {
        return Some(Route::Base);
    }
    if path == "/v2/_catalog" {
        return Some(Route::Catalog);
    }
    // Upload routes nest under the blob routes, so they match first.
    if let Some(c) = UPLOAD_START_RE.captures(path) {
        return Some(Route::UploadStart {
            repo: decode(&c[1])?,
        });
    }
    if let Some(c) = UPLOAD_RE.captures(path) {
        // `.../blobs/uploads/<id>` also matches the blob route with a repo
        // name ending in "/uploads"; the more specific reading wins.
        return Some(Route::Upload {
            repo: decode(&c[1])?,
            id: decode(&c[2])?,
        });
    }
    if let Some(c) = BLOB_RE.captures(path) {
        return Some(Route::Blob {
            repo: decode(&c[1])?,
            digest: decode(&c[2])?,
        });
    }
    if let Some(c) = MANIFEST_RE.captures(path) {
        return Some(Route::Manifest {
            repo: decode(&c[1])?,
            reference: decode(&c[2])?,
        });
    }
    if let Some(c) = TAGS_RE.captures(path) {
        return Some(Route::TagsList {
            repo: decode(&c[1])?,
        });
    }
    if let Some(c) = REFERRERS_RE.captures(path) {
        return Some(Route::Referrers {
            repo: decode(&c[1])?,
            digest: decode(&c[2])?,
        });
    }
    None
}

/// Decode the query string into key/value pairs.
pub(crate) fn query_params(query: Option<&str>) -> Vec<(String, String)> {
    let Some(query) = query else {
        return Vec::new();
    };
    query
        .split('&')
        .filter(|part| !part.is_empty())
        .filter_map(|part| {
            let (key, value) = part.split_once('=').unwrap_or((part, ""));
            Some((decode(key)?, decode(value)?))
        })
        .collect()
}

pub(crate) fn query_value<'a>(params: &'a [(String, String)], key: &str) -> Option<&'a str> {
    params
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

fn decode(component: &str) -> Option<String> {
    match percent_decode_str(component).decode_utf8().ok()? {
        Cow::Borrowed(s) => Some(s.to_string()),
        Cow::Owned(s) => Some(s),
    }
}
