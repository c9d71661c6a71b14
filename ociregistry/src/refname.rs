//! Validation of repository names and tags.

use std::sync::LazyLock;

use regex::Regex;

static REPO_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]+(?:[._-][a-z0-9]+)*(?:/[a-z0-9]+(?:[._-][a-z0-9]+)*)*$")
        .expect("repository name regex compiles")
});

static TAG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9._-]{0,127}$").expect("tag regex compiles")
});

/// Whether `name` is a valid repository name (lowercase path components
/// separated by slashes).
pub fn is_valid_repo_name(name: &str) -> bool {
    REPO_NAME_RE.is_match(name)
}

/// Whether `tag` is a valid tag name.
pub fn is_valid_tag(tag: &str) -> bool {
    TAG_RE.is_match(tag)
}
