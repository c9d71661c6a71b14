//! Content digests in `<algorithm>:<encoded>` form.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256, Sha512};

use crate::error::{Error, Result};

// Grammar from the OCI image spec: a lowercase algorithm (possibly with
// component separators) and a base64ish encoded section.
static DIGEST_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]+(?:[.+_-][a-z0-9]+)*:[a-zA-Z0-9=_-]+$").expect("digest regex compiles")
});

/// A content digest, e.g. `sha256:e3b0c4...`.
///
/// Canonical algorithms (`sha256`, `sha512`) can be recomputed from content;
/// digests under any other algorithm are accepted verbatim when a client
/// provides them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Digest(String);

impl Digest {
    /// The canonical digest of the given content, using sha256.
    pub fn from_bytes(data: &[u8]) -> Self {
        Digest(format!("sha256:{}", hex::encode(Sha256::digest(data))))
    }

    /// Parse and validate a digest string.
    pub fn parse(s: &str) -> Result<Self> {
        if !Self::is_valid(s) {
            return Err(Error::new(
                crate::ErrorCode::DIGEST_INVALID,
                "badly formed digest",
            ));
        }
        Ok(Digest(s.to_string()))
    }

    /// Whether `s` is a syntactically valid digest.
    pub fn is_valid(s: &str) -> bool {
        if !DIGEST_RE.is_match(s) {
            return false;
        }
        let (algorithm, encoded) = s.split_once(':').expect("regex requires a colon");
        match algorithm {
            // Canonical algorithms must be full lowercase hex of exact length.
            "sha256" => encoded.len() == 64 && is_lower_hex(encoded),
            "sha512" => encoded.len() == 128 && is_lower_hex(encoded),
            _ => true,
        }
    }

    /// The algorithm part, e.g. `sha256`.
    pub fn algorithm(&self) -> &str {
        self.0.split_once(':').map(|(a, _)| a).unwrap_or(&self.0)
    }

    /// The encoded part after the colon.
    pub fn encoded(&self) -> &str {
        self.0.split_once(':').map(|(_, e)| e).unwrap_or("")
    }

    /// Whether the digest uses an algorithm this crate can recompute.
    pub fn is_canonical(&self) -> bool {
        matches!(self.algorithm(), "sha256" | "sha512")
    }

    /// A verifier that consumes content and reports whether it matches.
    ///
    /// Non-canonical digests cannot be recomputed, so their verifier
    /// accepts any content.
    pub fn verifier(&self) -> Verifier {
        let hasher = match self.algorithm() {
            "sha256" => Some(Hasher::Sha256(Sha256::new())),
            "sha512" => Some(Hasher::Sha512(Sha512::new())),
            _ => None,
        };
        Verifier {
            want: self.clone(),
            hasher,
        }
    }

    /// Verify the digest against fully materialized content.
    pub fn matches(&self, data: &[u8]) -> bool {
        let mut v = self.verifier();
        v.write(data);
        v.verified()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn is_lower_hex(s: &str) -> bool {
    s.bytes()
        .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Digest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Digest::parse(s)
    }
}

impl AsRef<str> for Digest {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Verifies streamed content against an expected digest.
#[derive(Debug)]
pub struct Verifier {
    want: Digest,
    hasher: Option<Hasher>,
}

impl Verifier {
    /// Feed content bytes into the verifier.
    pub fn write(&mut self, data: &[u8]) {
        if let Some(hasher) = &mut self.hasher {
            hasher.update(data);
        }
    }

    /// Whether the content consumed so far matches the digest.
    pub fn verified(self) -> bool {
        match self.hasher {
            Some(hasher) => hasher.finalize() == self.want,
            // Non-canonical algorithm: accepted verbatim.
            None => true,
        }
    }
}

/// Incrementally computes a canonical digest, for callers that stream
/// content through without holding it all in memory.
#[derive(Debug, Default)]
pub struct Digester(Sha256);

impl Digester {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finalize(self) -> Digest {
        Digest(format!("sha256:{}", hex::encode(self.0.finalize())))
    }
}

#[derive(Debug)]
enum Hasher {
    Sha256(Sha256),
    Sha512(Sha512),
}

impl Hasher {
    fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Sha256(h) => h.update(data),
            Hasher::Sha512(h) => h.update(data),
        }
    }

    fn finalize(self) -> Digest {
        match self {
            Hasher::Sha256(h) => Digest(format!("sha256:{}", hex::encode(h.finalize()))),
            Hasher::Sha512(h) => Digest(format!("sha512:{}", hex::encode(h.finalize()))),
        }
    }
}
