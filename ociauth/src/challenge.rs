//! `WWW-Authenticate` challenge parsing.

/// A parsed authentication challenge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Challenge {
    /// The challenge scheme, lowercased (`bearer`, `basic`).
    pub scheme: String,
    /// The token endpoint, from the `realm` parameter.
    pub realm: String,
    pub service: String,
    pub scope: String,
}

/// Parse a `WWW-Authenticate` header value.
///
/// Handles the single-challenge form registries send:
/// `Bearer realm="https://auth.example.com/token",service="registry",scope="..."`.
pub fn parse_challenge(header: &str) -> Option<Challenge> {
    let header = header.trim();
    let (scheme, params) = match header.split_once(char::is_whitespace) {
        Some((scheme, params)) => (scheme, params.trim()),
        None => (header, ""),
    };
    if scheme.is_empty() {
        return None;
    }
    let mut challenge = Challenge {
        scheme: scheme.to_ascii_lowercase(),
        ..Default::default()
    };
    for (key, value) in parse_params(params) {
        match key.to_ascii_lowercase().as_str() {
            "realm" => challenge.realm = value,
            "service" => challenge.service = value,
            "scope" => challenge.scope = value,
            _ => {}
        }
    }
    Some(challenge)
}

// Parse comma-separated `key="value"` (or bare `key=value`) parameters.
fn parse_params(mut s: &str) -> Vec<(String, String)> {
    let mut params = Vec::new();
    loop {
        s = s.trim_start_matches(|c: char| c.is_whitespace() || c == ',');
        if s.is_empty() {
            return params;
        }
        let Some(eq) = s.find('=') else {
            return params;
        };
        let key = s[..eq].trim().to_string();
        s = &s[eq + 1..];
        let value;
        if let Some(rest) = s.strip_prefix('"') {
            let mut out = String::new();
            let mut chars = rest.char_indices();
            let mut consumed = rest.len();
            while let Some((i, c)) = chars.next() {
                match c {
                    '\\' => {
                        if let Some((_, escaped)) = chars.next() {
                            out.push(escaped);
                        }
                    }
                    '"' => {
                        consumed = i + 1;
                        break;
                    }
                    _ => out.push(c),
                }
            }
            value = out;
            s = &rest[consumed..];
        } else {
            let end = s.find(',').unwrap_or(s.len());
            value = s[..end].trim().to_string();
            s = &s[end..];
        }
        params.push((key, value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_challenge() {
        let challenge = parse_challenge(
            r#"Bearer realm="https://auth.example.com/token",service="registry.example.com",scope="repository:foo/bar:pull""#,
        )
        .unwrap();
        assert_eq!(challenge.scheme, "bearer");
        assert_eq!(challenge.realm, "https://auth.example.com/token");
        assert_eq!(challenge.service, "registry.example.com");
        assert_eq!(challenge.scope, "repository:foo/bar:pull");
    }

    #[test]
    fn basic_challenge_without_params() {
        let challenge = parse_challenge(r#"Basic realm="registry""#).unwrap();
        assert_eq!(challenge.scheme, "basic");
        assert_eq!(challenge.realm, "registry");
    }

    #[test]
    fn quoted_values_with_escapes_and_spaces() {
        let challenge = parse_challenge(r#"Bearer realm="https://x/t", service="a \"b\"""#).unwrap();
        assert_eq!(challenge.realm, "https://x/t");
        assert_eq!(challenge.service, r#"a "b""#);
    }
}
