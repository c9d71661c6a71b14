//! Registry authorization scopes.
//!
//! A scope is a set of claims of the form `resource-type:resource-name:actions`,
//! e.g. `repository:foo/bar:pull,push` or `registry:catalog:*`. Scopes are
//! kept canonical: entries with the same resource type and name are merged,
//! their actions unioned, and everything is sorted for determinism.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use thiserror::Error;

/// Error from parsing a scope string.
#[derive(Debug, Error)]
#[error("invalid authorization scope {scope:?}: {reason}")]
pub struct ScopeError {
    scope: String,
    reason: &'static str,
}

/// A canonical set of authorization claims.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Scope {
    // (resource type, resource name) -> actions
    entries: BTreeMap<(String, String), BTreeSet<String>>,
}

impl Scope {
    /// The empty scope.
    pub fn empty() -> Self {
        Scope::default()
    }

    /// A scope with a single entry.
    pub fn new(
        resource_type: impl Into<String>,
        resource: impl Into<String>,
        actions: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        let mut scope = Scope::default();
        scope.entries.insert(
            (resource_type.into(), resource.into()),
            actions.into_iter().map(Into::into).collect(),
        );
        scope
    }

    /// `repository:<repo>:pull`
    pub fn pull(repo: &str) -> Self {
        Scope::new("repository", repo, ["pull"])
    }

    /// `repository:<repo>:push`
    pub fn push(repo: &str) -> Self {
        Scope::new("repository", repo, ["push"])
    }

    /// `registry:catalog:*`
    pub fn catalog() -> Self {
        Scope::new("registry", "catalog", ["*"])
    }

    /// Parse a space-separated list of scope entries.
    pub fn parse(s: &str) -> Result<Self, ScopeError> {
        let mut scope = Scope::default();
        for part in s.split_ascii_whitespace() {
            let err = |reason| ScopeError {
                scope: part.to_string(),
                reason,
            };
            let (resource_type, rest) = part
                .split_once(':')
                .ok_or_else(|| err("missing resource type"))?;
            let (resource, actions) = rest.rsplit_once(':').ok_or_else(|| err("missing actions"))?;
            if resource_type.is_empty() || resource.is_empty() || actions.is_empty() {
                return Err(err("empty component"));
            }
            scope
                .entries
                .entry((resource_type.to_string(), resource.to_string()))
                .or_default()
                .extend(actions.split(',').map(str::to_string));
        }
        Ok(scope)
    }

    /// The union of two scopes, merging entries for the same resource.
    pub fn union(mut self, other: &Scope) -> Scope {
        for (key, actions) in &other.entries {
            self.entries
                .entry(key.clone())
                .or_default()
                .extend(actions.iter().cloned());
        }
        self
    }

    /// Whether this scope grants everything `other` asks for.
    pub fn contains(&self, other: &Scope) -> bool {
        other.entries.iter().all(|(key, actions)| {
            self.entries.get(key).is_some_and(|have| {
                have.contains("*") || actions.iter().all(|a| have.contains(a))
            })
        })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, ((resource_type, resource), actions)) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            let actions = actions.iter().cloned().collect::<Vec<_>>().join(",");
            write!(f, "{resource_type}:{resource}:{actions}")?;
        }
        Ok(())
    }
}

/// The scope an outgoing registry request needs, attached to the request
/// as an [`http::Extensions`] value so the auth transport can see it.
#[derive(Debug, Clone)]
pub struct RequiredScope(pub Scope);
