//! Docker-style auth configuration.
//!
//! Configuration is discovered from, in order of precedence:
//!
//! 1. `DOCKER_AUTH_CONFIG` (inline JSON)
//! 2. `$DOCKER_CONFIG/config.json`
//! 3. `$HOME/.docker/config.json`
//! 4. `$XDG_RUNTIME_DIR/containers/auth.json`
//!
//! A missing configuration is not an error; it resolves every registry to
//! an empty entry.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use base64::prelude::{Engine as _, BASE64_STANDARD};
use serde::Deserialize;
use thiserror::Error;

use crate::helper::{ExecHelperRunner, HelperError, HelperRunner};

/// Error from loading or querying the auth configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path:?}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid config file {path:?}: {reason}")]
    Invalid { path: String, reason: String },

    /// Several URL-form `auths` keys resolve to the same host.
    #[error("more than one auths entry for {host:?} ({candidates})")]
    Ambiguous { host: String, candidates: String },

    #[error(transparent)]
    Helper(#[from] HelperError),
}

/// Credentials resolved for a registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigEntry {
    pub username: String,
    pub password: String,
    /// An identity token used to refresh short-lived access tokens.
    pub refresh_token: String,
    /// A token presented to the registry directly.
    pub access_token: String,
}

impl ConfigEntry {
    pub fn is_empty(&self) -> bool {
        self == &ConfigEntry::default()
    }
}

// The on-disk JSON shape.
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    auths: HashMap<String, FileEntry>,
    #[serde(default, rename = "credsStore")]
    creds_store: Option<String>,
    #[serde(default, rename = "credHelpers")]
    cred_helpers: HashMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
struct FileEntry {
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
    /// base64 of `username:password`; overrides the individual fields.
    #[serde(default)]
    auth: String,
    #[serde(default)]
    identitytoken: String,
    #[serde(default)]
    registrytoken: String,
}

/// A loaded auth configuration.
#[derive(Clone)]
pub struct Config {
    auths: HashMap<String, ConfigEntry>,
    creds_store: Option<String>,
    cred_helpers: HashMap<String, String>,
    runner: Arc<dyn HelperRunner>,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("auths", &self.auths.keys().collect::<Vec<_>>())
            .field("creds_store", &self.creds_store)
            .field("cred_helpers", &self.cred_helpers)
            .finish_non_exhaustive()
    }
}

impl Config {
    /// Load configuration from the process environment, running credential
    /// helpers as subprocesses.
    pub fn load() -> Result<Config, ConfigError> {
        Self::load_with(Arc::new(ExecHelperRunner))
    }

    /// Load configuration from the process environment with a custom helper
    /// runner.
    pub fn load_with(runner: Arc<dyn HelperRunner>) -> Result<Config, ConfigError> {
        Self::load_with_env(runner, |name| std::env::var(name).ok())
    }

    /// Load configuration reading environment variables through `env`.
    pub fn load_with_env(
        runner: Arc<dyn HelperRunner>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Config, ConfigError> {
        let getenv = |name: &str| env(name).filter(|v| !v.is_empty());

        if let Some(inline) = getenv("DOCKER_AUTH_CONFIG") {
            return Self::parse("$DOCKER_AUTH_CONFIG", &inline, runner);
        }

        let mut candidates = Vec::new();
        if let Some(dir) = getenv("DOCKER_CONFIG") {
            candidates.push(PathBuf::from(dir).join("config.json"));
        }
        if let Some(home) = getenv("HOME") {
            candidates.push(PathBuf::from(home).join(".docker").join("config.json"));
        }
        if let Some(runtime_dir) = getenv("XDG_RUNTIME_DIR") {
            candidates.push(PathBuf::from(runtime_dir).join("containers").join("auth.json"));
        }

        for path in candidates {
            let data = match std::fs::read_to_string(&path) {
                Ok(data) => data,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(source) => {
                    return Err(ConfigError::Read {
                        path: path.display().to_string(),
                        source,
                    })
                }
            };
            return Self::parse(&path.display().to_string(), &data, runner);
        }

        tracing::debug!("no docker auth configuration found; using empty config");
        Ok(Config {
            auths: HashMap::new(),
            creds_store: None,
            cred_helpers: HashMap::new(),
            runner,
        })
    }

    /// Parse configuration from JSON.
    pub fn parse(
        path: &str,
        data: &str,
        runner: Arc<dyn HelperRunner>,
    ) -> Result<Config, ConfigError> {
        let file: ConfigFile =
            serde_json::from_str(data).map_err(|err| ConfigError::Invalid {
                path: path.to_string(),
                reason: err.to_string(),
            })?;
        let mut auths = HashMap::with_capacity(file.auths.len());
        for (key, entry) in file.auths {
            let entry = resolve_entry(entry).map_err(|reason| ConfigError::Invalid {
                path: path.to_string(),
                reason: format!("cannot decode auth field for {key:?}: {reason}"),
            })?;
            auths.insert(key, entry);
        }
        Ok(Config {
            auths,
            creds_store: file.creds_store,
            cred_helpers: file.cred_helpers,
            runner,
        })
    }

    /// Resolve the credentials to use for a registry host.
    ///
    /// A helper configured for the host specifically must exist and
    /// succeed. A default store (`credsStore`) that is missing is ignored in
    /// favor of the static `auths` table. An exact `auths` key always wins
    /// over URL-form keys for the same host.
    pub fn entry_for_registry(&self, host: &str) -> Result<ConfigEntry, ConfigError> {
        let hostname = host_of(host);

        if let Some(helper) = self.cred_helpers.get(hostname) {
            return Ok(self.runner.get(helper, host)?);
        }

        if let Some(store) = &self.creds_store {
            match self.runner.get(store, host) {
                Ok(entry) => return Ok(entry),
                Err(HelperError::NotFound(err)) => {
                    tracing::debug!(store = %store, %err, "default credential store missing; using auths");
                }
                Err(err) => return Err(err.into()),
            }
        }

        if let Some(entry) = self.auths.get(host) {
            return Ok(entry.clone());
        }

        let mut candidates: Vec<&str> = self
            .auths
            .keys()
            .map(String::as_str)
            .filter(|key| *key != host && host_of(key) == hostname)
            .collect();
        match candidates.len() {
            0 => Ok(ConfigEntry::default()),
            1 => Ok(self.auths[candidates[0]].clone()),
            _ => {
                candidates.sort_unstable();
                Err(ConfigError::Ambiguous {
                    host: hostname.to_string(),
                    candidates: candidates.join(", "),
                })
            }
        }
    }
}

fn resolve_entry(file: FileEntry) -> Result<ConfigEntry, String> {
    let mut entry = ConfigEntry {
        username: file.username,
        password: file.password,
        refresh_token: file.identitytoken,
        access_token: file.registrytoken,
    };
    if !file.auth.is_empty() {
        let decoded = BASE64_STANDARD
            .decode(file.auth.as_bytes())
            .map_err(|_| "invalid base64-encoded string".to_string())?;
        let decoded = String::from_utf8(decoded)
            .map_err(|_| "decoded auth field is not utf-8".to_string())?;
        let (username, password) = decoded
            .split_once(':')
            .ok_or_else(|| "no colon in decoded auth field".to_string())?;
        entry.username = username.to_string();
        entry.password = password.to_string();
    }
    Ok(entry)
}

// Reduce an auths key or host argument to a bare hostname: strip any
// scheme and path so URL-form keys compare by host.
fn host_of(key: &str) -> &str {
    let rest = key
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(key);
    rest.split_once('/').map(|(host, _)| host).unwrap_or(rest)
}
