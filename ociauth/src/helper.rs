//! Docker credential helper invocation.
//!
//! Helpers are external executables named `docker-credential-<store>`,
//! invoked as `docker-credential-<store> get` with the server URL on stdin
//! and a JSON `{"Username": ..., "Secret": ...}` response on stdout. The
//! [`HelperRunner`] trait is the seam tests use to substitute an in-process
//! fake for the subprocess.

use std::io::Write as _;
use std::process::{Command, Stdio};

use serde::Deserialize;
use thiserror::Error;

use crate::config::ConfigEntry;

/// A helper's username value indicating that the secret is a refresh token
/// rather than a password.
const TOKEN_USERNAME: &str = "<token>";

/// The stderr message helpers print when they simply have no credentials
/// for the requested server. Treated as an empty entry, not an error.
const NOT_FOUND_MESSAGE: &str = "credentials not found in native keychain";

/// Error from running a credential helper.
#[derive(Debug, Error)]
pub enum HelperError {
    /// The helper executable does not exist.
    #[error("helper not found: {0}")]
    NotFound(String),

    /// The helper ran but failed.
    #[error("error getting credentials: {0}")]
    Failed(String),

    /// The helper produced output that could not be decoded.
    #[error("cannot decode credential helper response: {0}")]
    Decode(String),
}

/// Runs credential helpers for a [`Config`](crate::Config).
///
/// The default implementation executes `docker-credential-<helper> get`;
/// tests provide an in-process implementation instead.
pub trait HelperRunner: Send + Sync + 'static {
    /// Look up the credentials `helper` holds for `server_url`.
    fn get(&self, helper: &str, server_url: &str) -> Result<ConfigEntry, HelperError>;
}

#[derive(Debug, Deserialize)]
struct HelperResponse {
    #[serde(rename = "Username", default)]
    username: String,
    #[serde(rename = "Secret", default)]
    secret: String,
}

/// [`HelperRunner`] that executes the helper as a subprocess.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecHelperRunner;

impl HelperRunner for ExecHelperRunner {
    fn get(&self, helper: &str, server_url: &str) -> Result<ConfigEntry, HelperError> {
        let program = format!("docker-credential-{helper}");
        tracing::debug!(helper = %program, server = %server_url, "running credential helper");
        let mut child = Command::new(&program)
            .arg("get")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| {
                if err.kind() == std::io::ErrorKind::NotFound {
                    HelperError::NotFound(format!("cannot execute {program:?}: {err}"))
                } else {
                    HelperError::Failed(err.to_string())
                }
            })?;

        child
            .stdin
            .take()
            .expect("stdin was piped")
            .write_all(server_url.as_bytes())
            .map_err(|err| HelperError::Failed(err.to_string()))?;

        let output = child
            .wait_with_output()
            .map_err(|err| HelperError::Failed(err.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            if stderr.trim() == NOT_FOUND_MESSAGE || stdout.trim() == NOT_FOUND_MESSAGE {
                return Ok(ConfigEntry::default());
            }
            let message = if stderr.trim().is_empty() {
                stdout.trim().to_string()
            } else {
                stderr.trim().to_string()
            };
            return Err(HelperError::Failed(message));
        }

        let response: HelperResponse = serde_json::from_slice(&output.stdout)
            .map_err(|err| HelperError::Decode(err.to_string()))?;
        Ok(entry_from_response(response))
    }
}

fn entry_from_response(response: HelperResponse) -> ConfigEntry {
    if response.username == TOKEN_USERNAME {
        ConfigEntry {
            refresh_token: response.secret,
            ..Default::default()
        }
    } else {
        ConfigEntry {
            username: response.username,
            password: response.secret,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_username_becomes_refresh_token() {
        let entry = entry_from_response(HelperResponse {
            username: "<token>".to_string(),
            secret: "sometoken".to_string(),
        });
        assert_eq!(entry.refresh_token, "sometoken");
        assert!(entry.username.is_empty());

        let entry = entry_from_response(HelperResponse {
            username: "someuser".to_string(),
            secret: "somesecret".to_string(),
        });
        assert_eq!(entry.username, "someuser");
        assert_eq!(entry.password, "somesecret");
    }
}
