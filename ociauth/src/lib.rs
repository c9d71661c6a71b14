//! # ociauth
//!
//! Docker-style registry authentication.
//!
//! [`Config`] discovers and resolves credentials the way docker does:
//! config files found through the usual environment precedence chain,
//! `auths` entries (including URL-form keys and base64 `auth` fields), and
//! credential helper subprocesses behind the injectable [`HelperRunner`]
//! seam.
//!
//! [`AuthLayer`] turns a [`Config`] into a tower layer that answers
//! `WWW-Authenticate` challenges, caching bearer tokens by the canonical
//! [`Scope`] attached to each request via [`RequiredScope`].

mod challenge;
mod config;
mod helper;
mod scope;
mod transport;

pub use self::challenge::{parse_challenge, Challenge};
pub use self::config::{Config, ConfigEntry, ConfigError};
pub use self::helper::{ExecHelperRunner, HelperError, HelperRunner};
pub use self::scope::{RequiredScope, Scope, ScopeError};
pub use self::transport::{basic_auth, AuthLayer, AuthService};
