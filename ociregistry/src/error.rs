//! The OCI registry error model.
//!
//! Errors carry up to three orthogonal pieces of information: a structured
//! OCI error code (`BLOB_UNKNOWN`, `DENIED`, ...), an optional HTTP status
//! taken from a response, and an optional JSON detail payload. Wrapping an
//! error with context preserves all three, and the wire form
//! (`{"errors":[{"code","message","detail"}]}`) round-trips through JSON.

use std::borrow::Cow;
use std::fmt;

use http::StatusCode;
use serde::{Deserialize, Serialize};

/// Boxed error type used for transport and I/O error sources.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result alias used throughout the registry crates.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A structured OCI error code such as `BLOB_UNKNOWN`.
///
/// Known codes carry a default HTTP status; unknown codes (for example ones
/// minted by a remote registry) are preserved verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorCode(Cow<'static, str>);

macro_rules! error_codes {
    ($(($const_name:ident, $code:literal, $status:expr, $message:literal, $ctor:ident);)*) => {
        impl ErrorCode {
            $(
                pub const $const_name: ErrorCode = ErrorCode(Cow::Borrowed($code));
            )*

            /// The default HTTP status associated with this code, if the
            /// code is one the registry protocol knows about.
            pub fn default_status(&self) -> Option<StatusCode> {
                match self.as_str() {
                    $($code => Some($status),)*
                    _ => None,
                }
            }
        }

        impl Error {
            $(
                #[doc = concat!("A new `", $code, "` error with its standard message.")]
                pub fn $ctor() -> Error {
                    Error::new(ErrorCode::$const_name, $message)
                }
            )*
        }
    };
}

error_codes! {
    (BLOB_UNKNOWN, "BLOB_UNKNOWN", StatusCode::NOT_FOUND, "blob unknown to registry", blob_unknown);
    (BLOB_UPLOAD_INVALID, "BLOB_UPLOAD_INVALID", StatusCode::RANGE_NOT_SATISFIABLE, "blob upload invalid", blob_upload_invalid);
    (BLOB_UPLOAD_UNKNOWN, "BLOB_UPLOAD_UNKNOWN", StatusCode::NOT_FOUND, "blob upload unknown to registry", blob_upload_unknown);
    (DIGEST_INVALID, "DIGEST_INVALID", StatusCode::BAD_REQUEST, "provided digest did not match uploaded content", digest_invalid);
    (MANIFEST_BLOB_UNKNOWN, "MANIFEST_BLOB_UNKNOWN", StatusCode::NOT_FOUND, "manifest references a manifest or blob unknown to registry", manifest_blob_unknown);
    (MANIFEST_INVALID, "MANIFEST_INVALID", StatusCode::BAD_REQUEST, "manifest invalid", manifest_invalid);
    (MANIFEST_UNKNOWN, "MANIFEST_UNKNOWN", StatusCode::NOT_FOUND, "manifest unknown to registry", manifest_unknown);
    (NAME_INVALID, "NAME_INVALID", StatusCode::BAD_REQUEST, "invalid repository name", name_invalid);
    (NAME_UNKNOWN, "NAME_UNKNOWN", StatusCode::NOT_FOUND, "repository name not known to registry", name_unknown);
    (SIZE_INVALID, "SIZE_INVALID", StatusCode::BAD_REQUEST, "provided length did not match content length", size_invalid);
    (UNAUTHORIZED, "UNAUTHORIZED", StatusCode::UNAUTHORIZED, "authentication required", unauthorized);
    (DENIED, "DENIED", StatusCode::FORBIDDEN, "requested access to the resource is denied", denied);
    (UNSUPPORTED, "UNSUPPORTED", StatusCode::BAD_REQUEST, "the operation is unsupported", unsupported);
    (TOOMANYREQUESTS, "TOOMANYREQUESTS", StatusCode::TOO_MANY_REQUESTS, "too many requests", too_many_requests);
    (RANGE_INVALID, "RANGE_INVALID", StatusCode::RANGE_NOT_SATISFIABLE, "invalid content range", range_invalid);
}

impl ErrorCode {
    /// The generic code used when no structured code is available.
    pub const UNKNOWN: ErrorCode = ErrorCode(Cow::Borrowed("UNKNOWN"));

    /// A code from an arbitrary string, as received on the wire.
    pub fn new(code: impl Into<String>) -> Self {
        ErrorCode(Cow::Owned(code.into()))
    }

    /// The code in its wire form, e.g. `BLOB_UNKNOWN`.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The code rendered as human-readable words, e.g. `blob unknown`.
    /// Used as the leading segment of error messages.
    pub fn words(&self) -> String {
        self.0.to_lowercase().replace('_', " ")
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error from a registry operation.
///
/// The variants mirror the ways an error can be produced: directly with a
/// code (`Coded`), decoded from a wire response (`Wire`), attached to an
/// HTTP response (`Http`), wrapped with context (`Context`), or carried
/// through from an underlying source such as a transport (`Other`).
///
/// Code, detail and HTTP status queries traverse the wrapping structure, so
/// `err.context("fetching blob")` still reports `BLOB_UNKNOWN`.
#[derive(Debug)]
pub enum Error {
    /// An error with a structured OCI code.
    Coded {
        code: ErrorCode,
        message: String,
        detail: Option<serde_json::Value>,
    },

    /// An error bound to an HTTP response.
    ///
    /// If the inner code has a known default status that default wins when
    /// the error surfaces to HTTP; the response status is then retained only
    /// in the message. An unknown code uses the response status verbatim.
    Http {
        status: StatusCode,
        headers: http::HeaderMap,
        body: Option<bytes::Bytes>,
        source: Box<Error>,
    },

    /// An error wrapped with contextual prose.
    Context { context: String, source: Box<Error> },

    /// Errors decoded from the JSON wire form. Matches any entry by code.
    Wire {
        errors: WireErrors,
        status: Option<StatusCode>,
    },

    /// An error with no registry structure (I/O, transport, ...).
    Other(BoxError),
}

impl Error {
    /// A new coded error.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Error::Coded {
            code,
            message: message.into(),
            detail: None,
        }
    }

    /// Attach a structured detail payload.
    pub fn with_detail(mut self, value: serde_json::Value) -> Self {
        if let Error::Coded { detail, .. } = &mut self {
            *detail = Some(value);
        }
        self
    }

    /// An error from an arbitrary source with no OCI code.
    pub fn other(err: impl Into<BoxError>) -> Self {
        Error::Other(err.into())
    }

    /// An error from a plain message with no OCI code.
    pub fn message(msg: impl Into<String>) -> Self {
        Error::Other(msg.into().into())
    }

    /// Wrap this error with contextual prose, preserving code, detail and
    /// status.
    pub fn context(self, context: impl Into<String>) -> Self {
        Error::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Bind this error to an HTTP response status.
    pub fn with_http_status(self, status: StatusCode) -> Self {
        Error::Http {
            status,
            headers: http::HeaderMap::new(),
            body: None,
            source: Box::new(self),
        }
    }

    /// Bind this error to an HTTP response, keeping the interesting parts.
    pub fn with_http_response(
        self,
        status: StatusCode,
        headers: http::HeaderMap,
        body: Option<bytes::Bytes>,
    ) -> Self {
        Error::Http {
            status,
            headers,
            body,
            source: Box::new(self),
        }
    }

    /// The outermost OCI code in the chain, if any.
    pub fn code(&self) -> Option<&ErrorCode> {
        match self {
            Error::Coded { code, .. } => Some(code),
            Error::Http { source, .. } | Error::Context { source, .. } => source.code(),
            Error::Wire { errors, .. } => errors.errors.first().map(|e| &e.code),
            Error::Other(_) => None,
        }
    }

    /// Whether any layer of this error carries the given code.
    pub fn is_code(&self, code: &ErrorCode) -> bool {
        match self {
            Error::Coded { code: c, .. } => c == code,
            Error::Http { source, .. } | Error::Context { source, .. } => source.is_code(code),
            Error::Wire { errors, .. } => errors.errors.iter().any(|e| &e.code == code),
            Error::Other(_) => false,
        }
    }

    /// The structured detail payload, if any layer carries one.
    pub fn detail(&self) -> Option<&serde_json::Value> {
        match self {
            Error::Coded { detail, .. } => detail.as_ref(),
            Error::Http { source, .. } | Error::Context { source, .. } => source.detail(),
            Error::Wire { errors, .. } => errors.errors.iter().find_map(|e| e.detail.as_ref()),
            Error::Other(_) => None,
        }
    }

    /// The status of the HTTP response this error was decoded from, if any.
    pub fn response_status(&self) -> Option<StatusCode> {
        match self {
            Error::Http { status, .. } => Some(*status),
            Error::Context { source, .. } => source.response_status(),
            Error::Wire { status, .. } => *status,
            _ => None,
        }
    }

    /// The body of the HTTP response this error was decoded from, if any.
    pub fn response_body(&self) -> Option<&bytes::Bytes> {
        match self {
            Error::Http { body, .. } => body.as_ref(),
            Error::Context { source, .. } => source.response_body(),
            _ => None,
        }
    }

    /// The HTTP status this error should surface with.
    ///
    /// A known code's default status always wins; a wrapped response status
    /// is used only for unknown codes, and everything else is a 500.
    pub fn http_status(&self) -> StatusCode {
        if let Some(status) = self.code().and_then(ErrorCode::default_status) {
            return status;
        }
        self.response_status()
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    /// Marshal this error into its wire form, along with the HTTP status it
    /// should be served with.
    pub fn to_wire(&self) -> (WireErrors, StatusCode) {
        let status = self.http_status();
        if let Some(errors) = self.wire_entries() {
            return (errors.clone(), status);
        }
        let code = self.code().cloned().unwrap_or(ErrorCode::UNKNOWN);
        let mut message = self.render(status);
        // A leading code prefix repeats what the code field already says.
        let prefix = format!("{}: ", code.words());
        if let Some(stripped) = message.strip_prefix(&prefix) {
            message = stripped.to_string();
        }
        let wire = WireErrors {
            errors: vec![WireError {
                code,
                message,
                detail: self.detail().cloned(),
            }],
        };
        (wire, status)
    }

    fn wire_entries(&self) -> Option<&WireErrors> {
        match self {
            Error::Wire { errors, .. } => Some(errors),
            Error::Http { source, .. } | Error::Context { source, .. } => source.wire_entries(),
            _ => None,
        }
    }

    // Render the message for the wire form: like Display, except that an
    // HTTP layer whose status equals the final marshal status would be
    // redundant and is dropped.
    fn render(&self, final_status: StatusCode) -> String {
        match self {
            Error::Http { status, source, .. } if *status == final_status => {
                source.render(final_status)
            }
            Error::Http { status, source, .. } => {
                format!("{}: {}", status_line(*status), source.render(final_status))
            }
            Error::Context { context, source } => {
                format!("{}: {}", context, source.render(final_status))
            }
            _ => self.to_string(),
        }
    }
}

fn status_line(status: StatusCode) -> String {
    match status.canonical_reason() {
        Some(reason) => format!("{} {}", status.as_u16(), reason),
        None => status.as_u16().to_string(),
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Coded { code, message, .. } => write!(f, "{}: {}", code.words(), message),
            Error::Http { status, source, .. } => {
                write!(f, "{}: {}", status_line(*status), source)
            }
            Error::Context { context, source } => write!(f, "{}: {}", context, source),
            Error::Wire { errors, .. } => errors.fmt(f),
            Error::Other(err) => err.fmt(f),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Http { source, .. } | Error::Context { source, .. } => Some(source.as_ref()),
            Error::Other(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<WireErrors> for Error {
    fn from(errors: WireErrors) -> Self {
        Error::Wire {
            errors,
            status: None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Other(err.into())
    }
}

/// The JSON wire form of registry errors:
/// `{"errors":[{"code":...,"message":...,"detail":...}]}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireErrors {
    pub errors: Vec<WireError>,
}

/// One entry in the wire error body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    pub code: ErrorCode,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

impl fmt::Display for WireErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, e) in self.errors.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}: {}", e.code.words(), e.message)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn marshal(err: &Error) -> (String, StatusCode) {
        let (wire, status) = err.to_wire();
        (serde_json::to_string(&wire).unwrap(), status)
    }

    #[test]
    fn plain_error_marshals_as_unknown() {
        let err = Error::message("unknown error");
        assert_eq!(err.to_string(), "unknown error");
        let (data, status) = marshal(&err);
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            data,
            r#"{"errors":[{"code":"UNKNOWN","message":"unknown error"}]}"#
        );
    }

    #[test]
    fn registry_error() {
        let err = Error::blob_unknown();
        assert_eq!(err.to_string(), "blob unknown: blob unknown to registry");
        let (data, status) = marshal(&err);
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(
            data,
            r#"{"errors":[{"code":"BLOB_UNKNOWN","message":"blob unknown to registry"}]}"#
        );
    }

    #[test]
    fn wrapped_registry_error_keeps_code_and_status() {
        let err = Error::blob_unknown().context("some context");
        assert_eq!(
            err.to_string(),
            "some context: blob unknown: blob unknown to registry"
        );
        assert!(err.is_code(&ErrorCode::BLOB_UNKNOWN));
        let (data, status) = marshal(&err);
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(
            data,
            r#"{"errors":[{"code":"BLOB_UNKNOWN","message":"some context: blob unknown: blob unknown to registry"}]}"#
        );
    }

    #[test]
    fn http_status_ignored_with_known_code() {
        let err = Error::blob_unknown()
            .context("some context")
            .with_http_status(StatusCode::UNAUTHORIZED);
        assert_eq!(
            err.to_string(),
            "401 Unauthorized: some context: blob unknown: blob unknown to registry"
        );
        // The "401 Unauthorized" stays in the message because it is not
        // redundant with respect to the 404 response code.
        let (data, status) = marshal(&err);
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(
            data,
            r#"{"errors":[{"code":"BLOB_UNKNOWN","message":"401 Unauthorized: some context: blob unknown: blob unknown to registry"}]}"#
        );
    }

    #[test]
    fn http_status_used_with_unknown_code() {
        let err = Error::new(ErrorCode::new("SOME_CODE"), "a message with a code")
            .with_http_status(StatusCode::UNAUTHORIZED);
        assert_eq!(
            err.to_string(),
            "401 Unauthorized: some code: a message with a code"
        );
        let (data, status) = marshal(&err);
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(
            data,
            r#"{"errors":[{"code":"SOME_CODE","message":"a message with a code"}]}"#
        );
    }

    #[test]
    fn error_with_detail() {
        let err = Error::new(ErrorCode::new("SOME_CODE"), "a message with some detail")
            .with_detail(serde_json::json!({"foo": true}));
        assert_eq!(err.to_string(), "some code: a message with some detail");
        let (data, status) = marshal(&err);
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            data,
            r#"{"errors":[{"code":"SOME_CODE","message":"a message with some detail","detail":{"foo":true}}]}"#
        );
    }

    #[test]
    fn wire_round_trip_preserves_code_and_detail() {
        let err = Error::digest_invalid()
            .with_detail(serde_json::json!({"offset": 3}))
            .context("push failed");
        let (wire, _) = err.to_wire();
        let data = serde_json::to_vec(&wire).unwrap();
        let decoded: WireErrors = serde_json::from_slice(&data).unwrap();
        let decoded = Error::from(decoded);
        assert!(decoded.is_code(&ErrorCode::DIGEST_INVALID));
        assert_eq!(decoded.detail(), Some(&serde_json::json!({"offset": 3})));
    }

    #[test]
    fn unknown_codes_round_trip_verbatim() {
        let body = r#"{"errors":[{"code":"FROBNICATED","message":"no"}]}"#;
        let decoded: WireErrors = serde_json::from_str(body).unwrap();
        let err = Error::from(decoded).with_http_status(StatusCode::IM_A_TEAPOT);
        assert!(err.is_code(&ErrorCode::new("FROBNICATED")));
        assert_eq!(err.http_status(), StatusCode::IM_A_TEAPOT);
    }
}
